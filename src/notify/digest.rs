//! HTML rendering of the history digest.
//!
//! Templates are minijinja documents receiving a single `history` value: a
//! map from job name to a list of rows, newest first. Each row carries
//! `status`, `success`, `skip`, `start`, `end`, `duration` and `error`.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::{context, Environment};
use serde::Serialize;

use super::NotifyError;
use crate::history::HistoryMap;
use crate::stat::{format_duration, Stat};

pub const DEFAULT_TEMPLATE: &str = include_str!("../../templates/history.html");

// The .html suffix turns on auto-escaping.
const TEMPLATE_NAME: &str = "history.html";

#[derive(Debug, Serialize)]
struct Row<'a> {
    status: &'static str,
    success: bool,
    skip: bool,
    start: &'a str,
    end: &'a str,
    duration: String,
    error: Option<&'a str>,
}

impl<'a> From<&'a Stat> for Row<'a> {
    fn from(stat: &'a Stat) -> Self {
        Self {
            status: stat.status(),
            success: stat.success,
            skip: stat.skip,
            start: &stat.start,
            end: &stat.end,
            duration: format_duration(stat.duration),
            error: stat.error.as_deref(),
        }
    }
}

/// Load a caller-supplied template from disk.
pub fn load_template(path: &Path) -> Result<String, NotifyError> {
    std::fs::read_to_string(path).map_err(|source| NotifyError::TemplateRead {
        path: path.display().to_string(),
        source,
    })
}

/// Render `history` with `source`, or the built-in template when `None`.
pub fn render(history: &HistoryMap, source: Option<&str>) -> Result<String, NotifyError> {
    if history.is_empty() {
        return Err(NotifyError::EmptyHistory);
    }

    let rows: BTreeMap<&str, Vec<Row<'_>>> = history
        .iter()
        .map(|(name, stats)| (name.as_str(), stats.iter().map(Row::from).collect()))
        .collect();

    let mut env = Environment::new();
    env.add_template(TEMPLATE_NAME, source.unwrap_or(DEFAULT_TEMPLATE))?;
    let html = env.get_template(TEMPLATE_NAME)?.render(context! { history => rows })?;
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::DEFAULT_TIME_FORMAT;

    fn sample() -> HistoryMap {
        let mut history = HistoryMap::new();
        history.insert(
            "mysqldump".into(),
            vec![
                Stat::new("mysqldump", DEFAULT_TIME_FORMAT).finish(Some("exit 1".into())),
                Stat::new("mysqldump", DEFAULT_TIME_FORMAT).finish(None),
            ],
        );
        history
    }

    #[test]
    fn test_default_template_lists_runs() {
        let html = render(&sample(), None).unwrap();
        assert!(html.contains("mysqldump"));
        assert!(html.contains("Success"));
        assert!(html.contains("Failed"));
        assert!(html.contains("exit 1"));
    }

    #[test]
    fn test_custom_template() {
        let tmpl = "{% for name, rows in history|items %}{{ name }}={{ rows|length }};{% endfor %}";
        let out = render(&sample(), Some(tmpl)).unwrap();
        assert_eq!(out, "mysqldump=2;");
    }

    #[test]
    fn test_empty_history_is_rejected() {
        assert!(matches!(render(&HistoryMap::new(), None), Err(NotifyError::EmptyHistory)));
    }

    #[test]
    fn test_broken_template_is_an_error() {
        let result = render(&sample(), Some("{% for %}"));
        assert!(matches!(result, Err(NotifyError::Template(_))));
    }

    #[test]
    fn test_missing_template_file() {
        let result = load_template(Path::new("/nonexistent/history.html"));
        assert!(matches!(result, Err(NotifyError::TemplateRead { .. })));
    }
}
