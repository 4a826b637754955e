use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

/// Longest window `preview` will look ahead.
const MAX_PREVIEW_HOURS: u64 = 24 * 366;

/// A registered tick handler.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("job '{0}' is already registered")]
    Duplicate(String),
}

/// Parse a cron expression.
///
/// Accepts the classic 5-field form (minute first, fires at second 0), the
/// 6/7-field form with a leading seconds field, and `@daily`-style
/// descriptors.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) struct CronEntry {
    pub name: String,
    pub schedule: Schedule,
    pub job: JobFn,
}

/// Set of named cron registrations handed to the engine.
#[derive(Default)]
pub struct CronTab {
    entries: Vec<CronEntry>,
}

impl CronTab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` to run on `expr`. Names must be unique.
    pub fn add<F, Fut>(&mut self, name: &str, expr: &str, job: F) -> Result<(), ScheduleError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(ScheduleError::Duplicate(name.to_string()));
        }
        let schedule = parse_schedule(expr)?;
        tracing::info!(job = %name, schedule = %expr, "adding schedule");
        self.entries.push(CronEntry {
            name: name.to_string(),
            schedule,
            job: Arc::new(move || job().boxed()),
        });
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Fire times within the next `hours`, sorted by time.
    /// This is strictly a dry-run preview, not the execution loop.
    pub fn preview(&self, hours: u64) -> Vec<(DateTime<Utc>, String)> {
        preview_from(&self.entries, Utc::now(), hours)
    }

    pub(crate) fn into_entries(self) -> Vec<CronEntry> {
        self.entries
    }
}

fn preview_from(
    entries: &[CronEntry],
    now: DateTime<Utc>,
    hours: u64,
) -> Vec<(DateTime<Utc>, String)> {
    let end = now + chrono::Duration::hours(hours.min(MAX_PREVIEW_HOURS) as i64);
    let mut preview = Vec::new();

    for entry in entries {
        for next_time in entry.schedule.after(&now) {
            if next_time > end {
                break;
            }
            preview.push((next_time, entry.name.clone()));
        }
    }

    preview.sort_by(|a, b| a.0.cmp(&b.0));
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression() {
        let schedule = parse_schedule("30 2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&from).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_seconds_expression() {
        let schedule = parse_schedule("*/10 * * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let next = schedule.after(&from).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap());
    }

    #[test]
    fn test_descriptor_expression() {
        assert!(parse_schedule("@daily").is_ok());
    }

    #[test]
    fn test_invalid_expression() {
        let err = parse_schedule("not a schedule").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidExpression { .. }));
        assert!(parse_schedule("99 * * * *").is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut tab = CronTab::new();
        tab.add("backup", "0 * * * *", || async {}).unwrap();
        let err = tab.add("backup", "0 * * * *", || async {}).unwrap_err();
        assert!(matches!(err, ScheduleError::Duplicate(_)));
        assert_eq!(tab.names(), vec!["backup".to_string()]);
    }

    #[test]
    fn test_preview_is_sorted_and_bounded() {
        let mut tab = CronTab::new();
        tab.add("hourly", "0 * * * *", || async {}).unwrap();
        tab.add("daily", "30 3 * * *", || async {}).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let preview = preview_from(&tab.entries, now, 4);

        let names: Vec<&str> = preview.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["hourly", "hourly", "hourly", "daily", "hourly"]);
        assert!(preview.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
