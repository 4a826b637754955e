//! Failure alerts and history digests.

pub mod digest;
pub mod email;

pub use self::email::{EmailNotifier, EmailSettings};

use thiserror::Error;
use tracing::{error, info};

use crate::history::HistoryMap;
use crate::stat::{format_duration, Stat};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no stats found when trying to send history digest")]
    EmptyHistory,

    #[error("failed to read template {path}: {source}")]
    TemplateRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("invalid mailbox '{0}'")]
    Address(String),

    #[error("failed to build message: {0}")]
    Message(String),

    #[error("failed to send email: {0}")]
    Transport(String),
}

/// Best-effort delivery of job outcomes to operators.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Alert about a single failed run.
    async fn notify(&self, stat: &Stat) -> Result<(), NotifyError>;

    /// Send a digest of the full history snapshot. Fails with
    /// [`NotifyError::EmptyHistory`] when there is nothing to report.
    async fn notify_history(&self, history: &HistoryMap) -> Result<(), NotifyError>;
}

/// Plain-text description of a stat, shared by alert bodies and log output.
pub fn describe(stat: &Stat) -> String {
    let mut body = format!(
        "Job:      {}\nStatus:   {}\nStarted:  {}\nFinished: {}\nDuration: {}\n",
        stat.name,
        stat.status(),
        stat.start,
        stat.end,
        format_duration(stat.duration),
    );
    if let Some(err) = &stat.error {
        body.push_str("Error:    ");
        body.push_str(err);
        body.push('\n');
    }
    body
}

/// Writes alerts and digests to the diagnostic log. Used when no mail
/// transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, stat: &Stat) -> Result<(), NotifyError> {
        error!(
            name = %stat.name,
            start = %stat.start,
            error = stat.error.as_deref().unwrap_or_default(),
            "backup failure"
        );
        Ok(())
    }

    async fn notify_history(&self, history: &HistoryMap) -> Result<(), NotifyError> {
        if history.is_empty() {
            return Err(NotifyError::EmptyHistory);
        }
        for (name, stats) in history {
            let failed = stats.iter().filter(|s| s.is_failure()).count();
            let latest = stats.first().map(Stat::status).unwrap_or("none");
            info!(%name, runs = stats.len(), failed, latest, "backup history");
        }
        Ok(())
    }
}
