//! Cron-driven orchestration of the backup job.
//!
//! The [`Orchestrator`] registers the backup (and optional digest) schedule,
//! runs the tick loop in the background and routes every finished [`Stat`]
//! to the notifier and the history store. Steady-state failures are logged
//! and absorbed; only a malformed cron expression fails [`Orchestrator::start`].

pub mod cron;
mod engine;

pub use self::cron::{parse_schedule, CronTab, ScheduleError};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::dumper::Dumper;
use crate::history::{HistoryError, HistoryMap, HistoryStore};
use crate::notify::{Notifier, NotifyError};
use crate::stat::Stat;

/// Registration name of the history digest job.
pub const DIGEST_JOB: &str = "history-digest";

/// Wiring options for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Cron expression for backups.
    pub backup_schedule: String,
    /// Cron expression for history digests, if any.
    pub history_schedule: Option<String>,
    /// Negative disables history persistence.
    pub history_retention: i64,
    /// Send an alert for every failed (non-skipped) run.
    pub notify_on_failure: bool,
}

impl OrchestratorSettings {
    pub fn new(backup_schedule: impl Into<String>) -> Self {
        Self {
            backup_schedule: backup_schedule.into(),
            history_schedule: None,
            history_retention: crate::history::DEFAULT_RETENTION as i64,
            notify_on_failure: false,
        }
    }

    pub fn history_enabled(&self) -> bool {
        self.history_retention >= 0
    }
}

#[derive(Debug, Error)]
pub enum DigestError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("history task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct Inner {
    settings: OrchestratorSettings,
    dumper: Arc<dyn Dumper>,
    notifier: Arc<dyn Notifier>,
    history: Arc<dyn HistoryStore>,
}

impl Inner {
    async fn backup(&self) -> Stat {
        info!(name = %self.dumper.name(), "dumping");
        let stat = self.dumper.dump().await;
        if stat.skip {
            return stat;
        }

        if stat.is_failure() && self.settings.notify_on_failure {
            if let Err(e) = self.notifier.notify(&stat).await {
                error!(name = %stat.name, error = %e, "failed to send failure notification");
            }
        }

        if self.settings.history_enabled() {
            let history = Arc::clone(&self.history);
            let record = stat.clone();
            match tokio::task::spawn_blocking(move || history.insert(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(name = %stat.name, error = %e, "failed to record backup history")
                }
                Err(e) => error!(name = %stat.name, error = %e, "history task failed"),
            }
        }

        stat
    }

    async fn digest(&self) -> Result<(), DigestError> {
        let history = Arc::clone(&self.history);
        let snapshot: HistoryMap = tokio::task::spawn_blocking(move || history.list()).await??;
        self.notifier.notify_history(&snapshot).await?;
        Ok(())
    }
}

struct Running {
    handle: engine::LoopHandle,
    jobs: Vec<String>,
}

/// Owns the cron scheduler and its start/stop lifecycle.
pub struct Orchestrator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        dumper: Arc<dyn Dumper>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                dumper,
                notifier,
                history,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.inner.history)
    }

    /// Build the registrations for the configured schedules.
    pub fn crontab(&self) -> Result<CronTab, ScheduleError> {
        let settings = &self.inner.settings;
        let mut tab = CronTab::new();

        let inner = Arc::clone(&self.inner);
        tab.add(self.inner.dumper.name(), &settings.backup_schedule, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.backup().await;
            }
        })?;

        if let Some(expr) = &settings.history_schedule {
            if !settings.history_enabled() {
                info!("history is disabled, not scheduling digests");
                return Ok(tab);
            }
            let inner = Arc::clone(&self.inner);
            tab.add(DIGEST_JOB, expr, move || {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(e) = inner.digest().await {
                        error!(error = %e, "failed to send history digest");
                    }
                }
            })?;
        }

        Ok(tab)
    }

    /// Register the schedules and start the background loop. Calling it
    /// again while running is a no-op.
    pub async fn start(&self) -> Result<(), ScheduleError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let tab = self.crontab()?;
        let jobs = tab.names();
        let handle = engine::spawn(tab);
        *running = Some(Running { handle, jobs });
        info!(name = %self.inner.dumper.name(), "orchestrator started");
        Ok(())
    }

    /// Halt the scheduler, cancel any in-flight backup and wait for running
    /// handlers to return. No-op when not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { handle, .. }) = running.take() else {
            return;
        };

        let mut ticks = handle.shutdown().await;
        self.inner.dumper.stop();
        while let Some(result) = ticks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "scheduled job ended abnormally");
            }
        }
        info!("orchestrator shutdown");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Names of the active cron registrations; empty when stopped.
    pub async fn registered_jobs(&self) -> Vec<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.jobs.clone())
            .unwrap_or_default()
    }

    /// Run the backup handler once, outside the schedule.
    pub async fn run_backup(&self) -> Stat {
        self.inner.backup().await
    }

    /// Send the history digest once, outside the schedule.
    pub async fn send_digest(&self) -> Result<(), DigestError> {
        self.inner.digest().await
    }
}
