use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cron::{CronEntry, CronTab};

/// Control side of a running scheduler loop.
pub(crate) struct LoopHandle {
    stop_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<JoinSet<()>>,
}

impl LoopHandle {
    /// Signal the loop and wait until it has halted every tick source.
    ///
    /// Returns the tick tasks so the caller can wait for handlers that were
    /// already running when the signal arrived.
    pub(crate) async fn shutdown(self) -> JoinSet<()> {
        let _ = self.stop_tx.send(());
        match self.done_rx.await {
            Ok(ticks) => ticks,
            Err(_) => {
                warn!("scheduler loop exited without acknowledging shutdown");
                JoinSet::new()
            }
        }
    }
}

/// Start the scheduler loop on its own task.
pub(crate) fn spawn(tab: CronTab) -> LoopHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(run_scheduler_loop(tab, stop_rx, done_tx));
    LoopHandle { stop_tx, done_rx }
}

/// Main scheduler execution loop.
///
/// Each registration gets a tick task. On the stop signal (or when the
/// handle is dropped) no further ticks fire; handlers already running are
/// left to finish and handed back through `done_tx`.
async fn run_scheduler_loop(
    tab: CronTab,
    stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<JoinSet<()>>,
) {
    let halt = CancellationToken::new();
    let mut ticks = JoinSet::new();
    for entry in tab.into_entries() {
        ticks.spawn(run_entry(entry, halt.clone()));
    }
    info!(jobs = ticks.len(), "scheduler started");

    let _ = stop_rx.await;

    halt.cancel();
    info!("scheduler stopped");
    let _ = done_tx.send(ticks);
}

/// Fire one registration until halted. The handler runs inline, so a job
/// never overlaps with itself; ticks missed while it runs are dropped.
async fn run_entry(entry: CronEntry, halt: CancellationToken) {
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let from = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = entry.schedule.after(&from).next() else {
            info!(job = %entry.name, "schedule has no future runs");
            break;
        };
        debug!(job = %entry.name, next = %next, "waiting for next run");

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        // A halt racing the wake-up wins over the tick.
        if halt.is_cancelled() {
            break;
        }

        last_fire = Some(next);
        debug!(job = %entry.name, "tick");
        (entry.job)().await;

        if halt.is_cancelled() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loop_fires_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut tab = CronTab::new();
        let counter = Arc::clone(&count);
        tab.add("every-second", "* * * * * *", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let handle = spawn(tab);
        tokio::time::sleep(Duration::from_millis(2200)).await;
        let mut ticks = handle.shutdown().await;
        while ticks.join_next().await.is_some() {}

        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one tick, got {}", fired);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_halted_entry_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut tab = CronTab::new();
        let counter = Arc::clone(&count);
        tab.add("every-second", "* * * * * *", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let halt = CancellationToken::new();
        halt.cancel();
        for entry in tab.into_entries() {
            tokio::time::timeout(Duration::from_secs(2), run_entry(entry, halt.clone()))
                .await
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
