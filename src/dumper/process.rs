//! External-process dumper (e.g. `mysqldump`).
//!
//! The executable's stdout becomes the backup artifact; stderr is tailed into
//! the diagnostic log. The child is terminated on explicit stop or when the
//! optional time limit elapses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{rotate, Dumper};
use crate::guard::SingleFlight;
use crate::stat::{format_duration, Stat, DEFAULT_TIME_FORMAT};

/// How long a terminated child gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long stderr may keep draining after the child is gone. Grandchildren
/// can hold the pipe open.
const TAIL_DRAIN: Duration = Duration::from_secs(1);

/// Parameters for one kind of process-based backup.
#[derive(Debug, Clone)]
pub struct DumpSettings {
    /// Label recorded in every [`Stat`].
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    /// Where stdout is written.
    pub output_path: PathBuf,
    /// Number of rotated artifacts to keep next to `output_path`.
    pub output_retention: usize,
    pub time_limit: Option<Duration>,
    pub time_format: String,
}

impl DumpSettings {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            output_path: output_path.into(),
            output_retention: 7,
            time_limit: None,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_output_retention(mut self, keep: usize) -> Self {
        self.output_retention = keep;
        self
    }
}

/// Why the wait for the child ended early.
enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// Runs an external executable and captures its stdout as a backup file.
pub struct ProcessDumper {
    settings: DumpSettings,
    guard: SingleFlight,
}

impl ProcessDumper {
    pub fn new(settings: DumpSettings) -> Self {
        Self {
            settings,
            guard: SingleFlight::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Body of a run that holds the guard. Every failure becomes the
    /// returned error message. `deadline` bounds the whole run, setup
    /// included.
    async fn run(
        &self,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), String> {
        let s = &self.settings;

        let setup = {
            let (name, path, keep) = (s.name.clone(), s.output_path.clone(), s.output_retention);
            tokio::task::spawn_blocking(move || prepare_artifact(&name, &path, keep))
        };
        let artifact = tokio::select! {
            joined = setup => {
                joined.map_err(|e| format!("{}: backup setup task failed: {}", s.name, e))??
            }
            _ = token.cancelled() => return Err(format!("{}: backup cancelled", s.name)),
            _ = sleep_until(deadline) => return Err(self.deadline_exceeded()),
        };

        let mut child = Command::new(&s.executable)
            .args(&s.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(artifact))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("{}: failed to start backup '{}': {}", s.name, s.executable, e))?;

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                terminate_child(&mut child).await;
                return Err(format!("{}: failed to attach STDERR pipe", s.name));
            }
        };

        // Diagnostic lines go to the log until the pipe closes.
        let tail = tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => warn!("{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "stopped reading stderr");
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let interrupt = tokio::select! {
            status = child.wait() => {
                drain(tail).await;
                return match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(format!("{}: {}", s.name, describe_exit(status))),
                    Err(e) => Err(format!("{}: failed waiting for backup: {}", s.name, e)),
                };
            }
            _ = token.cancelled() => Interrupt::Cancelled,
            _ = sleep_until(deadline) => Interrupt::DeadlineExceeded,
        };

        terminate_child(&mut child).await;
        drain(tail).await;

        match interrupt {
            Interrupt::Cancelled => Err(format!("{}: backup cancelled", s.name)),
            Interrupt::DeadlineExceeded => Err(self.deadline_exceeded()),
        }
    }

    fn deadline_exceeded(&self) -> String {
        format!(
            "{}: deadline exceeded after {}",
            self.settings.name,
            format_duration(self.settings.time_limit.unwrap_or_default())
        )
    }
}

#[async_trait::async_trait]
impl Dumper for ProcessDumper {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn dump(&self) -> Stat {
        let stat = Stat::new(&self.settings.name, &self.settings.time_format);

        let Some(flight) = self.guard.try_acquire(CancellationToken::new()) else {
            warn!(
                name = %self.settings.name,
                "skipping because the previous scheduled dump is still running"
            );
            return Stat::skipped(&self.settings.name, &self.settings.time_format);
        };
        let deadline = self.settings.time_limit.map(|limit| Instant::now() + limit);

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("dump", name = %self.settings.name, %run_id);
        info!(parent: &span, executable = %self.settings.executable, "running backup");

        let result = self
            .run(flight.token(), deadline)
            .instrument(span.clone())
            .await;
        flight.release();

        let stat = stat.finish(result.err());
        if stat.success {
            info!(parent: &span, duration = %format_duration(stat.duration), "backup finished");
        } else {
            error!(
                parent: &span,
                duration = %format_duration(stat.duration),
                error = stat.error.as_deref().unwrap_or_default(),
                "backup failed"
            );
        }
        stat
    }

    fn stop(&self) {
        self.guard.cancel();
    }
}

/// Rotate the previous artifact away and open a fresh one for the child's
/// stdout. Blocking; run it off the async workers.
fn prepare_artifact(name: &str, path: &Path, keep: usize) -> Result<std::fs::File, String> {
    rotate::rotate(path, keep)
        .map_err(|e| format!("{}: failed to rotate backups of {}: {}", name, path.display(), e))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            format!("{}: failed to create dump directory {}: {}", name, dir.display(), e)
        })?;
    }

    std::fs::File::create(path)
        .map_err(|e| format!("{}: failed to create dump file {}: {}", name, path.display(), e))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn drain(tail: JoinHandle<()>) {
    let abort = tail.abort_handle();
    if tokio::time::timeout(TAIL_DRAIN, tail).await.is_err() {
        debug!("stderr still open after child exit, detaching");
        abort.abort();
    }
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("backup exited with status {}", code),
        None => "backup terminated by signal".to_string(),
    }
}

/// Ask the child to exit (SIGTERM on unix), then force-kill it if it has not
/// gone away within the grace period.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(exit_code = status.code(), "child exited after terminate"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for child after terminate"),
        Err(_) => {
            warn!("child did not exit after SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill child");
            }
        }
    }
}
