//! Backup producers.

pub mod process;
pub mod rotate;

pub use self::process::{DumpSettings, ProcessDumper};

use crate::stat::Stat;

/// A job that produces one backup per invocation.
///
/// Implementations never run two invocations concurrently on the same
/// instance: an overlapping call returns a skipped [`Stat`] immediately.
/// Failures are reported inside the returned `Stat`, never raised.
#[async_trait::async_trait]
pub trait Dumper: Send + Sync {
    /// Label recorded as [`Stat::name`].
    fn name(&self) -> &str;

    /// Run the job to completion, cancellation or timeout.
    async fn dump(&self) -> Stat;

    /// Ask an in-flight run to stop. No-op when idle.
    fn stop(&self);
}
