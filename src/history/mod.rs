//! Bounded, per-job execution history.

pub mod sqlite;

pub use self::sqlite::SqliteHistory;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::stat::Stat;

/// Retention used when none (or zero) is configured.
pub const DEFAULT_RETENTION: usize = 7;

/// Snapshot of the store: job name -> stats, newest first.
pub type HistoryMap = BTreeMap<String, Vec<Stat>>;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store is closed")]
    Closed,

    #[error("history database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("history connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("corrupt history entry {id}: {source}")]
    Corrupt {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode history entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Storage for finished [`Stat`]s, keyed by [`Stat::name`].
///
/// Implementations serialize inserts per key so eviction bookkeeping is
/// race-free, and `list` never observes a half-written entry.
pub trait HistoryStore: Send + Sync {
    /// Append `stat` as the newest entry for its job and evict the oldest
    /// entries beyond the retention bound.
    fn insert(&self, stat: &Stat) -> Result<(), HistoryError>;

    /// Snapshot of every job's entries, newest first.
    fn list(&self) -> Result<HistoryMap, HistoryError>;

    /// Release underlying resources. Later calls fail with
    /// [`HistoryError::Closed`].
    fn close(&self) -> Result<(), HistoryError>;
}

/// Resolve a configured retention: zero means the default.
pub fn effective_retention(retention: usize) -> usize {
    if retention == 0 {
        DEFAULT_RETENTION
    } else {
        retention
    }
}

/// In-process history with the same semantics as the durable store.
#[derive(Debug)]
pub struct MemoryHistory {
    retention: usize,
    entries: Mutex<Option<BTreeMap<String, VecDeque<Stat>>>>,
}

impl MemoryHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: effective_retention(retention),
            entries: Mutex::new(Some(BTreeMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BTreeMap<String, VecDeque<Stat>>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HistoryStore for MemoryHistory {
    fn insert(&self, stat: &Stat) -> Result<(), HistoryError> {
        let mut guard = self.lock();
        let entries = guard.as_mut().ok_or(HistoryError::Closed)?;
        let list = entries.entry(stat.name.clone()).or_default();
        list.push_front(stat.clone());
        list.truncate(self.retention);
        Ok(())
    }

    fn list(&self) -> Result<HistoryMap, HistoryError> {
        let guard = self.lock();
        let entries = guard.as_ref().ok_or(HistoryError::Closed)?;
        Ok(entries
            .iter()
            .map(|(name, list)| (name.clone(), list.iter().cloned().collect()))
            .collect())
    }

    fn close(&self) -> Result<(), HistoryError> {
        self.lock().take().map(|_| ()).ok_or(HistoryError::Closed)
    }
}
