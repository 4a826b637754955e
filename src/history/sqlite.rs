//! Durable history backed by SQLite.

use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, TransactionBehavior};
use tracing::debug;

use super::{effective_retention, HistoryError, HistoryMap, HistoryStore};
use crate::stat::Stat;
use crate::storage::{self, Pool};

/// One row per finished [`Stat`]; rows beyond the retention bound are deleted
/// in the same transaction that inserts the newest one.
pub struct SqliteHistory {
    pool: RwLock<Option<Pool>>,
    retention: usize,
}

impl SqliteHistory {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, retention: usize) -> Result<Self, HistoryError> {
        let pool = storage::open_pool(path)?;
        debug!(path = %path.display(), "history database opened");
        Ok(Self::from_pool(pool, retention))
    }

    /// A throwaway in-memory database.
    pub fn in_memory(retention: usize) -> Result<Self, HistoryError> {
        Ok(Self::from_pool(storage::open_memory_pool()?, retention))
    }

    pub fn from_pool(pool: Pool, retention: usize) -> Self {
        Self {
            pool: RwLock::new(Some(pool)),
            retention: effective_retention(retention),
        }
    }

    fn pool(&self) -> Result<RwLockReadGuard<'_, Option<Pool>>, HistoryError> {
        let guard = self.pool.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            return Err(HistoryError::Closed);
        }
        Ok(guard)
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, HistoryError> {
        let guard = self.pool()?;
        let pool = guard.as_ref().ok_or(HistoryError::Closed)?;
        Ok(pool.get()?)
    }
}

impl HistoryStore for SqliteHistory {
    fn insert(&self, stat: &Stat) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(stat)?;
        let mut conn = self.connection()?;

        // IMMEDIATE takes the write lock up front so two inserts for the same
        // job cannot interleave their eviction.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO stats (name, success, stat_json) VALUES (?1, ?2, ?3)",
            params![stat.name, stat.success, payload],
        )?;
        let evicted = tx.execute(
            "DELETE FROM stats WHERE name = ?1 AND id NOT IN (
                SELECT id FROM stats WHERE name = ?1 ORDER BY id DESC LIMIT ?2
            )",
            params![stat.name, self.retention as i64],
        )?;
        tx.commit()?;

        if evicted > 0 {
            debug!(name = %stat.name, evicted, "evicted old history entries");
        }
        Ok(())
    }

    fn list(&self) -> Result<HistoryMap, HistoryError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id, stat_json FROM stats ORDER BY name, id DESC")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut map = HistoryMap::new();
        for row in rows {
            let (id, json) = row?;
            let stat: Stat =
                serde_json::from_str(&json).map_err(|source| HistoryError::Corrupt { id, source })?;
            map.entry(stat.name.clone()).or_default().push(stat);
        }
        Ok(map)
    }

    fn close(&self) -> Result<(), HistoryError> {
        let mut guard = self.pool.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Dropping the pool closes idle connections; checked-out ones close
        // when their holders return them.
        guard.take().map(|_| ()).ok_or(HistoryError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::DEFAULT_TIME_FORMAT;
    use std::sync::Arc;

    fn finished(name: &str, err: Option<&str>) -> Stat {
        Stat::new(name, DEFAULT_TIME_FORMAT).finish(err.map(str::to_string))
    }

    #[test]
    fn test_insert_and_list_newest_first() {
        let store = SqliteHistory::in_memory(2).unwrap();
        let first = finished("job", None);
        let second = finished("job", Some("boom"));
        let third = finished("job", None);
        for stat in [&first, &second, &third] {
            store.insert(stat).unwrap();
        }

        let list = store.list().unwrap();
        assert_eq!(list["job"], vec![third, second]);
    }

    #[test]
    fn test_retention_is_per_job() {
        let store = SqliteHistory::in_memory(3).unwrap();
        for _ in 0..5 {
            store.insert(&finished("a", None)).unwrap();
        }
        store.insert(&finished("b", None)).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list["a"].len(), 3);
        assert_eq!(list["b"].len(), 1);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        let stat = finished("job", Some("disk full"));
        {
            let store = SqliteHistory::open(&path, 7).unwrap();
            store.insert(&stat).unwrap();
            store.close().unwrap();
        }

        let store = SqliteHistory::open(&path, 7).unwrap();
        assert_eq!(store.list().unwrap()["job"], vec![stat]);
    }

    #[test]
    fn test_closed_store_fails() {
        let store = SqliteHistory::in_memory(7).unwrap();
        store.close().unwrap();
        assert!(matches!(store.list(), Err(HistoryError::Closed)));
        assert!(matches!(store.insert(&finished("a", None)), Err(HistoryError::Closed)));
    }

    #[test]
    fn test_concurrent_inserts_keep_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteHistory::open(&dir.path().join("h.db"), 4).unwrap());

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.insert(&finished(name, None)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let list = store.list().unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.values().all(|v| v.len() == 4));
    }
}
