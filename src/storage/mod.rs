//! SQLite storage layer -- connection pool and migrations.

pub mod schema;

use std::path::Path;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Pragmas applied to every pooled connection.
const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a migrated connection pool.
pub fn open_pool(path: &Path) -> Result<Pool, crate::history::HistoryError> {
    let manager =
        SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(CONNECTION_PRAGMAS));
    build(manager)
}

/// A private in-memory database. The pool is capped at one connection so
/// every caller sees the same database.
pub fn open_memory_pool() -> Result<Pool, crate::history::HistoryError> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    drop(conn);
    Ok(pool)
}

fn build(manager: SqliteConnectionManager) -> Result<Pool, crate::history::HistoryError> {
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
