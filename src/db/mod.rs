//! SQLite store for findings, tasks, change plans, fix journal, reports and
//! trigger history.
//!
//! The database lives at `~/.maintenance-agent/agent.db` unless the config
//! points elsewhere. One process holds a single connection behind the
//! `AgentState` mutex, so ticks inside a process run one at a time. Separate
//! processes sharing the file coordinate only through the conditional updates
//! in `tasks.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::types::Config;

pub mod types;
pub use types::*;

pub mod findings;
pub mod journal;
pub mod plans;
pub mod reports;
pub mod tasks;
pub mod triggers;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite connection wrapper for engine state.
///
/// Not `Sync`: the tick holds it behind a `parking_lot::Mutex` in `AgentState`.
pub struct AgentDb {
    conn: Connection,
}

impl AgentDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open the database named by the config, or the default path.
    pub fn open(config: &Config) -> Result<Self, DbError> {
        let path = match &config.database_path {
            Some(p) => PathBuf::from(p),
            None => Self::default_path()?,
        };
        Self::open_at(path)
    }

    /// Open (or create) a database at an explicit path and apply migrations.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets overlapping invocations read while one writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.maintenance-agent/agent.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".maintenance-agent").join("agent.db"))
    }

    /// Filesystem path of the main database, if it is file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .query_row("PRAGMA database_list", [], |row| row.get::<_, String>(2))
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Count rows of a table matching a fixed SQL predicate.
    pub(crate) fn count_where(&self, table: &str, predicate: &str, value: &str) -> Result<i64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate);
        Ok(self.conn.query_row(&sql, params![value], |row| row.get(0))?)
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================
