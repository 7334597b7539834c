//! The relational store under maintenance.
//!
//! Integrity checks read it, auto-fixes mutate it. It is always a different
//! file from the engine store, so a fix transaction here never waits on the
//! journal write in `AgentDb`.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TargetDb {
    conn: Connection,
}

impl TargetDb {
    /// Open an existing target database. Never creates schema.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Wrap an already-open connection (in-memory databases in tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a write transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&self.conn) {
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

    /// Run a `SELECT COUNT(*) ...` statement.
    pub fn count(&self, sql: &str) -> Result<i64, rusqlite::Error> {
        self.conn.query_row(sql, [], |row| row.get(0))
    }
}
