//! Shared type definitions for the database layer.

use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Failed to (de)serialize stored JSON: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serde(err.to_string())
    }
}

/// Result of `AgentDb::dedupe_upsert_finding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upserted {
    /// No unresolved finding had this fingerprint; a new row was inserted.
    Created(String),
    /// An unresolved finding already existed; only last-seen was refreshed.
    Refreshed(String),
}

impl Upserted {
    pub fn id(&self) -> &str {
        match self {
            Upserted::Created(id) | Upserted::Refreshed(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Upserted::Created(_))
    }
}

/// Filter for `AgentDb::list_findings`. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub status: Option<crate::types::FindingStatus>,
    pub category: Option<crate::types::FindingCategory>,
    pub min_severity: Option<crate::types::Severity>,
    /// Only findings created at or after this timestamp.
    pub since: Option<String>,
    pub limit: Option<usize>,
}

/// Insert payload for the `tasks` table.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub finding_id: Option<String>,
    pub directive_key: Option<String>,
    pub kind: crate::types::TaskKind,
    pub title: String,
    pub detail: String,
    pub location: Option<String>,
    pub priority: i64,
    /// `None` means immediately eligible.
    pub scheduled_for: Option<String>,
}

/// A row from the `fix_journal` table.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub task_id: Option<String>,
    pub check_name: String,
    pub target_table: String,
    pub action: String,
    pub column_name: Option<String>,
    pub before_count: i64,
    pub after_count: i64,
    pub rows_json: String,
    pub created_at: String,
    pub reverted_at: Option<String>,
}

/// Insert payload for the `fix_journal` table.
#[derive(Debug, Clone)]
pub struct NewJournalEntry<'a> {
    pub task_id: Option<&'a str>,
    pub check_name: &'a str,
    pub target_table: &'a str,
    /// `delete` or `update`.
    pub action: &'a str,
    pub column_name: Option<&'a str>,
    pub before_count: i64,
    pub after_count: i64,
    pub rows_json: String,
}

/// A row from the `maintenance_reports` table.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReport {
    pub id: String,
    pub generated_at: String,
    pub window_start: String,
    pub window_end: String,
    pub summary_json: String,
}

/// Outcome of `AgentDb::admit_manual_trigger`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Recorded in `trigger_log` under this id.
    Admitted(String),
    RateLimited { retry_after_secs: u64 },
}
