//! Error taxonomy for the maintenance engine.
//!
//! Only `AuthError` ever reaches a trigger caller. Everything else is absorbed
//! and recorded as durable data:
//! - DetectorError: becomes an `error`-category finding
//! - ExecutionError: the task is marked failed
//! - Staleness is not an error at all (stale tasks are reclaimed)

use thiserror::Error;

use crate::db::DbError;

/// Rejections at the trigger boundary. No side effects happen before these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing trigger credential")]
    MissingCredential,

    #[error("Invalid trigger credential")]
    InvalidCredential,

    #[error("No trigger secret configured; only manual triggers are accepted")]
    NotConfigured,

    #[error("Manual triggers are disabled")]
    ManualDisabled,

    #[error("Manual trigger rate limited; retry in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
}

/// A detector failed or exceeded its time budget.
#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    #[error("Detector timed out after {0} seconds")]
    Timeout(u64),

    #[error("Detector source unavailable: {0}")]
    Source(String),

    #[error("Detector query failed: {0}")]
    Query(String),

    #[error("Detector panicked: {0}")]
    Panicked(String),
}

impl DetectorError {
    /// Stable label used in failure fingerprints, so a detector that keeps
    /// timing out refreshes one finding instead of piling up new ones.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorError::Timeout(_) => "timeout",
            DetectorError::Source(_) => "source",
            DetectorError::Query(_) => "query",
            DetectorError::Panicked(_) => "panicked",
        }
    }
}

/// Failure to apply or revert a data correction.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("Target database error: {0}")]
    Target(#[from] rusqlite::Error),

    #[error("Invalid check configuration: {0}")]
    InvalidCheck(String),

    #[error("Relink target {value} does not exist in {table}")]
    MissingRelinkTarget { table: String, value: String },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Journal entry {0} not found")]
    JournalNotFound(String),

    #[error("Journal entry {0} was already reverted")]
    AlreadyReverted(String),
}

/// The Proposer could not produce a valid plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposalError {
    #[error("Drafter produced no changes")]
    Empty,

    #[error("Invalid change path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Duplicate change for {0}")]
    DuplicatePath(String),

    #[error("Drafter failed: {0}")]
    Drafter(String),
}

/// A task's action failed. The executor records it on the task.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Auto-fix failed: {0}")]
    Fix(#[from] FixError),

    #[error("Plan rejected: {0}")]
    Proposal(#[from] ProposalError),

    #[error("No automated correction for {0}; needs manual review")]
    NoCorrectiveAction(String),

    #[error("Unknown integrity check: {0}")]
    UnknownCheck(String),

    #[error("No target database configured")]
    NoTarget,

    #[error("Task references missing finding {0}")]
    MissingFinding(String),

    #[error("Auto-fix {check} left violations in {table}: {before} → {after}")]
    Incomplete {
        check: String,
        table: String,
        before: i64,
        after: i64,
    },
}

impl ExecutionError {
    /// Returns true if running the task again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Database(_) | ExecutionError::Incomplete { .. } => true,
            ExecutionError::Fix(FixError::Target(_)) | ExecutionError::Fix(FixError::Journal(_)) => true,
            ExecutionError::Fix(_) => false,
            ExecutionError::Proposal(ProposalError::Drafter(_)) => true,
            ExecutionError::Proposal(_) => false,
            ExecutionError::NoCorrectiveAction(_)
            | ExecutionError::UnknownCheck(_)
            | ExecutionError::NoTarget
            | ExecutionError::MissingFinding(_) => false,
        }
    }
}

/// Problems loading configuration or wiring the engine.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Target database must differ from the engine database ({0})")]
    SharedDatabase(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid integrity check {name}: {reason}")]
    InvalidCheck { name: String, reason: String },
}
