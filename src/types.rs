//! Domain types shared across the engine: findings, tasks, change plans, config.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a closed string enum stored as TEXT in SQLite and as a plain
/// string in JSON.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("Unknown {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(
    /// What kind of problem a finding describes.
    FindingCategory {
        Error => "error",
        Performance => "performance",
        DataIntegrity => "data-integrity",
        Improvement => "improvement",
    }
);

text_enum!(
    /// Finding severity. Declared most severe first.
    Severity {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
        Info => "info",
    }
);

text_enum!(
    FindingStatus {
        Open => "open",
        InProgress => "in_progress",
        Fixed => "fixed",
    }
);

text_enum!(
    TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    /// How a task is executed: direct data mutation or a reviewable plan.
    TaskKind {
        AutoFix => "auto_fix",
        Proposal => "proposal",
    }
);

text_enum!(
    FileAction {
        Create => "create",
        Modify => "modify",
        Delete => "delete",
    }
);

text_enum!(
    RiskLevel {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(
    /// Who invoked a tick.
    TriggerSource {
        Scheduled => "scheduled",
        Manual => "manual",
    }
);

impl Severity {
    /// Task priority inherited from severity. Lower is more urgent.
    pub fn priority(&self) -> i64 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
            Severity::Info => 5,
        }
    }

    /// True when `self` is as severe as `threshold` or more.
    pub fn is_at_least(&self, threshold: Severity) -> bool {
        self.priority() <= threshold.priority()
    }
}

impl RiskLevel {
    fn rank(&self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
        }
    }
}

impl PartialOrd for RiskLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RiskLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl FindingCategory {
    /// Data-integrity findings are fixed directly; everything else gets a plan.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            FindingCategory::DataIntegrity => TaskKind::AutoFix,
            _ => TaskKind::Proposal,
        }
    }
}

// =============================================================================
// Findings
// =============================================================================

/// A row from the `findings` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub description: String,
    pub location: String,
    pub detection_method: String,
    pub fingerprint: String,
    pub status: FindingStatus,
    pub created_at: String,
    pub last_seen_at: String,
    pub seen_count: i64,
    pub resolved_at: Option<String>,
}

/// Detector output before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFinding {
    pub category: FindingCategory,
    pub severity: Severity,
    pub description: String,
    pub location: String,
    pub detection_method: String,
    pub fingerprint: String,
}

// =============================================================================
// Tasks
// =============================================================================

/// A row from the `tasks` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub finding_id: Option<String>,
    pub directive_key: Option<String>,
    pub kind: TaskKind,
    pub title: String,
    pub detail: String,
    pub location: Option<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub scheduled_for: Option<String>,
    pub attempts: i64,
    pub claimed_at: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub last_error: Option<String>,
}

impl Task {
    /// Whether the task may be picked up at `now` (a `util::ts` timestamp).
    ///
    /// An absent `scheduled_for` means "immediately eligible". This mirrors
    /// the SQL predicate in `AgentDb::select_eligible_tasks` exactly.
    pub fn is_eligible(&self, now: &str) -> bool {
        self.status == TaskStatus::Pending
            && self
                .scheduled_for
                .as_deref()
                .map_or(true, |at| at <= now)
    }
}

/// An externally maintained priority goal that seeds a task directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityDirective {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: i64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
}

// =============================================================================
// Change plans
// =============================================================================

/// One intended file change inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub risk: RiskLevel,
    pub description: String,
    pub rationale: String,
}

/// Reviewable description of code changes attached to a proposal task.
///
/// `applied` can only be read here. Nothing in this crate sets it; the apply
/// step lives outside the engine and is gated by review.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlan {
    pub task_id: String,
    pub files: Vec<FileChange>,
    pub testing_notes: String,
    pub created_at: String,
    applied: bool,
}

impl ChangePlan {
    pub(crate) fn new(task_id: &str, files: Vec<FileChange>, testing_notes: String, created_at: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            files,
            testing_notes,
            created_at,
            applied: false,
        }
    }

    /// Rehydrate a stored plan, carrying whatever the review step recorded.
    pub(crate) fn from_row(
        task_id: String,
        files: Vec<FileChange>,
        testing_notes: String,
        created_at: String,
        applied: bool,
    ) -> Self {
        Self {
            task_id,
            files,
            testing_notes,
            created_at,
            applied,
        }
    }

    pub fn applied(&self) -> bool {
        self.applied
    }

    pub fn highest_risk(&self) -> Option<RiskLevel> {
        self.files.iter().map(|f| f.risk).max()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration, read from `~/.maintenance-agent/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Engine store. Defaults to `~/.maintenance-agent/agent.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Relational store inspected by integrity checks and mutated by auto-fixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_database_path: Option<String>,
    /// Shared secret for scheduled callers. `MAINTENANCE_TRIGGER_SECRET` overrides it.
    #[serde(default, skip_serializing)]
    pub trigger_secret: Option<String>,
    #[serde(default)]
    pub manual_trigger: ManualTriggerConfig,
    /// Findings below this severity stay visible but never get a task.
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: Severity,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub detectors: DetectorConfig,
    #[serde(default)]
    pub error_monitor: ErrorMonitorConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    /// JSON file of `PriorityDirective`s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directives_path: Option<String>,
    #[serde(default = "default_report_window_hours")]
    pub report_window_hours: u32,
    /// Also write each report to this file (JSON).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            target_database_path: None,
            trigger_secret: None,
            manual_trigger: ManualTriggerConfig::default(),
            severity_threshold: default_severity_threshold(),
            executor: ExecutorConfig::default(),
            detectors: DetectorConfig::default(),
            error_monitor: ErrorMonitorConfig::default(),
            performance: PerformanceConfig::default(),
            integrity: IntegrityConfig::default(),
            directives_path: None,
            report_window_hours: default_report_window_hours(),
            report_path: None,
        }
    }
}

fn default_severity_threshold() -> Severity {
    Severity::Medium
}

fn default_report_window_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTriggerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_manual_interval")]
    pub min_interval_secs: u64,
}

impl Default for ManualTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: default_manual_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_manual_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Maximum tasks executed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wall-clock budget for the execution phase of one tick.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// An `in_progress` task older than this is considered abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Delay before a re-queued failed task becomes eligible again.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: i64,
    /// Re-queue retryable failures each tick.
    #[serde(default = "default_true")]
    pub auto_requeue: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            budget_secs: default_budget_secs(),
            max_attempts: default_max_attempts(),
            stale_after_secs: default_stale_after_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            auto_requeue: true,
        }
    }
}

fn default_batch_size() -> usize {
    5
}

fn default_budget_secs() -> u64 {
    240
}

fn default_max_attempts() -> i64 {
    3
}

fn default_stale_after_secs() -> i64 {
    15 * 60
}

fn default_retry_backoff_secs() -> i64 {
    5 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    #[serde(default = "default_detector_timeout")]
    pub timeout_secs: u64,
    /// Per-detector timeout by detector name (`error_monitor`, ...).
    #[serde(default)]
    pub timeout_overrides: HashMap<String, u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_detector_timeout(),
            timeout_overrides: HashMap::new(),
        }
    }
}

impl DetectorConfig {
    pub fn timeout_for(&self, detector: &str) -> u64 {
        self.timeout_overrides
            .get(detector)
            .copied()
            .unwrap_or(self.timeout_secs)
    }
}

fn default_detector_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMonitorConfig {
    /// JSON-lines log stream. The detector is not registered without it.
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            lookback_minutes: default_lookback_minutes(),
        }
    }
}

fn default_lookback_minutes() -> i64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    /// JSON-lines latency samples. The detector is not registered without it.
    #[serde(default)]
    pub metrics_path: Option<String>,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    #[serde(default = "default_p95_ms")]
    pub default_p95_ms: f64,
    #[serde(default)]
    pub thresholds_ms: HashMap<String, f64>,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Minimum observed calls per minute, by operation.
    #[serde(default)]
    pub min_throughput_per_min: HashMap<String, f64>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            metrics_path: None,
            lookback_minutes: default_lookback_minutes(),
            default_p95_ms: default_p95_ms(),
            thresholds_ms: HashMap::new(),
            min_samples: default_min_samples(),
            min_throughput_per_min: HashMap::new(),
        }
    }
}

fn default_p95_ms() -> f64 {
    1000.0
}

fn default_min_samples() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityConfig {
    #[serde(default)]
    pub checks: Vec<IntegrityCheck>,
    #[serde(default)]
    pub endpoints: Vec<EndpointCheck>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            endpoints: Vec::new(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl IntegrityConfig {
    pub fn check(&self, name: &str) -> Option<&IntegrityCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointCheck> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

fn default_probe_timeout() -> u64 {
    10
}

/// A relational consistency rule with a registered corrective action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheck {
    pub name: String,
    #[serde(default = "default_check_severity")]
    pub severity: Severity,
    pub rule: IntegrityRule,
}

fn default_check_severity() -> Severity {
    Severity::High
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum IntegrityRule {
    /// Child rows whose foreign key points at no parent row.
    OrphanedRows {
        table: String,
        column: String,
        parent_table: String,
        parent_column: String,
        #[serde(default)]
        fix: OrphanFix,
    },
    /// Rows with a NULL or empty required timestamp.
    MissingTimestamp {
        table: String,
        column: String,
        fallback: TimestampFallback,
    },
}

impl IntegrityRule {
    pub fn table(&self) -> &str {
        match self {
            IntegrityRule::OrphanedRows { table, .. } => table,
            IntegrityRule::MissingTimestamp { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum OrphanFix {
    #[default]
    Delete,
    /// Point orphans at an existing parent key instead.
    Relink { value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TimestampFallback {
    /// Copy from another column of the same row.
    Column { name: String },
    /// Use a fixed, deterministic value.
    Fixed { value: String },
}

/// A permission-gated endpoint that must stay reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCheck {
    pub name: String,
    pub url: String,
    /// Status codes meaning "reachable". Auth refusals count.
    #[serde(default = "default_expect_status")]
    pub expect_status: Vec<u16>,
    #[serde(default = "default_check_severity")]
    pub severity: Severity,
}

fn default_expect_status() -> Vec<u16> {
    vec![200, 401, 403]
}
