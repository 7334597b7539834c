use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::db::AgentDb;
use crate::detectors::{build_detectors, integrity::validate_checks, Detector};
use crate::error::ConfigError;
use crate::notification::{build_sink, NotificationSink};
use crate::proposer::Proposer;
use crate::sources::{DirectiveSource, JsonFileDirectives};
use crate::target::TargetDb;
use crate::types::Config;

/// Environment variable that overrides `triggerSecret` from the config file.
pub const TRIGGER_SECRET_ENV: &str = "MAINTENANCE_TRIGGER_SECRET";

/// Everything one engine process shares across ticks.
pub struct AgentState {
    pub config: Config,
    pub db: Mutex<AgentDb>,
    pub target: Option<Arc<Mutex<TargetDb>>>,
    pub detectors: Vec<Detector>,
    pub proposer: Proposer,
    pub directives: Option<Box<dyn DirectiveSource>>,
    pub sink: Box<dyn NotificationSink>,
}

impl AgentState {
    /// Wire the engine described by `config`.
    ///
    /// Fails when an integrity check is malformed or when the target database
    /// is the engine's own store.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        validate_checks(&config.integrity)?;

        let db_path = match &config.database_path {
            Some(p) => PathBuf::from(p),
            None => AgentDb::default_path()?,
        };

        let target = match &config.target_database_path {
            Some(path) => {
                if same_file(Path::new(path), &db_path) {
                    return Err(ConfigError::SharedDatabase(path.clone()));
                }
                let target = TargetDb::open_at(path).map_err(|e| ConfigError::Database(e.into()))?;
                log::info!("State: target database {}", path);
                Some(Arc::new(Mutex::new(target)))
            }
            None => None,
        };

        let db = AgentDb::open_at(&db_path)?;
        log::info!("State: engine database {}", db_path.display());

        Ok(Self::with_parts(config, db, target))
    }

    /// Assemble state around an already-open store. Detectors, directives and
    /// sinks still come from the config.
    pub fn with_parts(config: Config, db: AgentDb, target: Option<Arc<Mutex<TargetDb>>>) -> Self {
        let detectors = build_detectors(&config, target.clone());
        let directives = config
            .directives_path
            .as_ref()
            .map(|p| Box::new(JsonFileDirectives::new(p)) as Box<dyn DirectiveSource>);
        let sink = build_sink(config.report_path.as_deref());
        log::info!(
            "State: {} detectors enabled ({})",
            detectors.len(),
            detectors.iter().map(|d| d.name()).collect::<Vec<_>>().join(", ")
        );

        Self {
            config,
            db: Mutex::new(db),
            target,
            detectors,
            proposer: Proposer::default(),
            directives,
            sink,
        }
    }

    pub fn lock_db(&self) -> MutexGuard<'_, AgentDb> {
        self.db.lock()
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Get the default config file path (~/.maintenance-agent/config.json)
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".maintenance-agent").join("config.json"))
}

/// Load configuration.
///
/// An explicit path must exist. The default path may be absent, in which case
/// every setting takes its default. The trigger secret is then taken from
/// `MAINTENANCE_TRIGGER_SECRET` when set.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(path) => read_config(path)?,
        None => {
            let path = config_path()?;
            if path.exists() {
                read_config(&path)?
            } else {
                log::info!("State: no config at {}, using defaults", path.display());
                Config::default()
            }
        }
    };
    Ok(apply_secret_override(config, std::env::var(TRIGGER_SECRET_ENV).ok()))
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// A non-empty override replaces the configured secret.
pub fn apply_secret_override(mut config: Config, secret: Option<String>) -> Config {
    if let Some(secret) = secret.filter(|s| !s.trim().is_empty()) {
        config.trigger_secret = Some(secret);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntegrityCheck, IntegrityRule, OrphanFix, Severity};

    #[test]
    fn test_load_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"triggerSecret": "s3cret", "severityThreshold": "high", "executor": {"batchSize": 2}}"#,
        )
        .unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.trigger_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.severity_threshold, Severity::High);
        assert_eq!(config.executor.batch_size, 2);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.report_window_hours, 24);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_secret_override() {
        let config = Config {
            trigger_secret: Some("from-file".to_string()),
            ..Default::default()
        };
        let config = apply_secret_override(config, Some("  ".to_string()));
        assert_eq!(config.trigger_secret.as_deref(), Some("from-file"));
        let config = apply_secret_override(config, Some("from-env".to_string()));
        assert_eq!(config.trigger_secret.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_target_must_differ_from_engine_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let config = Config {
            database_path: Some(path.display().to_string()),
            target_database_path: Some(path.display().to_string()),
            ..Default::default()
        };
        assert!(matches!(
            AgentState::from_config(config),
            Err(ConfigError::SharedDatabase(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_bad_check_and_wires_detectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            database_path: Some(dir.path().join("agent.db").display().to_string()),
            target_database_path: Some(dir.path().join("app.db").display().to_string()),
            ..Default::default()
        };
        config.integrity.checks.push(IntegrityCheck {
            name: "bad".to_string(),
            severity: Severity::High,
            rule: IntegrityRule::OrphanedRows {
                table: "orders; DROP TABLE x".to_string(),
                column: "customer_id".to_string(),
                parent_table: "customers".to_string(),
                parent_column: "id".to_string(),
                fix: OrphanFix::Delete,
            },
        });
        assert!(matches!(
            AgentState::from_config(config.clone()),
            Err(ConfigError::InvalidCheck { .. })
        ));

        config.integrity.checks.clear();
        config.error_monitor.log_path = Some(dir.path().join("errors.jsonl").display().to_string());
        let state = AgentState::from_config(config).unwrap();
        assert!(state.target.is_some());
        assert_eq!(state.detectors.len(), 1);
        assert_eq!(state.detectors[0].name(), "error_monitor");
    }
}
