//! DataIntegrityValidator: relational consistency checks on the target store
//! plus reachability probes for permission-gated endpoints.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;

use super::{finding_fingerprint, DetectorContext};
use crate::error::{ConfigError, DetectorError};
use crate::sources::EndpointProbe;
use crate::target::TargetDb;
use crate::types::{
    EndpointCheck, FindingCategory, IntegrityCheck, IntegrityConfig, IntegrityRule, NewFinding, OrphanFix,
    TimestampFallback,
};
use crate::util::quote_ident;

/// Detection method for a check or endpoint; the executor resolves it back.
pub fn detection_method(name: &str) -> String {
    format!("integrity:{}", name)
}

/// Inverse of `detection_method`.
pub fn check_name(detection_method: &str) -> Option<&str> {
    detection_method.strip_prefix("integrity:")
}

/// The rows that violate a rule: `SELECT rowid FROM {table} AS child WHERE {predicate}`.
#[derive(Debug, Clone)]
pub(crate) struct Violation {
    pub table: String,
    pub predicate: String,
}

impl Violation {
    pub fn count_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} AS child WHERE {}",
            self.table, self.predicate
        )
    }

    pub fn rowids_sql(&self) -> String {
        format!(
            "SELECT child.rowid FROM {} AS child WHERE {} ORDER BY child.rowid",
            self.table, self.predicate
        )
    }

    pub fn count(&self, conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row(&self.count_sql(), [], |row| row.get(0))
    }
}

/// Build the violation query for a rule, validating every identifier.
pub(crate) fn violation(rule: &IntegrityRule) -> Result<Violation, String> {
    match rule {
        IntegrityRule::OrphanedRows {
            table,
            column,
            parent_table,
            parent_column,
            ..
        } => {
            let column = quote_ident(column)?;
            Ok(Violation {
                table: quote_ident(table)?,
                predicate: format!(
                    "child.{col} IS NOT NULL AND NOT EXISTS \
                     (SELECT 1 FROM {parent} AS parent WHERE parent.{pcol} = child.{col})",
                    col = column,
                    parent = quote_ident(parent_table)?,
                    pcol = quote_ident(parent_column)?,
                ),
            })
        }
        IntegrityRule::MissingTimestamp { table, column, .. } => {
            let column = quote_ident(column)?;
            Ok(Violation {
                table: quote_ident(table)?,
                predicate: format!("child.{col} IS NULL OR TRIM(child.{col}) = ''", col = column),
            })
        }
    }
}

/// Reject checks whose identifiers could not be queried safely.
pub fn validate_checks(config: &IntegrityConfig) -> Result<(), ConfigError> {
    for check in &config.checks {
        let invalid = |reason: String| ConfigError::InvalidCheck {
            name: check.name.clone(),
            reason,
        };
        violation(&check.rule).map_err(invalid)?;
        match &check.rule {
            IntegrityRule::MissingTimestamp {
                fallback: TimestampFallback::Column { name },
                ..
            } => {
                quote_ident(name).map_err(invalid)?;
            }
            IntegrityRule::OrphanedRows {
                fix: OrphanFix::Relink { value },
                ..
            } if value.trim().is_empty() => {
                return Err(invalid("relink value is empty".to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn describe(check: &IntegrityCheck, count: i64) -> String {
    match &check.rule {
        IntegrityRule::OrphanedRows {
            table,
            column,
            parent_table,
            parent_column,
            ..
        } => format!(
            "{} orphaned rows in {}.{} (no matching {}.{})",
            count, table, column, parent_table, parent_column
        ),
        IntegrityRule::MissingTimestamp { table, column, .. } => {
            format!("{} rows in {} missing required timestamp {}", count, table, column)
        }
    }
}

fn check_finding(check: &IntegrityCheck, count: i64) -> NewFinding {
    let method = detection_method(&check.name);
    let location = check.rule.table().to_string();
    NewFinding {
        category: FindingCategory::DataIntegrity,
        severity: check.severity,
        description: describe(check, count),
        fingerprint: finding_fingerprint(
            FindingCategory::DataIntegrity,
            &method,
            &location,
            check.severity,
            &check.name,
        ),
        location,
        detection_method: method,
    }
}

fn run_checks(target: &Mutex<TargetDb>, checks: &[IntegrityCheck]) -> Result<Vec<NewFinding>, DetectorError> {
    let db = target.lock();

    let mut findings = Vec::new();
    for check in checks {
        let violation = violation(&check.rule)
            .map_err(|e| DetectorError::Query(format!("{}: {}", check.name, e)))?;
        let count = violation
            .count(db.conn_ref())
            .map_err(|e| DetectorError::Query(format!("{}: {}", check.name, e)))?;
        if count > 0 {
            findings.push(check_finding(check, count));
        }
    }
    Ok(findings)
}

fn endpoint_finding(endpoint: &EndpointCheck, outcome: &str) -> NewFinding {
    let method = detection_method(&endpoint.name);
    NewFinding {
        category: FindingCategory::DataIntegrity,
        severity: endpoint.severity,
        description: format!(
            "Endpoint {} ({}) is unreachable: {}",
            endpoint.name, endpoint.url, outcome
        ),
        location: endpoint.url.clone(),
        fingerprint: finding_fingerprint(
            FindingCategory::DataIntegrity,
            &method,
            &endpoint.url,
            endpoint.severity,
            &endpoint.name,
        ),
        detection_method: method,
    }
}

pub struct IntegrityValidator {
    config: IntegrityConfig,
    target: Option<Arc<Mutex<TargetDb>>>,
    probe: Box<dyn EndpointProbe>,
}

impl IntegrityValidator {
    pub fn new(
        config: IntegrityConfig,
        target: Option<Arc<Mutex<TargetDb>>>,
        probe: Box<dyn EndpointProbe>,
    ) -> Self {
        Self { config, target, probe }
    }

    pub async fn scan(&self, _ctx: &DetectorContext) -> Result<Vec<NewFinding>, DetectorError> {
        let mut findings = Vec::new();

        if !self.config.checks.is_empty() {
            let target = self
                .target
                .clone()
                .ok_or_else(|| DetectorError::Source("no target database configured".to_string()))?;
            let checks = self.config.checks.clone();
            let found = tokio::task::spawn_blocking(move || run_checks(&target, &checks))
                .await
                .map_err(|e| DetectorError::Panicked(e.to_string()))??;
            findings.extend(found);
        }

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        for endpoint in &self.config.endpoints {
            match self.probe.status(&endpoint.url, timeout).await {
                Ok(status) if endpoint.expect_status.contains(&status) => {}
                Ok(status) => findings.push(endpoint_finding(endpoint, &format!("answered HTTP {}", status))),
                Err(e) => findings.push(endpoint_finding(endpoint, &format!("no answer ({})", e))),
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::types::Severity;

    /// Target store with 3 customers and 5 orders: 2 orphaned, 1 missing created_at.
    pub(crate) fn seeded_target() -> TargetDb {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER,
                 total REAL NOT NULL,
                 created_at TEXT,
                 updated_at TEXT NOT NULL
             );
             INSERT INTO customers (id, name) VALUES (1, 'Ada'), (2, 'Grace'), (3, 'Edsger');
             INSERT INTO orders (id, customer_id, total, created_at, updated_at) VALUES
                 (10, 1, 12.5, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
                 (11, 2, 8.0, NULL, '2026-01-02T00:00:00Z'),
                 (12, 99, 3.25, '2026-01-03T00:00:00Z', '2026-01-03T00:00:00Z'),
                 (13, 98, 4.0, '2026-01-04T00:00:00Z', '2026-01-04T00:00:00Z'),
                 (14, NULL, 1.0, '2026-01-05T00:00:00Z', '2026-01-05T00:00:00Z');",
        )
        .unwrap();
        TargetDb::from_connection(conn)
    }

    pub(crate) fn orphan_check(fix: OrphanFix) -> IntegrityCheck {
        IntegrityCheck {
            name: "orphaned_orders".to_string(),
            severity: Severity::Critical,
            rule: IntegrityRule::OrphanedRows {
                table: "orders".to_string(),
                column: "customer_id".to_string(),
                parent_table: "customers".to_string(),
                parent_column: "id".to_string(),
                fix,
            },
        }
    }

    pub(crate) fn timestamp_check(fallback: TimestampFallback) -> IntegrityCheck {
        IntegrityCheck {
            name: "orders_created_at".to_string(),
            severity: Severity::Medium,
            rule: IntegrityRule::MissingTimestamp {
                table: "orders".to_string(),
                column: "created_at".to_string(),
                fallback,
            },
        }
    }

    struct StubProbe(HashMap<String, Result<u16, String>>);

    #[async_trait::async_trait]
    impl EndpointProbe for StubProbe {
        async fn status(&self, url: &str, _timeout: Duration) -> Result<u16, String> {
            self.0
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err("connection refused".to_string()))
        }
    }

    fn ctx() -> DetectorContext {
        DetectorContext {
            now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_violation_counts() {
        let target = seeded_target();
        let orphans = violation(&orphan_check(OrphanFix::Delete).rule).unwrap();
        assert_eq!(orphans.count(target.conn_ref()).unwrap(), 2);
        let missing = violation(
            &timestamp_check(TimestampFallback::Column {
                name: "updated_at".to_string(),
            })
            .rule,
        )
        .unwrap();
        assert_eq!(missing.count(target.conn_ref()).unwrap(), 1);
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let mut check = orphan_check(OrphanFix::Delete);
        if let IntegrityRule::OrphanedRows { table, .. } = &mut check.rule {
            *table = "orders; DROP TABLE customers".to_string();
        }
        assert!(violation(&check.rule).is_err());
        let config = IntegrityConfig {
            checks: vec![check],
            ..Default::default()
        };
        assert!(matches!(
            validate_checks(&config),
            Err(ConfigError::InvalidCheck { .. })
        ));
    }

    #[test]
    fn test_detection_method_roundtrip() {
        assert_eq!(check_name(&detection_method("orphaned_orders")), Some("orphaned_orders"));
        assert_eq!(check_name("error_monitor"), None);
    }

    #[tokio::test]
    async fn test_scan_reports_checks_and_unreachable_endpoints() {
        let mut probes = HashMap::new();
        probes.insert("http://svc/admin".to_string(), Ok(403));
        probes.insert("http://svc/billing".to_string(), Ok(502));

        let config = IntegrityConfig {
            checks: vec![
                orphan_check(OrphanFix::Delete),
                timestamp_check(TimestampFallback::Fixed {
                    value: "1970-01-01T00:00:00Z".to_string(),
                }),
            ],
            endpoints: vec![
                EndpointCheck {
                    name: "admin".to_string(),
                    url: "http://svc/admin".to_string(),
                    expect_status: vec![200, 401, 403],
                    severity: Severity::High,
                },
                EndpointCheck {
                    name: "billing".to_string(),
                    url: "http://svc/billing".to_string(),
                    expect_status: vec![200, 401, 403],
                    severity: Severity::High,
                },
            ],
            probe_timeout_secs: 1,
        };
        let validator = IntegrityValidator::new(
            config,
            Some(Arc::new(Mutex::new(seeded_target()))),
            Box::new(StubProbe(probes)),
        );

        let findings = validator.scan(&ctx()).await.unwrap();
        let methods: Vec<_> = findings.iter().map(|f| f.detection_method.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "integrity:orphaned_orders",
                "integrity:orders_created_at",
                "integrity:billing"
            ]
        );
        assert_eq!(findings[0].description, "2 orphaned rows in orders.customer_id (no matching customers.id)");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[2].description.contains("HTTP 502"));
    }

    #[tokio::test]
    async fn test_checks_without_target_fail_the_detector() {
        let validator = IntegrityValidator::new(
            IntegrityConfig {
                checks: vec![orphan_check(OrphanFix::Delete)],
                ..Default::default()
            },
            None,
            Box::new(StubProbe(HashMap::new())),
        );
        let err = validator.scan(&ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "source");
    }

    #[tokio::test]
    async fn test_failing_check_query_is_query_error() {
        let mut check = orphan_check(OrphanFix::Delete);
        if let IntegrityRule::OrphanedRows { table, .. } = &mut check.rule {
            *table = "missing_table".to_string();
        }
        let validator = IntegrityValidator::new(
            IntegrityConfig {
                checks: vec![check],
                ..Default::default()
            },
            Some(Arc::new(Mutex::new(seeded_target()))),
            Box::new(StubProbe(HashMap::new())),
        );
        let err = validator.scan(&ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "query");
    }
}
