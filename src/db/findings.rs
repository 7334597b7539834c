use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use uuid::Uuid;

use super::*;
use crate::types::{Finding, FindingStatus, NewFinding, Severity};

const FINDING_COLUMNS: &str = "id, category, severity, description, location, detection_method,
     fingerprint, status, created_at, last_seen_at, seen_count, resolved_at";

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<Finding> {
    Ok(Finding {
        id: row.get(0)?,
        category: row.get(1)?,
        severity: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        detection_method: row.get(5)?,
        fingerprint: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        last_seen_at: row.get(9)?,
        seen_count: row.get(10)?,
        resolved_at: row.get(11)?,
    })
}

impl AgentDb {
    // =========================================================================
    // Findings
    // =========================================================================

    /// Insert a finding unconditionally. Fails if an unresolved finding with
    /// the same fingerprint exists (unique index).
    pub fn create_finding(&self, finding: &NewFinding, now: &str) -> Result<String, DbError> {
        let id = format!("fnd-{}", Uuid::new_v4());
        self.conn.execute(
            "INSERT INTO findings (id, category, severity, description, location,
                 detection_method, fingerprint, status, created_at, last_seen_at, seen_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?8, 1)",
            params![
                id,
                finding.category,
                finding.severity,
                finding.description,
                finding.location,
                finding.detection_method,
                finding.fingerprint,
                now,
            ],
        )?;
        Ok(id)
    }

    /// Create the finding, or refresh last-seen on the unresolved finding that
    /// already carries its fingerprint. Never touches severity or description.
    pub fn dedupe_upsert_finding(&self, finding: &NewFinding, now: &str) -> Result<Upserted, DbError> {
        self.with_transaction(|db| {
            let existing: Option<String> = db
                .conn
                .query_row(
                    "SELECT id FROM findings WHERE fingerprint = ?1 AND status != 'fixed'",
                    params![finding.fingerprint],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(id) => {
                    db.conn.execute(
                        "UPDATE findings SET last_seen_at = ?2, seen_count = seen_count + 1
                         WHERE id = ?1",
                        params![id, now],
                    )?;
                    Ok(Upserted::Refreshed(id))
                }
                None => Ok(Upserted::Created(db.create_finding(finding, now)?)),
            }
        })
    }

    pub fn get_finding(&self, id: &str) -> Result<Option<Finding>, DbError> {
        let sql = format!("SELECT {} FROM findings WHERE id = ?1", FINDING_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], finding_from_row)
            .optional()?)
    }

    /// open → in_progress, when the finding's task is claimed.
    pub fn mark_finding_in_progress(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE findings SET status = 'in_progress' WHERE id = ?1 AND status = 'open'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Mark a finding fixed. A fixed finding is never re-opened.
    pub fn mark_finding_resolved(&self, id: &str, now: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE findings SET status = 'fixed', resolved_at = ?2
             WHERE id = ?1 AND status != 'fixed'",
            params![id, now],
        )?;
        Ok(changed == 1)
    }

    /// in_progress → open, when the finding's task gives up.
    pub fn reopen_finding(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE findings SET status = 'open' WHERE id = ?1 AND status = 'in_progress'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// List findings, newest first.
    pub fn list_findings(&self, filter: &FindingFilter) -> Result<Vec<Finding>, DbError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(category) = filter.category {
            values.push(Value::Text(category.as_str().to_string()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(min) = filter.min_severity {
            let mut placeholders = Vec::new();
            for severity in Severity::ALL.iter().filter(|s| s.is_at_least(min)) {
                values.push(Value::Text(severity.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("severity IN ({})", placeholders.join(", ")));
        }
        if let Some(since) = &filter.since {
            values.push(Value::Text(since.clone()));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM findings", FINDING_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), finding_from_row)?;

        let mut findings = Vec::new();
        for row in rows {
            findings.push(row?);
        }
        Ok(findings)
    }

    /// Open findings at or above `threshold` that have never had a task.
    /// Oldest first, so backlog drains in detection order.
    pub fn findings_awaiting_task(&self, threshold: Severity) -> Result<Vec<Finding>, DbError> {
        let qualifying: Vec<Value> = Severity::ALL
            .iter()
            .filter(|s| s.is_at_least(threshold))
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        let placeholders: Vec<String> = (1..=qualifying.len()).map(|i| format!("?{}", i)).collect();

        let sql = format!(
            "SELECT {} FROM findings f
             WHERE f.status = 'open'
               AND f.severity IN ({})
               AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.finding_id = f.id)
             ORDER BY f.created_at, f.id",
            FINDING_COLUMNS
                .split(',')
                .map(|c| format!("f.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(qualifying.iter()), finding_from_row)?;

        let mut findings = Vec::new();
        for row in rows {
            findings.push(row?);
        }
        Ok(findings)
    }

    /// Number of findings currently in `status`.
    pub fn count_findings_with_status(&self, status: FindingStatus) -> Result<i64, DbError> {
        self.count_where("findings", "status = ?1", status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use crate::types::FindingCategory;

    fn sample(fingerprint: &str, severity: Severity, description: &str) -> NewFinding {
        NewFinding {
            category: FindingCategory::Error,
            severity,
            description: description.to_string(),
            location: "src/api/search.rs:42".to_string(),
            detection_method: "error_monitor".to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn test_identical_output_twice_refreshes_instead_of_duplicating() {
        let db = test_db();
        let finding = sample("fp-1", Severity::High, "12 timeouts");

        let first = db
            .dedupe_upsert_finding(&finding, "2026-03-01T10:00:00.000000Z")
            .expect("first");
        let second = db
            .dedupe_upsert_finding(&finding, "2026-03-01T11:00:00.000000Z")
            .expect("second");

        assert!(first.is_created());
        assert_eq!(second, Upserted::Refreshed(first.id().to_string()));

        let open = db
            .list_findings(&FindingFilter {
                status: Some(FindingStatus::Open),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].seen_count, 2);
        assert_eq!(open[0].created_at, "2026-03-01T10:00:00.000000Z");
        assert_eq!(open[0].last_seen_at, "2026-03-01T11:00:00.000000Z");
    }

    #[test]
    fn test_refresh_never_rewrites_description() {
        let db = test_db();
        let id = db
            .dedupe_upsert_finding(&sample("fp-1", Severity::High, "12 timeouts"), "t1")
            .unwrap();
        db.dedupe_upsert_finding(&sample("fp-1", Severity::High, "40 timeouts"), "t2")
            .unwrap();

        let stored = db.get_finding(id.id()).unwrap().expect("finding");
        assert_eq!(stored.description, "12 timeouts");
        assert_eq!(stored.severity, Severity::High);
    }

    #[test]
    fn test_redetection_after_fix_creates_new_finding() {
        let db = test_db();
        let first = db
            .dedupe_upsert_finding(&sample("fp-1", Severity::High, "d"), "t1")
            .unwrap();
        assert!(db.mark_finding_resolved(first.id(), "t2").unwrap());

        let again = db
            .dedupe_upsert_finding(&sample("fp-1", Severity::High, "d"), "t3")
            .unwrap();
        assert!(again.is_created());
        assert_ne!(again.id(), first.id());

        let fixed = db.get_finding(first.id()).unwrap().unwrap();
        assert_eq!(fixed.status, FindingStatus::Fixed);
        assert_eq!(fixed.resolved_at.as_deref(), Some("t2"));
    }

    #[test]
    fn test_in_progress_finding_still_dedupes() {
        let db = test_db();
        let first = db
            .dedupe_upsert_finding(&sample("fp-1", Severity::High, "d"), "t1")
            .unwrap();
        assert!(db.mark_finding_in_progress(first.id()).unwrap());
        let again = db
            .dedupe_upsert_finding(&sample("fp-1", Severity::High, "d"), "t2")
            .unwrap();
        assert_eq!(again, Upserted::Refreshed(first.id().to_string()));
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let db = test_db();
        let id = db.create_finding(&sample("fp-1", Severity::High, "d"), "t1").unwrap();
        assert!(!db.reopen_finding(&id).unwrap(), "open cannot be reopened");
        assert!(db.mark_finding_in_progress(&id).unwrap());
        assert!(!db.mark_finding_in_progress(&id).unwrap());
        assert!(db.reopen_finding(&id).unwrap());
        assert!(db.mark_finding_resolved(&id, "t2").unwrap());
        assert!(!db.mark_finding_in_progress(&id).unwrap(), "fixed stays fixed");
        assert!(!db.reopen_finding(&id).unwrap());
    }

    #[test]
    fn test_list_filters() {
        let db = test_db();
        db.create_finding(&sample("a", Severity::Critical, "a"), "2026-01-01T00:00:00.000000Z")
            .unwrap();
        db.create_finding(&sample("b", Severity::Low, "b"), "2026-01-02T00:00:00.000000Z")
            .unwrap();
        let mut perf = sample("c", Severity::Medium, "c");
        perf.category = FindingCategory::Performance;
        db.create_finding(&perf, "2026-01-03T00:00:00.000000Z").unwrap();

        let all = db.list_findings(&FindingFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].fingerprint, "c", "newest first");

        let severe = db
            .list_findings(&FindingFilter {
                min_severity: Some(Severity::Medium),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(severe.len(), 2);

        let perf_only = db
            .list_findings(&FindingFilter {
                category: Some(FindingCategory::Performance),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(perf_only.len(), 1);

        let recent = db
            .list_findings(&FindingFilter {
                since: Some("2026-01-02T00:00:00.000000Z".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fingerprint, "c");
    }

    #[test]
    fn test_findings_awaiting_task_respects_threshold() {
        let db = test_db();
        db.create_finding(&sample("a", Severity::Critical, "a"), "t1").unwrap();
        db.create_finding(&sample("b", Severity::Low, "b"), "t2").unwrap();
        let waiting = db.findings_awaiting_task(Severity::Medium).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].fingerprint, "a");
    }
}
