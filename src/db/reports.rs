use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::tasks::{task_from_row, TASK_COLUMNS};
use super::*;
use crate::types::{FindingCategory, Task, TaskStatus};

impl AgentDb {
    // =========================================================================
    // Report aggregates
    // =========================================================================

    /// Task counts by status for tasks created or finished inside the window.
    pub fn task_status_counts(&self, start: &str, end: &str) -> Result<Vec<(TaskStatus, i64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM tasks
             WHERE (created_at >= ?1 AND created_at <= ?2)
                OR (completed_at >= ?1 AND completed_at <= ?2)
             GROUP BY status
             ORDER BY status",
        )?;
        let rows = stmt.query_map(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Finding counts by category for findings created inside the window.
    pub fn finding_category_counts(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<(FindingCategory, i64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT category, COUNT(*) FROM findings
             WHERE created_at >= ?1 AND created_at <= ?2
             GROUP BY category
             ORDER BY category",
        )?;
        let rows = stmt.query_map(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Tasks that reached completed or failed inside the window.
    pub fn terminal_tasks_in_window(&self, start: &str, end: &str) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE status IN ('completed', 'failed')
               AND completed_at >= ?1 AND completed_at <= ?2
             ORDER BY completed_at, id",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start, end], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    // =========================================================================
    // Stored reports
    // =========================================================================

    pub fn save_report(
        &self,
        generated_at: &str,
        window_start: &str,
        window_end: &str,
        summary_json: &str,
    ) -> Result<String, DbError> {
        let id = format!("rpt-{}", Uuid::new_v4());
        self.conn.execute(
            "INSERT INTO maintenance_reports (id, generated_at, window_start, window_end, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, generated_at, window_start, window_end, summary_json],
        )?;
        Ok(id)
    }

    pub fn latest_report(&self) -> Result<Option<StoredReport>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, generated_at, window_start, window_end, summary_json
                 FROM maintenance_reports
                 ORDER BY generated_at DESC, id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok(StoredReport {
                        id: row.get(0)?,
                        generated_at: row.get(1)?,
                        window_start: row.get(2)?,
                        window_end: row.get(3)?,
                        summary_json: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use crate::types::TaskKind;

    fn insert(db: &AgentDb, title: &str, created_at: &str) -> String {
        db.insert_task(
            &NewTask {
                finding_id: None,
                directive_key: None,
                kind: TaskKind::Proposal,
                title: title.to_string(),
                detail: String::new(),
                location: None,
                priority: 3,
                scheduled_for: None,
            },
            created_at,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_status_counts_cover_created_or_finished_in_window() {
        let db = test_db();
        let old = insert(&db, "old", "2026-02-01T00:00:00.000000Z");
        insert(&db, "new", "2026-03-01T06:00:00.000000Z");
        insert(&db, "ancient", "2026-01-01T00:00:00.000000Z");

        db.claim_task(&old, "2026-03-01T07:00:00.000000Z", "2026-03-01T06:45:00.000000Z", 3)
            .unwrap();
        db.complete_task(&old, "ok", "2026-03-01T07:00:30.000000Z").unwrap();

        let counts = db
            .task_status_counts("2026-03-01T00:00:00.000000Z", "2026-03-02T00:00:00.000000Z")
            .unwrap();
        assert_eq!(counts, vec![(TaskStatus::Completed, 1), (TaskStatus::Pending, 1)]);

        let terminal = db
            .terminal_tasks_in_window("2026-03-01T00:00:00.000000Z", "2026-03-02T00:00:00.000000Z")
            .unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].id, old);
    }

    #[test]
    fn test_latest_report() {
        let db = test_db();
        assert!(db.latest_report().unwrap().is_none());
        db.save_report("2026-03-01T00:00:00.000000Z", "a", "b", "{}").unwrap();
        let id = db
            .save_report("2026-03-02T00:00:00.000000Z", "b", "c", r#"{"x":1}"#)
            .unwrap();
        let latest = db.latest_report().unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.summary_json, r#"{"x":1}"#);
    }
}
