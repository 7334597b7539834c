use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::types::{ChangePlan, FileChange};

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn hydrate(raw: (String, String, String, String, i64)) -> Result<ChangePlan, DbError> {
    let (task_id, files_json, testing_notes, created_at, applied) = raw;
    let files: Vec<FileChange> = serde_json::from_str(&files_json)?;
    Ok(ChangePlan::from_row(task_id, files, testing_notes, created_at, applied != 0))
}

impl AgentDb {
    // =========================================================================
    // Change plans
    // =========================================================================

    /// Persist a plan for its task. `applied` is always written as 0; a plan
    /// that has already been applied downstream is left untouched.
    pub fn save_change_plan(&self, plan: &ChangePlan) -> Result<(), DbError> {
        let files_json = serde_json::to_string(&plan.files)?;
        self.conn.execute(
            "INSERT INTO change_plans (task_id, files_json, testing_notes, applied, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(task_id) DO UPDATE SET
                 files_json = excluded.files_json,
                 testing_notes = excluded.testing_notes,
                 created_at = excluded.created_at
             WHERE change_plans.applied = 0",
            params![plan.task_id, files_json, plan.testing_notes, plan.created_at],
        )?;
        Ok(())
    }

    pub fn get_change_plan(&self, task_id: &str) -> Result<Option<ChangePlan>, DbError> {
        let raw = self
            .conn
            .query_row(
                "SELECT task_id, files_json, testing_notes, created_at, applied
                 FROM change_plans WHERE task_id = ?1",
                params![task_id],
                plan_from_row,
            )
            .optional()?;
        raw.map(hydrate).transpose()
    }

    /// Unapplied plans created at or after `since`, oldest first.
    pub fn plans_awaiting_review(&self, since: &str) -> Result<Vec<ChangePlan>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, files_json, testing_notes, created_at, applied
             FROM change_plans
             WHERE applied = 0 AND created_at >= ?1
             ORDER BY created_at, task_id",
        )?;
        let rows = stmt.query_map(params![since], plan_from_row)?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(hydrate(row?)?);
        }
        Ok(plans)
    }
}
