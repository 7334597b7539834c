use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use uuid::Uuid;

use super::*;
use crate::types::{Task, TaskStatus};

pub(super) const TASK_COLUMNS: &str = "id, finding_id, directive_key, kind, title, detail, location, priority,
     status, scheduled_for, attempts, claimed_at, created_at, completed_at, result, last_error";

/// Pending and due. An absent `scheduled_for` means "due now".
const PENDING_ELIGIBLE: &str =
    "(status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= :now))";

/// Claimed by an invocation that never finished, with attempts left to spend.
const STALE_RECLAIMABLE: &str = "(status = 'in_progress'
      AND (claimed_at IS NULL OR claimed_at <= :stale_cutoff)
      AND attempts + 1 < :max_attempts)";

pub(super) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        finding_id: row.get(1)?,
        directive_key: row.get(2)?,
        kind: row.get(3)?,
        title: row.get(4)?,
        detail: row.get(5)?,
        location: row.get(6)?,
        priority: row.get(7)?,
        status: row.get(8)?,
        scheduled_for: row.get(9)?,
        attempts: row.get(10)?,
        claimed_at: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
        result: row.get(14)?,
        last_error: row.get(15)?,
    })
}

impl AgentDb {
    // =========================================================================
    // Tasks
    // =========================================================================

    /// Insert a task. Returns `None` when the finding or directive already has
    /// one (unique indexes on `finding_id` and `directive_key`).
    pub fn insert_task(&self, task: &NewTask, now: &str) -> Result<Option<String>, DbError> {
        let id = format!("tsk-{}", Uuid::new_v4());
        let inserted = self.conn.execute(
            "INSERT INTO tasks (id, finding_id, directive_key, kind, title, detail, location,
                 priority, status, scheduled_for, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, 0, ?10)
             ON CONFLICT DO NOTHING",
            params![
                id,
                task.finding_id,
                task.directive_key,
                task.kind,
                task.title,
                task.detail,
                task.location,
                task.priority,
                task.scheduled_for,
                now,
            ],
        )?;
        Ok((inserted == 1).then_some(id))
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, DbError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], task_from_row).optional()?)
    }

    /// List tasks, most urgent first.
    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: Option<usize>) -> Result<Vec<Task>, DbError> {
        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = status {
            values.push(Value::Text(status.as_str().to_string()));
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC, id");
        if let Some(limit) = limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Up to `limit` tasks that may be claimed at `now`: due pending tasks and
    /// stale in-progress ones, ordered by (priority, created_at).
    pub fn select_eligible_tasks(
        &self,
        now: &str,
        stale_cutoff: &str,
        max_attempts: i64,
        limit: usize,
    ) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE {} OR {}
             ORDER BY priority ASC, created_at ASC, id
             LIMIT :limit",
            TASK_COLUMNS, PENDING_ELIGIBLE, STALE_RECLAIMABLE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::named_params! {
                ":now": now,
                ":stale_cutoff": stale_cutoff,
                ":max_attempts": max_attempts,
                ":limit": limit as i64,
            },
            task_from_row,
        )?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Atomically take ownership of a task.
    ///
    /// The update only matches while the task is still eligible, so of any
    /// number of concurrent callers exactly one sees `true`. Reclaiming a
    /// stale task charges the abandoned run as an attempt. A claimed task's
    /// finding moves to in_progress in the same transaction.
    pub fn claim_task(
        &self,
        id: &str,
        now: &str,
        stale_cutoff: &str,
        max_attempts: i64,
    ) -> Result<bool, DbError> {
        self.with_transaction(|db| {
            let sql = format!(
                "UPDATE tasks
                 SET status = 'in_progress',
                     claimed_at = :now,
                     attempts = attempts + CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END
                 WHERE id = :id AND ({} OR {})",
                PENDING_ELIGIBLE, STALE_RECLAIMABLE
            );
            let changed = db.conn.execute(
                &sql,
                rusqlite::named_params! {
                    ":id": id,
                    ":now": now,
                    ":stale_cutoff": stale_cutoff,
                    ":max_attempts": max_attempts,
                },
            )?;
            if changed == 0 {
                return Ok(false);
            }

            db.conn.execute(
                "UPDATE findings SET status = 'in_progress'
                 WHERE status = 'open'
                   AND id = (SELECT finding_id FROM tasks WHERE id = ?1)",
                params![id],
            )?;
            Ok(true)
        })
    }

    /// in_progress → completed.
    pub fn complete_task(&self, id: &str, result: &str, now: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?2, result = ?3, last_error = NULL
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, now, result],
        )?;
        Ok(changed == 1)
    }

    /// in_progress → failed, charging one attempt.
    ///
    /// A permanent failure exhausts the attempt budget immediately. Once a
    /// task has no attempts left its finding goes back to open for manual
    /// review. Returns the task's attempt count, or `None` if the task was not
    /// in progress.
    pub fn fail_task(
        &self,
        id: &str,
        error: &str,
        permanent: bool,
        max_attempts: i64,
        now: &str,
    ) -> Result<Option<i64>, DbError> {
        self.with_transaction(|db| {
            let changed = db.conn.execute(
                "UPDATE tasks
                 SET status = 'failed',
                     completed_at = ?2,
                     last_error = ?3,
                     attempts = CASE WHEN ?4 THEN MAX(attempts + 1, ?5) ELSE attempts + 1 END
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id, now, error, permanent, max_attempts],
            )?;
            if changed == 0 {
                return Ok(None);
            }

            let (attempts, finding_id): (i64, Option<String>) = db.conn.query_row(
                "SELECT attempts, finding_id FROM tasks WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if attempts >= max_attempts {
                if let Some(finding_id) = finding_id {
                    db.reopen_finding(&finding_id)?;
                }
            }
            Ok(Some(attempts))
        })
    }

    /// Fail stale in-progress tasks whose reclaim would use their last
    /// attempt. Returns the ids of the abandoned tasks.
    pub fn sweep_abandoned_tasks(
        &self,
        stale_cutoff: &str,
        max_attempts: i64,
        now: &str,
    ) -> Result<Vec<String>, DbError> {
        self.with_transaction(|db| {
            let ids: Vec<String> = {
                let mut stmt = db.conn.prepare(
                    "SELECT id FROM tasks
                     WHERE status = 'in_progress'
                       AND (claimed_at IS NULL OR claimed_at <= ?1)
                       AND attempts + 1 >= ?2
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(params![stale_cutoff, max_attempts], |row| row.get(0))?;
                let ids = rows.collect::<Result<Vec<String>, _>>()?;
                ids
            };

            for id in &ids {
                db.conn.execute(
                    "UPDATE tasks
                     SET status = 'failed', completed_at = ?2, attempts = attempts + 1,
                         last_error = 'abandoned: exceeded staleness window on final attempt'
                     WHERE id = ?1",
                    params![id, now],
                )?;
                db.conn.execute(
                    "UPDATE findings SET status = 'open'
                     WHERE status = 'in_progress'
                       AND id = (SELECT finding_id FROM tasks WHERE id = ?1)",
                    params![id],
                )?;
            }
            Ok(ids)
        })
    }

    /// Move retryable failures (attempts left) back to pending, eligible
    /// again at `eligible_at`. The attempt counter is left as the failure set it.
    pub fn requeue_retryable_failures(&self, max_attempts: i64, eligible_at: &str) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "UPDATE tasks
             SET status = 'pending', scheduled_for = ?2, claimed_at = NULL, completed_at = NULL
             WHERE status = 'failed' AND attempts < ?1",
            params![max_attempts, eligible_at],
        )?)
    }

    /// Re-queue one failed task for immediate pickup. Refuses exhausted tasks.
    pub fn requeue_task(&self, id: &str, max_attempts: i64) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE tasks
             SET status = 'pending', scheduled_for = NULL, claimed_at = NULL, completed_at = NULL
             WHERE id = ?1 AND status = 'failed' AND attempts < ?2",
            params![id, max_attempts],
        )?;
        Ok(changed == 1)
    }

    /// Failed tasks that exhausted their attempts and wait on a human.
    pub fn tasks_needing_review(&self, max_attempts: i64) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'failed' AND attempts >= ?1
             ORDER BY completed_at DESC, id",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![max_attempts], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn count_tasks_with_status(&self, status: TaskStatus) -> Result<i64, DbError> {
        self.count_where("tasks", "status = ?1", status.as_str())
    }
}
