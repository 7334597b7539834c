use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::*;

const JOURNAL_COLUMNS: &str = "id, task_id, check_name, target_table, action, column_name,
     before_count, after_count, rows_json, created_at, reverted_at";

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        check_name: row.get(2)?,
        target_table: row.get(3)?,
        action: row.get(4)?,
        column_name: row.get(5)?,
        before_count: row.get(6)?,
        after_count: row.get(7)?,
        rows_json: row.get(8)?,
        created_at: row.get(9)?,
        reverted_at: row.get(10)?,
    })
}

impl AgentDb {
    // =========================================================================
    // Fix journal
    // =========================================================================

    pub fn insert_journal_entry(&self, entry: &NewJournalEntry<'_>, now: &str) -> Result<String, DbError> {
        let id = format!("fix-{}", Uuid::new_v4());
        self.conn.execute(
            "INSERT INTO fix_journal (id, task_id, check_name, target_table, action, column_name,
                 before_count, after_count, rows_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                entry.task_id,
                entry.check_name,
                entry.target_table,
                entry.action,
                entry.column_name,
                entry.before_count,
                entry.after_count,
                entry.rows_json,
                now,
            ],
        )?;
        Ok(id)
    }

    /// Drop an entry whose target mutation never committed.
    pub fn delete_journal_entry(&self, id: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM fix_journal WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_journal_entry(&self, id: &str) -> Result<Option<JournalEntry>, DbError> {
        let sql = format!("SELECT {} FROM fix_journal WHERE id = ?1", JOURNAL_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], journal_from_row)
            .optional()?)
    }

    pub fn journal_for_task(&self, task_id: &str) -> Result<Vec<JournalEntry>, DbError> {
        let sql = format!(
            "SELECT {} FROM fix_journal WHERE task_id = ?1 ORDER BY created_at, id",
            JOURNAL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], journal_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Stamp an entry reverted. False if it already was.
    pub fn mark_journal_reverted(&self, id: &str, now: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE fix_journal SET reverted_at = ?2 WHERE id = ?1 AND reverted_at IS NULL",
            params![id, now],
        )?;
        Ok(changed == 1)
    }

    /// Undo `mark_journal_reverted` when the target restore did not commit.
    pub fn clear_journal_reverted(&self, id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE fix_journal SET reverted_at = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}
