//! Auto-fix executor for data-integrity tasks.
//!
//! Every fix runs in one target transaction: count violations, journal the
//! rows about to change into the engine's `fix_journal`, mutate, count again.
//! The journal holds enough to put the rows back (`revert_fix`).

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use serde_json::{json, Map, Value as Json};

use crate::db::{AgentDb, NewJournalEntry};
use crate::detectors::integrity::{violation, Violation};
use crate::error::FixError;
use crate::target::TargetDb;
use crate::types::{IntegrityCheck, IntegrityRule, OrphanFix, TimestampFallback};
use crate::util::quote_ident;

/// What one applied fix did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub journal_id: String,
    pub check_name: String,
    pub table: String,
    pub rows_affected: usize,
    pub before_count: i64,
    pub after_count: i64,
}

impl FixOutcome {
    /// Task result line, e.g. `Fixed 30 rows in orders (orphaned_orders): 30 → 0`.
    pub fn summary(&self) -> String {
        format!(
            "Fixed {} rows in {} ({}): {} → {}",
            self.rows_affected, self.table, self.check_name, self.before_count, self.after_count
        )
    }
}

/// The mutation a rule calls for, resolved against the target schema.
enum Correction {
    Delete,
    Set { column: String, value: SetValue },
}

enum SetValue {
    Literal(String),
    Column(String),
}

impl Correction {
    fn action(&self) -> &'static str {
        match self {
            Correction::Delete => "delete",
            Correction::Set { .. } => "update",
        }
    }
}

fn correction(conn: &Connection, rule: &IntegrityRule) -> Result<Correction, FixError> {
    match rule {
        IntegrityRule::OrphanedRows { fix: OrphanFix::Delete, .. } => Ok(Correction::Delete),
        IntegrityRule::OrphanedRows {
            column,
            parent_table,
            parent_column,
            fix: OrphanFix::Relink { value },
            ..
        } => {
            let parent = quote_ident(parent_table).map_err(FixError::InvalidCheck)?;
            let pcol = quote_ident(parent_column).map_err(FixError::InvalidCheck)?;
            let exists: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE {} = ?1", parent, pcol),
                params![value],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(FixError::MissingRelinkTarget {
                    table: parent_table.clone(),
                    value: value.clone(),
                });
            }
            Ok(Correction::Set {
                column: quote_ident(column).map_err(FixError::InvalidCheck)?,
                value: SetValue::Literal(value.clone()),
            })
        }
        IntegrityRule::MissingTimestamp { column, fallback, .. } => {
            let value = match fallback {
                TimestampFallback::Column { name } => {
                    SetValue::Column(quote_ident(name).map_err(FixError::InvalidCheck)?)
                }
                TimestampFallback::Fixed { value } => SetValue::Literal(value.clone()),
            };
            Ok(Correction::Set {
                column: quote_ident(column).map_err(FixError::InvalidCheck)?,
                value,
            })
        }
    }
}

fn rule_column(rule: &IntegrityRule) -> Option<&str> {
    match rule {
        IntegrityRule::OrphanedRows { fix: OrphanFix::Delete, .. } => None,
        IntegrityRule::OrphanedRows { column, .. } | IntegrityRule::MissingTimestamp { column, .. } => {
            Some(column)
        }
    }
}

// =============================================================================
// SQLite value <-> JSON
// =============================================================================

fn value_to_json(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => json!({ "$blob": hex::encode(b) }),
    }
}

fn json_to_value(value: &Json) -> Result<Value, FixError> {
    Ok(match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Integer(*b as i64),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::Text(s.clone()),
        Json::Object(obj) => match obj.get("$blob").and_then(Json::as_str) {
            Some(encoded) => Value::Blob(
                hex::decode(encoded).map_err(|e| FixError::Journal(format!("bad blob in journal: {}", e)))?,
            ),
            None => Value::Text(value.to_string()),
        },
        Json::Array(_) => Value::Text(value.to_string()),
    })
}

fn snapshot_row(conn: &Connection, table: &str, rowid: i64) -> Result<Json, FixError> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE rowid = ?1", table))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let values = stmt.query_row(params![rowid], |row| {
        let mut values = Map::new();
        for (i, name) in columns.iter().enumerate() {
            values.insert(name.clone(), value_to_json(row.get_ref(i)?));
        }
        Ok(values)
    })?;
    Ok(json!({ "rowid": rowid, "values": values }))
}

fn column_value(conn: &Connection, table: &str, column: &str, rowid: i64) -> Result<Json, FixError> {
    Ok(conn.query_row(
        &format!("SELECT {} FROM {} WHERE rowid = ?1", column, table),
        params![rowid],
        |row| Ok(value_to_json(row.get_ref(0)?)),
    )?)
}

/// Name of the column aliasing `rowid` (a lone `INTEGER PRIMARY KEY`), if any.
fn rowid_alias(conn: &Connection, table: &str) -> Result<Option<String>, FixError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let pk: Vec<(String, String)> = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, i64>(5)?))
        })?
        .filter_map(|r| r.ok())
        .filter(|(_, _, pk)| *pk > 0)
        .map(|(name, ty, _)| (name, ty))
        .collect();
    Ok(match pk.as_slice() {
        [(name, ty)] if ty.eq_ignore_ascii_case("INTEGER") => Some(name.clone()),
        _ => None,
    })
}

// =============================================================================
// Apply
// =============================================================================

/// Mutate the violating rows and journal them. Runs entirely inside one
/// target transaction; the journal row is written before commit and removed
/// again if the commit fails.
fn mutate(
    conn: &Connection,
    violation: &Violation,
    fix: &Correction,
) -> Result<(usize, i64, i64, Json), FixError> {
    let before = violation.count(conn)?;
    let rowids: Vec<i64> = {
        let mut stmt = conn.prepare(&violation.rowids_sql())?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let ids = rows.collect::<Result<Vec<i64>, _>>()?;
        ids
    };

    let mut journal_rows = Vec::with_capacity(rowids.len());
    for rowid in &rowids {
        match fix {
            Correction::Delete => {
                journal_rows.push(snapshot_row(conn, &violation.table, *rowid)?);
                conn.execute(
                    &format!("DELETE FROM {} WHERE rowid = ?1", violation.table),
                    params![rowid],
                )?;
            }
            Correction::Set { column, value } => {
                let previous = column_value(conn, &violation.table, column, *rowid)?;
                journal_rows.push(json!({ "rowid": rowid, "previous": previous }));
                match value {
                    SetValue::Literal(v) => conn.execute(
                        &format!("UPDATE {} SET {} = ?1 WHERE rowid = ?2", violation.table, column),
                        params![v, rowid],
                    )?,
                    SetValue::Column(source) => conn.execute(
                        &format!(
                            "UPDATE {} SET {} = {} WHERE rowid = ?1",
                            violation.table, column, source
                        ),
                        params![rowid],
                    )?,
                };
            }
        }
    }

    let after = violation.count(conn)?;
    Ok((rowids.len(), before, after, Json::Array(journal_rows)))
}

/// Apply the corrective action registered for `check`.
pub fn apply_fix(
    agent: &AgentDb,
    target: &TargetDb,
    check: &IntegrityCheck,
    task_id: Option<&str>,
    now: &str,
) -> Result<FixOutcome, FixError> {
    let violation = violation(&check.rule).map_err(FixError::InvalidCheck)?;
    let table = check.rule.table().to_string();
    let mut journaled: Option<String> = None;

    let result = target.with_transaction(|conn| {
        let fix = correction(conn, &check.rule)?;
        let (affected, before, after, rows) = mutate(conn, &violation, &fix)?;
        let journal_id = agent
            .insert_journal_entry(
                &NewJournalEntry {
                    task_id,
                    check_name: &check.name,
                    target_table: &table,
                    action: fix.action(),
                    column_name: rule_column(&check.rule),
                    before_count: before,
                    after_count: after,
                    rows_json: rows.to_string(),
                },
                now,
            )
            .map_err(|e| FixError::Journal(e.to_string()))?;
        journaled = Some(journal_id.clone());
        Ok(FixOutcome {
            journal_id,
            check_name: check.name.clone(),
            table: table.clone(),
            rows_affected: affected,
            before_count: before,
            after_count: after,
        })
    });

    match result {
        Ok(outcome) => {
            log::info!("AutoFix: {}", outcome.summary());
            Ok(outcome)
        }
        Err(e) => {
            if let Some(id) = journaled {
                if let Err(cleanup) = agent.delete_journal_entry(&id) {
                    log::error!("AutoFix: failed to drop journal {} after rollback: {}", id, cleanup);
                }
            }
            Err(e)
        }
    }
}

// =============================================================================
// Revert
// =============================================================================

fn restore(conn: &Connection, table: &str, action: &str, column: Option<&str>, rows: &[Json]) -> Result<usize, FixError> {
    let bad = |what: &str| FixError::Journal(format!("malformed journal row: {}", what));
    let alias = if action == "delete" { rowid_alias(conn, table)? } else { None };

    for row in rows {
        let rowid = row.get("rowid").and_then(Json::as_i64).ok_or_else(|| bad("rowid"))?;
        match action {
            "delete" => {
                let values = row.get("values").and_then(Json::as_object).ok_or_else(|| bad("values"))?;
                let mut names = Vec::with_capacity(values.len() + 1);
                let mut bound = Vec::with_capacity(values.len() + 1);
                if alias.is_none() {
                    names.push("rowid".to_string());
                    bound.push(Value::Integer(rowid));
                }
                for (name, value) in values {
                    names.push(quote_ident(name).map_err(FixError::Journal)?);
                    bound.push(json_to_value(value)?);
                }
                let placeholders: Vec<String> = (1..=bound.len()).map(|i| format!("?{}", i)).collect();
                conn.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        names.join(", "),
                        placeholders.join(", ")
                    ),
                    params_from_iter(bound.iter()),
                )?;
            }
            "update" => {
                let column = quote_ident(column.ok_or_else(|| bad("column"))?).map_err(FixError::Journal)?;
                let previous = json_to_value(row.get("previous").ok_or_else(|| bad("previous"))?)?;
                conn.execute(
                    &format!("UPDATE {} SET {} = ?1 WHERE rowid = ?2", table, column),
                    params![previous, rowid],
                )?;
            }
            other => return Err(FixError::Journal(format!("unknown journal action {}", other))),
        }
    }
    Ok(rows.len())
}

/// Put the rows touched by a journaled fix back. Returns the number restored.
pub fn revert_fix(agent: &AgentDb, target: &TargetDb, journal_id: &str, now: &str) -> Result<usize, FixError> {
    let entry = agent
        .get_journal_entry(journal_id)
        .map_err(|e| FixError::Journal(e.to_string()))?
        .ok_or_else(|| FixError::JournalNotFound(journal_id.to_string()))?;
    if entry.reverted_at.is_some() {
        return Err(FixError::AlreadyReverted(journal_id.to_string()));
    }

    let table = quote_ident(&entry.target_table).map_err(FixError::Journal)?;
    let rows: Vec<Json> = serde_json::from_str(&entry.rows_json)
        .map_err(|e| FixError::Journal(format!("unreadable journal rows: {}", e)))?;
    let mut marked = false;

    let result = target.with_transaction(|conn| {
        let restored = restore(conn, &table, &entry.action, entry.column_name.as_deref(), &rows)?;
        marked = agent
            .mark_journal_reverted(journal_id, now)
            .map_err(|e| FixError::Journal(e.to_string()))?;
        if !marked {
            return Err(FixError::AlreadyReverted(journal_id.to_string()));
        }
        Ok(restored)
    });

    match result {
        Ok(restored) => {
            log::info!(
                "AutoFix: reverted {} ({} rows in {})",
                journal_id,
                restored,
                entry.target_table
            );
            Ok(restored)
        }
        Err(e) => {
            if marked {
                if let Err(cleanup) = agent.clear_journal_reverted(journal_id) {
                    log::error!("AutoFix: failed to clear revert stamp on {}: {}", journal_id, cleanup);
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::detectors::integrity::tests::{orphan_check, seeded_target, timestamp_check};

    const NOW: &str = "2026-03-01T12:00:00.000000Z";

    fn orders(target: &TargetDb) -> Vec<(i64, Option<i64>, Option<String>)> {
        let mut stmt = target
            .conn_ref()
            .prepare("SELECT id, customer_id, created_at FROM orders ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_delete_orphans_then_revert_restores_rows() {
        let agent = test_db();
        let target = seeded_target();
        let original = orders(&target);

        let outcome = apply_fix(&agent, &target, &orphan_check(OrphanFix::Delete), None, NOW).unwrap();
        assert_eq!(outcome.rows_affected, 2);
        assert_eq!((outcome.before_count, outcome.after_count), (2, 0));
        assert_eq!(
            outcome.summary(),
            "Fixed 2 rows in orders (orphaned_orders): 2 → 0"
        );
        assert_eq!(orders(&target).len(), 3);

        let entry = agent.get_journal_entry(&outcome.journal_id).unwrap().unwrap();
        assert_eq!(entry.action, "delete");
        assert!(entry.rows_json.contains("\"customer_id\":99"));

        let restored = revert_fix(&agent, &target, &outcome.journal_id, NOW).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(orders(&target), original);

        assert!(matches!(
            revert_fix(&agent, &target, &outcome.journal_id, NOW),
            Err(FixError::AlreadyReverted(_))
        ));
    }

    #[test]
    fn test_relink_orphans() {
        let agent = test_db();
        let target = seeded_target();
        let check = orphan_check(OrphanFix::Relink { value: "3".to_string() });

        let outcome = apply_fix(&agent, &target, &check, None, NOW).unwrap();
        assert_eq!(outcome.after_count, 0);
        let relinked: Vec<_> = orders(&target)
            .into_iter()
            .filter(|(id, _, _)| *id == 12 || *id == 13)
            .map(|(_, customer, _)| customer)
            .collect();
        assert_eq!(relinked, vec![Some(3), Some(3)]);

        revert_fix(&agent, &target, &outcome.journal_id, NOW).unwrap();
        let back: Vec<_> = orders(&target)
            .into_iter()
            .filter(|(id, _, _)| *id == 12 || *id == 13)
            .map(|(_, customer, _)| customer)
            .collect();
        assert_eq!(back, vec![Some(99), Some(98)]);
    }

    #[test]
    fn test_relink_to_missing_parent_changes_nothing() {
        let agent = test_db();
        let target = seeded_target();
        let check = orphan_check(OrphanFix::Relink { value: "404".to_string() });
        let err = apply_fix(&agent, &target, &check, None, NOW).unwrap_err();
        assert!(matches!(err, FixError::MissingRelinkTarget { .. }));
        assert_eq!(agent.count_where("fix_journal", "check_name = ?1", "orphaned_orders").unwrap(), 0);
        assert_eq!(orders(&target).len(), 5);
    }

    #[test]
    fn test_timestamp_fallback_from_column() {
        let agent = test_db();
        let target = seeded_target();
        let check = timestamp_check(TimestampFallback::Column {
            name: "updated_at".to_string(),
        });

        let outcome = apply_fix(&agent, &target, &check, None, NOW).unwrap();
        assert_eq!(outcome.summary(), "Fixed 1 rows in orders (orders_created_at): 1 → 0");
        let fixed = orders(&target).into_iter().find(|(id, _, _)| *id == 11).unwrap();
        assert_eq!(fixed.2.as_deref(), Some("2026-01-02T00:00:00Z"));

        revert_fix(&agent, &target, &outcome.journal_id, NOW).unwrap();
        let reverted = orders(&target).into_iter().find(|(id, _, _)| *id == 11).unwrap();
        assert_eq!(reverted.2, None);
    }

    #[test]
    fn test_revert_unknown_journal() {
        let agent = test_db();
        let target = seeded_target();
        assert!(matches!(
            revert_fix(&agent, &target, "fix-missing", NOW),
            Err(FixError::JournalNotFound(_))
        ));
    }

    #[test]
    fn test_blob_values_survive_journal() {
        let value = value_to_json(ValueRef::Blob(&[0xde, 0xad]));
        assert_eq!(value, json!({"$blob": "dead"}));
        assert_eq!(json_to_value(&value).unwrap(), Value::Blob(vec![0xde, 0xad]));
    }
}
