//! Versioned schema for the engine store.
//!
//! SQL files under `migrations/` are compiled in and applied in version order.
//! `schema_version` records one row per applied file.

use rusqlite::Connection;

/// (version, SQL) pairs in ascending version order.
const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn latest_known() -> i32 {
    MIGRATIONS.last().map(|(version, _)| *version).unwrap_or(0)
}

fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Cannot create schema_version: {}", e))
}

/// Highest applied version; 0 for an empty store.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("Cannot read schema_version: {}", e))
}

/// Copy an existing file-backed store to `<path>.pre-migration.bak` before
/// upgrading it. Empty and in-memory stores have nothing worth keeping.
fn snapshot_before_upgrade(conn: &Connection, from_version: i32) -> Result<(), String> {
    if from_version == 0 {
        return Ok(());
    }
    let path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Cannot resolve store path: {}", e))?;
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    let snapshot_path = format!("{}.pre-migration.bak", path);
    let mut snapshot = Connection::open(&snapshot_path)
        .map_err(|e| format!("Cannot open snapshot {}: {}", snapshot_path, e))?;
    rusqlite::backup::Backup::new(conn, &mut snapshot)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("Snapshot of schema v{} failed: {}", from_version, e))?;

    log::info!("Migrations: snapshot of v{} written to {}", from_version, snapshot_path);
    Ok(())
}

/// Bring the store up to the latest schema and return how many versions were
/// applied.
///
/// Each version's SQL and its `schema_version` row commit together. A store
/// written by a newer build is left untouched.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;
    let current = current_version(conn)?;
    let latest = latest_known();

    if current > latest {
        return Err(format!(
            "Store schema v{} is newer than this build (v{}); upgrade maintenance-agent first",
            current, latest
        ));
    }
    if current == latest {
        return Ok(0);
    }

    snapshot_before_upgrade(conn, current)?;

    let mut applied = 0;
    for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
        conn.execute_batch(&format!(
            "BEGIN IMMEDIATE;\n{}\nINSERT INTO schema_version (version) VALUES ({});\nCOMMIT;",
            sql, version
        ))
        .map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK;");
            format!("Schema v{} failed: {}", version, e)
        })?;
        log::info!("Migrations: applied v{}", version);
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1, "should apply exactly 1 migration (baseline)");
        assert_eq!(current_version(&conn).expect("version query"), 1);

        for table in ["findings", "tasks", "change_plans", "fix_journal", "maintenance_reports", "trigger_log"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or_else(|e| panic!("{} should exist: {}", table, e));
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_schema_rejects_second_open_finding_with_same_fingerprint() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO findings (id, category, severity, description, detection_method,
                          fingerprint, status, created_at, last_seen_at)
                      VALUES (?1, 'error', 'high', 'd', 'm', 'fp', ?2, 't', 't')";
        conn.execute(insert, ["f1", "open"]).unwrap();
        assert!(conn.execute(insert, ["f2", "in_progress"]).is_err());

        // A fixed finding does not block a fresh one with the same fingerprint.
        conn.execute("UPDATE findings SET status = 'fixed' WHERE id = 'f1'", [])
            .unwrap();
        conn.execute(insert, ["f3", "open"]).unwrap();
    }

    #[test]
    fn test_schema_keeps_finding_content_immutable() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO findings (id, category, severity, description, detection_method,
                 fingerprint, created_at, last_seen_at)
             VALUES ('f1', 'error', 'high', 'd', 'm', 'fp', 't', 't')",
            [],
        )
        .unwrap();
        assert!(conn
            .execute("UPDATE findings SET severity = 'low' WHERE id = 'f1'", [])
            .is_err());
        conn.execute("UPDATE findings SET last_seen_at = 't2' WHERE id = 'f1'", [])
            .expect("last_seen_at stays mutable");
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(err.contains("newer than this build"), "unexpected error: {}", err);
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).expect("first run"), 1);
        assert_eq!(run_migrations(&conn).expect("second run"), 0);
        assert_eq!(current_version(&conn).expect("version query"), 1);
    }

    #[test]
    fn test_fresh_file_db_skips_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("agent.db");
        let conn = Connection::open(&db_path).expect("open db");
        run_migrations(&conn).expect("migrations should succeed");
        assert!(!dir.path().join("agent.db.pre-migration.bak").exists());
    }
}
