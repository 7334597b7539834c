use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::types::TriggerSource;
use crate::util::{parse_ts, ts};

impl AgentDb {
    // =========================================================================
    // Trigger log
    // =========================================================================

    /// Record the start of an accepted invocation.
    pub fn begin_trigger(&self, source: TriggerSource, now: &str) -> Result<String, DbError> {
        let id = format!("trg-{}", Uuid::new_v4());
        self.conn.execute(
            "INSERT INTO trigger_log (id, source, started_at) VALUES (?1, ?2, ?3)",
            params![id, source, now],
        )?;
        Ok(id)
    }

    /// Admit a manual trigger unless one was accepted less than
    /// `min_interval_secs` ago. Check and record happen in one transaction,
    /// so two racing manual triggers cannot both get through.
    pub fn admit_manual_trigger(&self, now: DateTime<Utc>, min_interval_secs: u64) -> Result<Admission, DbError> {
        self.with_transaction(|db| {
            let last: Option<String> = db
                .conn
                .query_row(
                    "SELECT MAX(started_at) FROM trigger_log WHERE source = 'manual'",
                    [],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten();

            if let Some(last) = last.as_deref().and_then(parse_ts) {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                if elapsed < min_interval_secs {
                    return Ok(Admission::RateLimited {
                        retry_after_secs: min_interval_secs - elapsed,
                    });
                }
            }

            let id = db.begin_trigger(TriggerSource::Manual, &ts(now))?;
            Ok(Admission::Admitted(id))
        })
    }

    pub fn finish_trigger(&self, id: &str, finished_at: &str, response_json: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE trigger_log SET finished_at = ?2, response_json = ?3 WHERE id = ?1",
            params![id, finished_at, response_json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::test_utils::test_db;
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_manual_rate_limit() {
        let db = test_db();
        let first = db.admit_manual_trigger(at(0), 60).unwrap();
        assert!(matches!(first, Admission::Admitted(_)));

        let second = db.admit_manual_trigger(at(20), 60).unwrap();
        assert_eq!(second, Admission::RateLimited { retry_after_secs: 40 });
        assert_eq!(db.count_where("trigger_log", "source = ?1", "manual").unwrap(), 1);

        let third = db.admit_manual_trigger(at(60), 60).unwrap();
        assert!(matches!(third, Admission::Admitted(_)));
    }

    #[test]
    fn test_scheduled_triggers_do_not_count_against_manual_limit() {
        let db = test_db();
        db.begin_trigger(TriggerSource::Scheduled, &ts(at(0))).unwrap();
        assert!(matches!(
            db.admit_manual_trigger(at(1), 60).unwrap(),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_finish_trigger_records_response() {
        let db = test_db();
        let id = db.begin_trigger(TriggerSource::Scheduled, "t0").unwrap();
        db.finish_trigger(&id, "t1", r#"{"tasksProcessed":0}"#).unwrap();
        let (finished, response): (String, String) = db
            .conn_ref()
            .query_row(
                "SELECT finished_at, response_json FROM trigger_log WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(finished, "t1");
        assert!(response.contains("tasksProcessed"));
    }
}
