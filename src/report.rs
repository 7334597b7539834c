//! Report generator: rolling-window summary of maintenance activity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{AgentDb, DbError};
use crate::types::{RiskLevel, TaskStatus};
use crate::util::{parse_ts, ts};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub task_id: String,
    pub files: usize,
    pub highest_risk: Option<RiskLevel>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub task_id: String,
    pub title: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub generated_at: String,
    pub window_start: String,
    pub window_end: String,
    pub tasks_by_status: BTreeMap<String, i64>,
    pub findings_by_category: BTreeMap<String, i64>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    /// completed / (completed + failed); `None` with no terminal tasks.
    pub success_rate: Option<f64>,
    pub mean_task_duration_secs: Option<f64>,
    pub plans_awaiting_review: Vec<PlanSummary>,
    pub tasks_needing_review: Vec<ReviewItem>,
}

impl MaintenanceReport {
    /// Plain-text rendering for log and file sinks.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "Maintenance report {} → {}\n",
            self.window_start, self.window_end
        );
        let statuses: Vec<String> = self
            .tasks_by_status
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!("Tasks: {}\n", statuses.join(", ")));
        let categories: Vec<String> = self
            .findings_by_category
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!("New findings: {}\n", categories.join(", ")));
        match self.success_rate {
            Some(rate) => out.push_str(&format!(
                "Success rate: {:.0}% ({} completed, {} failed)\n",
                rate * 100.0,
                self.tasks_completed,
                self.tasks_failed
            )),
            None => out.push_str("Success rate: n/a\n"),
        }
        if let Some(secs) = self.mean_task_duration_secs {
            out.push_str(&format!("Mean task duration: {:.1}s\n", secs));
        }
        out.push_str(&format!(
            "Plans awaiting review: {}\nTasks needing manual review: {}",
            self.plans_awaiting_review.len(),
            self.tasks_needing_review.len()
        ));
        out
    }
}

/// Aggregate the trailing `window_hours` ending at `now`. Reads only.
pub fn build_report(
    db: &AgentDb,
    now: DateTime<Utc>,
    window_hours: u32,
    max_attempts: i64,
) -> Result<MaintenanceReport, DbError> {
    let start = ts(now - chrono::Duration::hours(i64::from(window_hours)));
    let end = ts(now);

    let tasks_by_status: BTreeMap<String, i64> = db
        .task_status_counts(&start, &end)?
        .into_iter()
        .map(|(status, n)| (status.to_string(), n))
        .collect();
    let findings_by_category: BTreeMap<String, i64> = db
        .finding_category_counts(&start, &end)?
        .into_iter()
        .map(|(category, n)| (category.to_string(), n))
        .collect();

    let terminal = db.terminal_tasks_in_window(&start, &end)?;
    let completed = terminal.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed = terminal.len() - completed;
    let success_rate = (!terminal.is_empty()).then(|| completed as f64 / terminal.len() as f64);

    let durations: Vec<f64> = terminal
        .iter()
        .filter_map(|t| {
            let claimed = parse_ts(t.claimed_at.as_deref()?)?;
            let finished = parse_ts(t.completed_at.as_deref()?)?;
            Some((finished - claimed).num_milliseconds() as f64 / 1000.0)
        })
        .collect();
    let mean_task_duration_secs =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);

    let plans_awaiting_review = db
        .plans_awaiting_review(&start)?
        .into_iter()
        .map(|plan| PlanSummary {
            files: plan.files.len(),
            highest_risk: plan.highest_risk(),
            task_id: plan.task_id,
            created_at: plan.created_at,
        })
        .collect();

    let tasks_needing_review = db
        .tasks_needing_review(max_attempts)?
        .into_iter()
        .map(|task| ReviewItem {
            task_id: task.id,
            title: task.title,
            attempts: task.attempts,
            last_error: task.last_error,
        })
        .collect();

    Ok(MaintenanceReport {
        generated_at: end.clone(),
        window_start: start,
        window_end: end,
        tasks_by_status,
        findings_by_category,
        tasks_completed: completed,
        tasks_failed: failed,
        success_rate,
        mean_task_duration_secs,
        plans_awaiting_review,
        tasks_needing_review,
    })
}

/// Build the report and store it in `maintenance_reports`. Returns the report id.
pub fn generate_report(
    db: &AgentDb,
    now: DateTime<Utc>,
    window_hours: u32,
    max_attempts: i64,
) -> Result<(String, MaintenanceReport), DbError> {
    let report = build_report(db, now, window_hours, max_attempts)?;
    let summary = serde_json::to_string(&report)?;
    let id = db.save_report(&report.generated_at, &report.window_start, &report.window_end, &summary)?;
    log::info!(
        "Report: {} tasks completed, {} failed, {} plans awaiting review",
        report.tasks_completed,
        report.tasks_failed,
        report.plans_awaiting_review.len()
    );
    Ok((id, report))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::NewTask;
    use crate::types::{ChangePlan, FileAction, FileChange, FindingCategory, NewFinding, Severity, TaskKind};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn at(minutes_ago: i64) -> String {
        ts(now() - chrono::Duration::minutes(minutes_ago))
    }

    fn task(db: &AgentDb, title: &str) -> String {
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
            &at(120),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_empty_window() {
        let db = test_db();
        let report = build_report(&db, now(), 24, 3).unwrap();
        assert!(report.success_rate.is_none());
        assert!(report.mean_task_duration_secs.is_none());
        assert!(report.tasks_by_status.is_empty());
    }

    #[test]
    fn test_success_rate_and_mean_duration() {
        let db = test_db();
        let cutoff = at(1000);

        // 3 completed (30s, 60s, 90s), 1 failed (60s).
        for (i, secs) in [30, 60, 90].iter().enumerate() {
            let id = task(&db, &format!("ok-{}", i));
            db.claim_task(&id, &at(60), &cutoff, 3).unwrap();
            let done = ts(now() - chrono::Duration::minutes(60) + chrono::Duration::seconds(*secs));
            db.complete_task(&id, "ok", &done).unwrap();
        }
        let failed = task(&db, "bad");
        db.claim_task(&failed, &at(60), &cutoff, 3).unwrap();
        db.fail_task(&failed, "no fix", true, 3, &at(59)).unwrap();
        task(&db, "waiting");

        db.create_finding(
            &NewFinding {
                category: FindingCategory::Error,
                severity: Severity::High,
                description: "d".to_string(),
                location: "src/a.rs".to_string(),
                detection_method: "error_monitor".to_string(),
                fingerprint: "fp".to_string(),
            },
            &at(30),
        )
        .unwrap();

        let report = build_report(&db, now(), 24, 3).unwrap();
        assert_eq!(report.tasks_completed, 3);
        assert_eq!(report.tasks_failed, 1);
        assert_eq!(report.success_rate, Some(0.75));
        assert_eq!(report.mean_task_duration_secs, Some(60.0));
        assert_eq!(report.tasks_by_status.get("completed"), Some(&3));
        assert_eq!(report.tasks_by_status.get("pending"), Some(&1));
        assert_eq!(report.findings_by_category.get("error"), Some(&1));
        assert_eq!(report.tasks_needing_review.len(), 1);
        assert_eq!(report.tasks_needing_review[0].title, "bad");
    }

    #[test]
    fn test_generate_lists_plans_and_persists() {
        let db = test_db();
        let id = task(&db, "plan me");
        db.save_change_plan(&ChangePlan::new(
            &id,
            vec![FileChange {
                path: "src/lib.rs".to_string(),
                action: FileAction::Modify,
                risk: RiskLevel::High,
                description: "d".to_string(),
                rationale: "r".to_string(),
            }],
            "notes".to_string(),
            at(10),
        ))
        .unwrap();

        let (report_id, report) = generate_report(&db, now(), 24, 3).unwrap();
        assert_eq!(report.plans_awaiting_review.len(), 1);
        assert_eq!(report.plans_awaiting_review[0].highest_risk, Some(RiskLevel::High));

        let stored = db.latest_report().unwrap().unwrap();
        assert_eq!(stored.id, report_id);
        assert!(stored.summary_json.contains("plansAwaitingReview"));
        assert!(report.to_text().contains("Plans awaiting review: 1"));
    }
}
