//! Task scheduler.
//!
//! Turns findings and priority directives into tasks:
//! - One task per finding, gated by the severity threshold
//! - One task per directive key
//! - Retryable failures go back to pending after a backoff

use chrono::{DateTime, Utc};

use crate::db::{AgentDb, DbError, NewTask};
use crate::types::{ExecutorConfig, Finding, FindingStatus, PriorityDirective, Severity, TaskKind};
use crate::util::ts;

/// Longest title stored on a task.
const MAX_TITLE_CHARS: usize = 120;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// The task a finding should get, or `None` if it stays inert.
///
/// Sub-threshold findings stay visible but never get a task. The task is
/// immediately eligible and inherits its priority from severity.
pub fn task_for_finding(finding: &Finding, threshold: Severity) -> Option<NewTask> {
    if finding.status != FindingStatus::Open || !finding.severity.is_at_least(threshold) {
        return None;
    }
    let kind = finding.category.task_kind();
    let verb = match kind {
        TaskKind::AutoFix => "Fix",
        TaskKind::Proposal => "Propose change",
    };
    Some(NewTask {
        finding_id: Some(finding.id.clone()),
        directive_key: None,
        kind,
        title: truncate(&format!("{}: {}", verb, finding.description), MAX_TITLE_CHARS),
        detail: finding.description.clone(),
        location: Some(finding.location.clone()).filter(|l| !l.is_empty()),
        priority: finding.severity.priority(),
        scheduled_for: None,
    })
}

/// Directive tasks are always proposals with the directive's own priority.
pub fn task_for_directive(directive: &PriorityDirective) -> NewTask {
    NewTask {
        finding_id: None,
        directive_key: Some(directive.key.clone()),
        kind: TaskKind::Proposal,
        title: truncate(&directive.title, MAX_TITLE_CHARS),
        detail: directive.description.clone(),
        location: directive.location.clone(),
        priority: directive.priority,
        scheduled_for: directive.scheduled_for.map(ts),
    }
}

/// Create tasks for every open, task-less finding at or above `threshold`.
/// Returns the number of tasks created.
pub fn schedule_findings(db: &AgentDb, threshold: Severity, now: &str) -> Result<usize, DbError> {
    let mut created = 0;
    for finding in db.findings_awaiting_task(threshold)? {
        let Some(task) = task_for_finding(&finding, threshold) else {
            continue;
        };
        if let Some(task_id) = db.insert_task(&task, now)? {
            log::info!(
                "Scheduler: {} task {} for {} finding {} (priority {})",
                task.kind,
                task_id,
                finding.severity,
                finding.id,
                task.priority
            );
            created += 1;
        }
    }
    Ok(created)
}

/// Seed tasks from directives. Keys that already have a task are skipped.
pub fn schedule_directives(db: &AgentDb, directives: &[PriorityDirective], now: &str) -> Result<usize, DbError> {
    let mut created = 0;
    for directive in directives {
        if let Some(task_id) = db.insert_task(&task_for_directive(directive), now)? {
            log::info!("Scheduler: task {} seeded by directive {}", task_id, directive.key);
            created += 1;
        }
    }
    Ok(created)
}

/// Apply the retry policy: failed tasks with attempts left become pending
/// again after `retry_backoff_secs`.
pub fn requeue_failures(db: &AgentDb, config: &ExecutorConfig, now: DateTime<Utc>) -> Result<usize, DbError> {
    if !config.auto_requeue {
        return Ok(0);
    }
    let eligible_at = ts(now + chrono::Duration::seconds(config.retry_backoff_secs));
    let requeued = db.requeue_retryable_failures(config.max_attempts, &eligible_at)?;
    if requeued > 0 {
        log::info!("Scheduler: re-queued {} failed tasks, eligible at {}", requeued, eligible_at);
    }
    Ok(requeued)
}
