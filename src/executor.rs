//! Task selector and executor.
//!
//! Each tick takes up to `executor.batchSize` eligible tasks in priority
//! order and runs them one at a time:
//! - auto_fix: apply the integrity check's corrective action to the target store
//! - proposal: draft a change plan and store it for review
//!
//! The conditional claim in `db/tasks.rs` is the only concurrency control. A
//! task this invocation fails to claim belongs to someone else and is skipped.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::autofix::apply_fix;
use crate::db::{AgentDb, DbError};
use crate::detectors::integrity::check_name;
use crate::error::ExecutionError;
use crate::proposer::ProposalRequest;
use crate::state::AgentState;
use crate::types::{Task, TaskKind};
use crate::util::{tick_clock, ts};

/// What one execution phase did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Tasks this invocation claimed and ran to a terminal state.
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Selected but claimed by an overlapping invocation first.
    pub skipped: usize,
    /// Stale tasks failed because their reclaim would exhaust their attempts.
    pub abandoned: usize,
    pub errors: Vec<String>,
}

/// Claim and run one batch of eligible tasks.
///
/// Only store failures outside a task's own execution are returned as
/// errors. A failing task is recorded on the task and in `errors`.
pub fn execute_batch(
    state: &AgentState,
    db: &AgentDb,
    now: DateTime<Utc>,
    started: Instant,
) -> Result<BatchSummary, DbError> {
    let config = &state.config.executor;
    let budget = Duration::from_secs(config.budget_secs);
    let mut summary = BatchSummary::default();

    let clock = tick_clock(now, started);
    let stale_cutoff = ts(clock - chrono::Duration::seconds(config.stale_after_secs));

    let abandoned = db.sweep_abandoned_tasks(&stale_cutoff, config.max_attempts, &ts(clock))?;
    for id in &abandoned {
        log::warn!("Executor: task {} abandoned after its last attempt", id);
    }
    summary.abandoned = abandoned.len();

    let candidates = db.select_eligible_tasks(&ts(clock), &stale_cutoff, config.max_attempts, config.batch_size)?;
    log::info!("Executor: {} eligible tasks selected", candidates.len());

    for task in candidates {
        if started.elapsed() >= budget {
            log::info!(
                "Executor: budget of {}s spent, leaving remaining tasks for the next tick",
                config.budget_secs
            );
            break;
        }

        let claimed_at = ts(tick_clock(now, started));
        if !db.claim_task(&task.id, &claimed_at, &stale_cutoff, config.max_attempts)? {
            log::info!("Executor: task {} already claimed elsewhere, skipping", task.id);
            summary.skipped += 1;
            continue;
        }
        log::info!("Executor: claimed {} task {} ({})", task.kind, task.id, task.title);
        summary.processed += 1;

        let outcome = execute_task(state, db, &task, &claimed_at);
        let finished_at = ts(tick_clock(now, started));
        match outcome {
            Ok(result) => {
                db.complete_task(&task.id, &result, &finished_at)?;
                log::info!("Executor: task {} completed: {}", task.id, result);
                summary.completed += 1;
            }
            Err(e) => {
                let permanent = !e.is_retryable();
                let attempts = db.fail_task(&task.id, &e.to_string(), permanent, config.max_attempts, &finished_at)?;
                log::warn!(
                    "Executor: task {} failed (attempt {}/{}{}): {}",
                    task.id,
                    attempts.unwrap_or(0),
                    config.max_attempts,
                    if permanent { ", permanent" } else { "" },
                    e
                );
                summary.failed += 1;
                summary.errors.push(format!("task {}: {}", task.id, e));
            }
        }
    }

    Ok(summary)
}

/// Run a claimed task. Returns the result text stored on the task.
fn execute_task(state: &AgentState, db: &AgentDb, task: &Task, now: &str) -> Result<String, ExecutionError> {
    match task.kind {
        TaskKind::AutoFix => execute_auto_fix(state, db, task, now),
        TaskKind::Proposal => execute_proposal(state, db, task, now),
    }
}

fn execute_auto_fix(state: &AgentState, db: &AgentDb, task: &Task, now: &str) -> Result<String, ExecutionError> {
    let finding_id = task
        .finding_id
        .as_deref()
        .ok_or_else(|| ExecutionError::NoCorrectiveAction(task.title.clone()))?;
    let finding = db
        .get_finding(finding_id)?
        .ok_or_else(|| ExecutionError::MissingFinding(finding_id.to_string()))?;
    let name = check_name(&finding.detection_method)
        .ok_or_else(|| ExecutionError::UnknownCheck(finding.detection_method.clone()))?;

    let Some(check) = state.config.integrity.check(name) else {
        if state.config.integrity.endpoint(name).is_some() {
            return Err(ExecutionError::NoCorrectiveAction(format!("endpoint {}", name)));
        }
        return Err(ExecutionError::UnknownCheck(name.to_string()));
    };
    let target = state.target.as_ref().ok_or(ExecutionError::NoTarget)?;

    let outcome = {
        let target = target.lock();
        apply_fix(db, &target, check, Some(&task.id), now)?
    };

    if outcome.after_count > 0 {
        log::warn!(
            "Executor: {} still has {} violating rows after fix {}",
            check.name,
            outcome.after_count,
            outcome.journal_id
        );
        return Err(ExecutionError::Incomplete {
            check: outcome.check_name,
            table: outcome.table,
            before: outcome.before_count,
            after: outcome.after_count,
        });
    }
    db.mark_finding_resolved(&finding.id, now)?;
    Ok(outcome.summary())
}

fn execute_proposal(state: &AgentState, db: &AgentDb, task: &Task, now: &str) -> Result<String, ExecutionError> {
    let request = match task.finding_id.as_deref() {
        Some(finding_id) => {
            let finding = db
                .get_finding(finding_id)?
                .ok_or_else(|| ExecutionError::MissingFinding(finding_id.to_string()))?;
            ProposalRequest::from_finding(&finding, task)
        }
        None => ProposalRequest::from_task(task),
    };

    let plan = state.proposer.propose(&task.id, &request, now)?;
    db.save_change_plan(&plan)?;

    let risk = plan
        .highest_risk()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "none".to_string());
    Ok(format!(
        "Proposed {} file changes (highest risk {}); awaiting review",
        plan.files.len(),
        risk
    ))
}
