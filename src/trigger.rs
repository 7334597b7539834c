//! Trigger receiver and the tick pipeline.
//!
//! A tick is one bounded pass of detect → schedule → execute → report.
//! Detectors run on the async runtime; everything that touches SQLite runs
//! on the blocking pool. Only `AuthError` is returned to the caller. Any
//! other failure is logged, stored and listed in the response's `errors`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::Admission;
use crate::detectors::{run_detectors, DetectorContext};
use crate::error::AuthError;
use crate::executor::execute_batch;
use crate::report::generate_report;
use crate::scheduler::{requeue_failures, schedule_directives, schedule_findings};
use crate::state::AgentState;
use crate::types::{NewFinding, TriggerSource};
use crate::util::{tick_clock, ts};

/// An invocation as it arrives: an `Authorization` header value, a manual
/// flag, or both. A credential takes precedence over the manual flag.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub authorization: Option<String>,
    pub manual: bool,
}

impl TriggerRequest {
    pub fn bearer(secret: &str) -> Self {
        Self {
            authorization: Some(format!("Bearer {}", secret)),
            manual: false,
        }
    }

    pub fn manual() -> Self {
        Self {
            authorization: None,
            manual: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickResponse {
    pub tasks_processed: usize,
    pub findings_created: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// Verify a bearer `Authorization` value against the configured secret.
///
/// Both sides are hashed first so the comparison does not short-circuit on a
/// matching prefix of the secret.
pub fn check_bearer(authorization: &str, secret: Option<&str>) -> Result<(), AuthError> {
    let secret = secret.filter(|s| !s.is_empty()).ok_or(AuthError::NotConfigured)?;
    let token = authorization
        .trim()
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidCredential)?;

    if Sha256::digest(token.as_bytes()) == Sha256::digest(secret.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidCredential)
    }
}

/// Run `f` against the shared state on the blocking pool.
async fn blocking<T, F>(state: &Arc<AgentState>, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&AgentState) -> T + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| format!("blocking task failed: {}", e))
}

/// Authenticate and record an invocation. Rejections happen before anything
/// is written. Returns the trigger_log id when recording succeeded.
async fn admit(
    state: &Arc<AgentState>,
    request: &TriggerRequest,
    now: DateTime<Utc>,
    errors: &mut Vec<String>,
) -> Result<Option<String>, AuthError> {
    if let Some(authorization) = &request.authorization {
        check_bearer(authorization, state.config.trigger_secret.as_deref())?;
        let recorded = blocking(state, move |s| {
            s.lock_db()
                .begin_trigger(TriggerSource::Scheduled, &ts(now))
                .map_err(|e| e.to_string())
        })
        .await
        .and_then(|r| r);
        return Ok(match recorded {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("Trigger: failed to record scheduled trigger: {}", e);
                errors.push(format!("trigger log: {}", e));
                None
            }
        });
    }

    if !request.manual {
        return Err(AuthError::MissingCredential);
    }
    if !state.config.manual_trigger.enabled {
        return Err(AuthError::ManualDisabled);
    }

    let min_interval = state.config.manual_trigger.min_interval_secs;
    let admission = blocking(state, move |s| {
        s.lock_db()
            .admit_manual_trigger(now, min_interval)
            .map_err(|e| e.to_string())
    })
    .await
    .and_then(|r| r);
    match admission {
        Ok(Admission::Admitted(id)) => Ok(Some(id)),
        Ok(Admission::RateLimited { retry_after_secs }) => {
            log::info!("Trigger: manual trigger rate limited for {}s", retry_after_secs);
            Err(AuthError::RateLimited { retry_after_secs })
        }
        Err(e) => {
            // The rate limit cannot be checked; run anyway and say so.
            log::error!("Trigger: failed to check manual rate limit: {}", e);
            errors.push(format!("trigger log: {}", e));
            Ok(None)
        }
    }
}

/// Entry point for every invocation: authenticate, run one tick, record it.
pub async fn handle_trigger(
    state: Arc<AgentState>,
    request: TriggerRequest,
    now: DateTime<Utc>,
) -> Result<TickResponse, AuthError> {
    let mut admission_errors = Vec::new();
    let trigger_id = admit(&state, &request, now, &mut admission_errors).await?;
    log::info!(
        "Trigger: accepted {} invocation",
        if request.authorization.is_some() { "scheduled" } else { "manual" }
    );

    let mut response = run_tick(Arc::clone(&state), now).await;
    admission_errors.append(&mut response.errors);
    response.errors = admission_errors;

    if let Some(id) = trigger_id {
        let finished_at = ts(now + chrono::Duration::milliseconds(response.duration_ms as i64));
        let json = serde_json::to_string(&response).unwrap_or_default();
        let finished = blocking(&state, move |s| {
            s.lock_db()
                .finish_trigger(&id, &finished_at, &json)
                .map_err(|e| e.to_string())
        })
        .await
        .and_then(|r| r);
        if let Err(e) = finished {
            log::error!("Trigger: failed to record tick result: {}", e);
        }
    }

    Ok(response)
}

#[derive(Debug, Default)]
struct PipelineOutcome {
    findings_created: usize,
    tasks_processed: usize,
    errors: Vec<String>,
}

/// One tick without authentication. Never fails.
pub async fn run_tick(state: Arc<AgentState>, now: DateTime<Utc>) -> TickResponse {
    let started = Instant::now();
    log::info!("Tick: starting at {}", ts(now));

    let ctx = DetectorContext { now };
    let detected = run_detectors(&state.detectors, &ctx, &state.config.detectors).await;

    let outcome = blocking(&state, move |s| run_pipeline(s, detected, now, started))
        .await
        .unwrap_or_else(|e| PipelineOutcome {
            errors: vec![e],
            ..Default::default()
        });

    let response = TickResponse {
        tasks_processed: outcome.tasks_processed,
        findings_created: outcome.findings_created,
        duration_ms: started.elapsed().as_millis() as u64,
        errors: outcome.errors,
    };
    log::info!(
        "Tick: {} findings created, {} tasks processed, {} errors in {}ms",
        response.findings_created,
        response.tasks_processed,
        response.errors.len(),
        response.duration_ms
    );
    response
}

/// The synchronous phases, strictly in order: persist findings, schedule,
/// execute, report.
fn run_pipeline(
    state: &AgentState,
    detected: Vec<NewFinding>,
    now: DateTime<Utc>,
    started: Instant,
) -> PipelineOutcome {
    let mut out = PipelineOutcome::default();
    let clock = || tick_clock(now, started);
    let db = state.lock_db();

    for finding in &detected {
        match db.dedupe_upsert_finding(finding, &ts(clock())) {
            Ok(upserted) if upserted.is_created() => {
                log::info!(
                    "Tick: new {} finding {}: {}",
                    finding.severity,
                    upserted.id(),
                    finding.description
                );
                out.findings_created += 1;
            }
            Ok(_) => {}
            Err(e) => out.errors.push(format!("persist finding {}: {}", finding.location, e)),
        }
    }

    if let Some(source) = &state.directives {
        match source.load() {
            Ok(directives) => {
                if let Err(e) = schedule_directives(&db, &directives, &ts(clock())) {
                    out.errors.push(format!("schedule directives: {}", e));
                }
            }
            Err(e) => out.errors.push(format!("load directives: {}", e)),
        }
    }

    if let Err(e) = schedule_findings(&db, state.config.severity_threshold, &ts(clock())) {
        out.errors.push(format!("schedule findings: {}", e));
    }
    if let Err(e) = requeue_failures(&db, &state.config.executor, clock()) {
        out.errors.push(format!("requeue failures: {}", e));
    }

    match execute_batch(state, &db, now, started) {
        Ok(summary) => {
            out.tasks_processed = summary.processed;
            out.errors.extend(summary.errors);
        }
        Err(e) => out.errors.push(format!("execute: {}", e)),
    }

    let report = generate_report(
        &db,
        clock(),
        state.config.report_window_hours,
        state.config.executor.max_attempts,
    );
    drop(db);
    match report {
        Ok((_, report)) => {
            if let Err(e) = state.sink.deliver(&report) {
                out.errors.push(format!("deliver report: {}", e));
            }
        }
        Err(e) => out.errors.push(format!("report: {}", e)),
    }

    out
}
