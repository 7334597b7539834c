//! HTTP invocation endpoint.
//!
//! `POST /api/maintenance/tick` runs one tick. Scheduled callers send
//! `Authorization: Bearer <secret>`; interactive callers send
//! `X-Manual-Trigger: true`. `GET /healthz` answers without touching the store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;

use crate::error::AuthError;
use crate::state::AgentState;
use crate::trigger::{handle_trigger, TickResponse, TriggerRequest};

pub const MANUAL_TRIGGER_HEADER: &str = "x-manual-trigger";

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_secs: Option<u64>,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let (status, retry_after_secs) = match err {
            AuthError::RateLimited { retry_after_secs } => (StatusCode::TOO_MANY_REQUESTS, Some(retry_after_secs)),
            _ => (StatusCode::UNAUTHORIZED, None),
        };
        Self {
            status,
            message: err.to_string(),
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                ok: false,
                error: self.message,
            }),
        )
            .into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Read the trigger credentials off the request headers.
pub fn trigger_request(headers: &HeaderMap) -> TriggerRequest {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let manual = headers
        .get(MANUAL_TRIGGER_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1");
    TriggerRequest { authorization, manual }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

async fn tick(State(state): State<Arc<AgentState>>, headers: HeaderMap) -> Result<Json<TickResponse>, ApiError> {
    let request = trigger_request(&headers);
    match handle_trigger(state, request, Utc::now()).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            log::warn!("Server: rejected tick: {}", e);
            Err(e.into())
        }
    }
}

pub fn build_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/maintenance/tick", post(tick))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(state: Arc<AgentState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Server: listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    log::info!("Server: shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::types::Config;

    fn state() -> Arc<AgentState> {
        let config = Config {
            trigger_secret: Some("s3cret".to_string()),
            ..Default::default()
        };
        Arc::new(AgentState::with_parts(config, test_db(), None))
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_trigger_request_from_headers() {
        let request = trigger_request(&headers(&[("authorization", "Bearer abc")]));
        assert_eq!(request.authorization.as_deref(), Some("Bearer abc"));
        assert!(!request.manual);

        assert!(trigger_request(&headers(&[(MANUAL_TRIGGER_HEADER, "True")])).manual);
        assert!(!trigger_request(&headers(&[(MANUAL_TRIGGER_HEADER, "no")])).manual);
    }

    #[tokio::test]
    async fn test_tick_with_secret() {
        let Json(response) = tick(State(state()), headers(&[("authorization", "Bearer s3cret")]))
            .await
            .unwrap();
        assert_eq!(response.tasks_processed, 0);
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn test_bad_secret_is_unauthorized() {
        let err = tick(State(state()), headers(&[("authorization", "Bearer nope")]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        let response = err.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_manual_rate_limit_sets_retry_after() {
        let state = state();
        let Json(first) = tick(State(Arc::clone(&state)), headers(&[(MANUAL_TRIGGER_HEADER, "true")]))
            .await
            .unwrap();
        assert_eq!(first.tasks_processed, 0);
        let err = tick(State(state), headers(&[(MANUAL_TRIGGER_HEADER, "true")]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        let response = err.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_some());
    }
}
