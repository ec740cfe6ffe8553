//! Health, liveness, and readiness endpoints driven by the broker
//! connection state.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::broker::{ConnectionManager, ConnectionState};

/// Shared state for the health routes.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

/// Builds the `/health` router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

/// Returns connection details as JSON.
///
/// Always returns 200; the `state` field carries the connection state.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let manager = &state.manager;
    Json(json!({
        "state": manager.state().as_str(),
        "reply_channel": manager.publisher().is_attached(),
        "retry_failures": manager.retry_failures(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: always 200 while the process is responsive.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 once the inbox is being consumed, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.manager.state() == ConnectionState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
