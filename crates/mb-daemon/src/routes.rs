//! Axum router and HTTP handlers for mb-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. The surface is read-only: liveness and a status
//! snapshot for operators.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::warn;

use crate::{
    api_types::{HealthResponse, QueueDepth, StatusResponse, UnavailableResponse},
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    let depths = match st.queues.depths().await {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "status: queue depths unavailable");
            return unavailable("queue", e.to_string());
        }
    };
    let pending_exports = match st.store.count_pending_exports().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "status: pending export count unavailable");
            return unavailable("store", format!("{e:#}"));
        }
    };

    let body = StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        config_hash: st.config_hash.clone(),
        owner: st.leader.owner().to_string(),
        leader_locks: st.leader.held_locks(),
        queues: depths
            .into_iter()
            .map(|(queue, depth)| QueueDepth {
                queue: queue.as_str().to_string(),
                depth,
            })
            .collect(),
        pending_exports,
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn unavailable(dependency: &str, error: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(UnavailableResponse {
            error,
            dependency: dependency.to_string(),
        }),
    )
        .into_response()
}
