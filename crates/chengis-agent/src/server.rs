//! Agent HTTP surface: build intake and health.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use chengis_core::queue::DispatchPayload;
use chengis_engine::client::AUTH_HEADER;

use crate::AgentWorker;

pub fn router(agent: Arc<AgentWorker>) -> Router {
    Router::new()
        .route("/builds", post(accept_build))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

pub async fn serve(
    agent: Arc<AgentWorker>,
    bind: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(agent);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "agent listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;
    Ok(())
}

/// 202 when the payload lands in the local queue; 503 when the agent is
/// full or draining.
async fn accept_build(
    State(agent): State<Arc<AgentWorker>>,
    headers: HeaderMap,
    Json(payload): Json<DispatchPayload>,
) -> (StatusCode, Json<Value>) {
    if let Some(expected) = &agent.config().auth_token {
        let presented = headers
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != expected {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            );
        }
    }

    let build_id = payload.build_id;
    if agent.accept(payload) {
        info!(build_id = %build_id, "build accepted");
        (StatusCode::ACCEPTED, Json(json!({ "accepted": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "agent at capacity" })),
        )
    }
}

async fn health(State(agent): State<Arc<AgentWorker>>) -> (StatusCode, Json<Value>) {
    if agent.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "saturated" })),
        )
    }
}
