//! Master HTTP surface.
//!
//! Exposes the machine API the core is consumed through: agent
//! registration and heartbeats, build triggers and cancellation, the SSE
//! event stream with replay, agent callbacks, and the system summary.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/agents/register", post(routes::agents::register))
        .route("/api/agents/{id}/heartbeat", post(routes::agents::heartbeat))
        .route("/api/agents/{id}/drain", post(routes::agents::drain))
        .route("/api/agents/{id}/deregister", post(routes::agents::deregister))
        .route("/api/agents", get(routes::agents::list))
        .route("/api/jobs", post(routes::builds::create_job))
        .route("/jobs/{name}/trigger", post(routes::builds::trigger))
        .route("/api/builds/{id}", get(routes::builds::get_build))
        .route("/api/builds/{id}/retry", post(routes::builds::retry))
        .route("/api/builds/{id}/cancel", post(routes::builds::cancel))
        .route("/api/builds/{id}/events", get(routes::events::stream))
        .route("/api/builds/{id}/events/replay", get(routes::events::replay))
        .route("/api/builds/{id}/events/forward", post(routes::events::forward))
        .route("/api/builds/{id}/complete", post(routes::builds::complete))
        .route("/api/builds/{id}/artifact", post(routes::builds::upload_artifact))
        .route(
            "/api/approvals/{build_id}/{stage}",
            post(routes::builds::respond_approval),
        )
        .route("/api/system/summary", get(routes::summary))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the master API until the process is signalled.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "master listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
