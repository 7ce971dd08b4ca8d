//! Route handlers.

pub mod agents;
pub mod builds;
pub mod events;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use std::sync::atomic::Ordering;

use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Aggregate view: agents, queue gauges, breakers, leadership.
pub async fn summary(State(state): State<AppState>) -> Json<Value> {
    let registry = state.registry.registry_summary().await;
    let metrics = state.processor.metrics();
    Json(json!({
        "agents": registry,
        "queue": {
            "depth": metrics.queue_depth.load(Ordering::Relaxed),
            "dead_letter": metrics.dead_letter_count.load(Ordering::Relaxed),
            "oldest_pending_age_ms": metrics.oldest_pending_age_ms.load(Ordering::Relaxed),
        },
        "circuit_breakers_open": state.breakers.count_open(),
        "leading": state.leader.is_leading(),
        "local_builds_active": state.pool.active_count(),
    }))
}
