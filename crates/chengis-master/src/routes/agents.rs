//! Agent lifecycle endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};

use chengis_core::ResourceId;
use chengis_core::agent::{AgentRegistration, HeartbeatUpdate};

use crate::auth::require_agent_token;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(registration): Json<AgentRegistration>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;
    let agent = state.registry.register(registration).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "agent_id": agent.id,
            "name": agent.name,
            "status": agent.status,
        })),
    ))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    headers: HeaderMap,
    Json(update): Json<HeartbeatUpdate>,
) -> ApiResult<Json<Value>> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;
    if state.registry.heartbeat(id, update).await {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::NotFound(format!("agent {id}")))
    }
}

pub async fn drain(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<Json<Value>> {
    state.registry.set_agent_draining(id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;
    state.registry.deregister(id).await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let agents = state.registry.list_agents().await;
    Json(json!({ "agents": agents }))
}
