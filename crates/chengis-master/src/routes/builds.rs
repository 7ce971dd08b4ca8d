//! Job and build endpoints: trigger, retry, cancel, agent callbacks.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use chengis_core::ResourceId;
use chengis_core::build::{Build, BuildStatus, Job, TriggerKind};
use chengis_db::{BuildRepo as _, QueueRepo as _};
use chengis_engine::dispatcher::DispatchDecision;

use crate::auth::require_agent_token;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub parameters: std::collections::HashMap<String, String>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    chengis_config::pipeline::validate(&job.pipeline)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.store.builds.create_job(&job).await?;
    Ok((StatusCode::CREATED, Json(json!({ "job_id": job.id }))))
}

pub async fn trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = state.store.builds.get_job_by_name(None, &name).await?;
    let number = state.store.builds.next_build_number(job.id).await?;
    let branch = request
        .branch
        .unwrap_or_else(|| job.default_branch.clone());
    let mut build = Build::new(&job, number, TriggerKind::Api, branch);
    build.parameters.extend(request.parameters);
    state.store.builds.create_build(&build).await?;

    let decision = launch(&state, build.clone(), job).await;
    info!(build_id = %build.id, number, decision = ?decision, "build triggered");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "build_id": build.id,
            "number": number,
            "decision": decision_label(&decision),
        })),
    ))
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let original = state.store.builds.get_build(id).await?;
    if !original.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "build {id} has not finished"
        )));
    }
    let job = state.store.builds.get_job(original.job_id).await?;
    let number = state.store.builds.next_build_number(job.id).await?;
    let retry = original.retry(number);
    state.store.builds.create_build(&retry).await?;

    let decision = launch(&state, retry.clone(), job).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "build_id": retry.id,
            "number": number,
            "root_build_id": retry.root_build_id,
            "attempt": retry.attempt_number,
            "decision": decision_label(&decision),
        })),
    ))
}

/// Run the dispatch decision and, for local builds, hand the attempt to the
/// worker pool.
async fn launch(state: &AppState, build: Build, job: Job) -> DispatchDecision {
    let decision = state.dispatcher.dispatch(&build, &job).await;
    match &decision {
        DispatchDecision::Local => {
            let cancel = CancellationToken::new();
            state.cancels.lock().await.insert(build.id, cancel.clone());
            let runner = state.runner.clone();
            let cancels = state.cancels.clone();
            state.pool.spawn(async move {
                let build_id = build.id;
                runner.run(&build, &job, cancel).await;
                cancels.lock().await.remove(&build_id);
            });
        }
        DispatchDecision::Failed { reason } => {
            let _ = state
                .store
                .builds
                .complete_build(build.id, BuildStatus::Failure, Some(reason), None)
                .await;
        }
        DispatchDecision::Remote { .. } | DispatchDecision::Queued { .. } => {}
    }
    decision
}

fn decision_label(decision: &DispatchDecision) -> Value {
    match decision {
        DispatchDecision::Local => json!({ "mode": "local" }),
        DispatchDecision::Remote { agent_id } => {
            json!({ "mode": "remote", "agent_id": agent_id })
        }
        DispatchDecision::Queued { queue_id } => {
            json!({ "mode": "queued", "queue_id": queue_id })
        }
        DispatchDecision::Failed { reason } => {
            json!({ "mode": "failed", "reason": reason })
        }
    }
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<Json<Value>> {
    let build = state.store.builds.get_build(id).await?;
    Ok(Json(serde_json::to_value(&build).map_err(|e| {
        ApiError::Internal(anyhow::anyhow!(e))
    })?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<StatusCode> {
    let build = state.store.builds.get_build(id).await?;
    if build.status.is_terminal() {
        return Err(ApiError::Conflict(format!("build {id} already finished")));
    }
    if let Some(cancel) = state.cancels.lock().await.get(&id) {
        cancel.cancel();
        info!(build_id = %id, "local build cancel requested");
    } else {
        // Not running locally: drop it from the queue and mark aborted.
        state.store.queue.mark_completed_by_build_id(id).await?;
        state
            .store
            .builds
            .complete_build(id, BuildStatus::Aborted, Some("cancelled"), None)
            .await?;
        state
            .bus
            .publish(
                id,
                chengis_core::event::NewBuildEvent::new(
                    chengis_core::event::BuildEventKind::Cancelled,
                ),
            )
            .await;
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub status: BuildStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failed_stage: Option<String>,
    pub dispatch_token: uuid::Uuid,
}

/// Agent callback once a remote build finishes. Idempotent under the
/// at-least-once queue: completing an already-completed build is a no-op.
pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    headers: HeaderMap,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<Value>> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;

    let build = state.store.builds.get_build(id).await?;
    if build.status.is_terminal() {
        return Ok(Json(json!({ "ok": true, "duplicate": true })));
    }

    state
        .store
        .builds
        .complete_build(
            id,
            request.status,
            request.failure_reason.as_deref(),
            request.failed_stage.as_deref(),
        )
        .await?;
    state.store.queue.mark_completed_by_build_id(id).await?;
    if let Some(agent_id) = build.agent_id {
        state.registry.decrement_builds(agent_id).await;
    }
    info!(build_id = %id, status = %request.status, "remote build completed");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub path: String,
}

/// Chunked artifact upload from an agent.
pub async fn upload_artifact(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<ArtifactQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;
    if query.path.contains("..") {
        return Err(ApiError::BadRequest("artifact path escapes root".to_string()));
    }

    let dest = state.artifact_root.join(id.to_string()).join(&query.path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    }
    tokio::fs::write(&dest, &body)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "path": query.path, "size": body.len() })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub responder: String,
    pub approve: bool,
}

pub async fn respond_approval(
    State(state): State<AppState>,
    Path((build_id, stage)): Path<(ResourceId, String)>,
    Json(request): Json<ApprovalRequest>,
) -> ApiResult<Json<Value>> {
    let status = state
        .approvals
        .respond(build_id, &stage, &request.responder, request.approve)
        .await?;
    Ok(Json(json!({ "status": status })))
}
