//! Build event streaming: SSE live stream, replay, and agent forwarding.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Duration;

use chengis_core::ResourceId;
use chengis_core::event::{BuildEvent, NewBuildEvent};

use crate::auth::require_agent_token;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Resume cursor: replay everything after this id before going live.
    #[serde(default)]
    pub since: i64,
}

/// Server-Sent Events stream: one `event:`/`id:`/`data:` frame per durable
/// log entry. Reconnecting clients pass `since` to resume without gaps.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Subscribe first so nothing published during replay is missed; the
    // replay/live overlap is deduplicated by id.
    let live = state.bus.subscribe(id).await;
    let backlog = state.bus.replay(id, query.since, 10_000).await?;
    let last_replayed = backlog.last().map(|e| e.id).unwrap_or(query.since);

    let backlog_stream = stream::iter(backlog.into_iter().map(|e| Ok(sse_frame(&e))));
    let live_stream = stream::unfold(
        (live, last_replayed),
        |(mut rx, cursor)| async move {
            loop {
                let event = rx.recv().await?;
                if event.id <= cursor {
                    continue;
                }
                let frame = sse_frame(&event);
                return Some((Ok(frame), (rx, event.id)));
            }
        },
    );

    let combined = futures::StreamExt::chain(backlog_stream, live_stream);
    Ok(Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn sse_frame(event: &BuildEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(data)
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub since: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    1000
}

/// Ascending JSON array of events after the cursor.
pub async fn replay(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<Vec<BuildEvent>>> {
    let events = state
        .bus
        .replay(id, query.since, query.limit.clamp(1, 10_000))
        .await?;
    Ok(Json(events))
}

/// Agents forward their builds' events here; the master republishes them
/// into its own durable log and live streams.
pub async fn forward(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    headers: HeaderMap,
    Json(events): Json<Vec<NewBuildEvent>>,
) -> ApiResult<Json<Value>> {
    require_agent_token(&headers, state.config.distributed.auth_token.as_deref())?;
    if events.len() > 10_000 {
        return Err(ApiError::BadRequest("event batch too large".to_string()));
    }
    let count = events.len();
    for event in events {
        state.bus.publish(id, event).await;
    }
    Ok(Json(json!({ "accepted": count })))
}
