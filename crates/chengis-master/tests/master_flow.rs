//! End-to-end flows over the master API against the development store.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use chengis_config::SystemConfig;
use chengis_core::ResourceId;
use chengis_core::build::{BuildStatus, Job};
use chengis_core::pipeline::{Pipeline, Stage, StepDef, StepKind};
use chengis_db::{BuildRepo as _, Store};
use chengis_master::{AppState, router};

fn echo_job(name: &str) -> Job {
    Job {
        id: ResourceId::new(),
        name: name.to_string(),
        display_name: name.to_string(),
        pipeline: Pipeline {
            name: name.to_string(),
            stages: vec![Stage {
                name: "build".to_string(),
                steps: vec![StepDef {
                    name: "hello".to_string(),
                    kind: StepKind::Shell,
                    command: "echo hello".to_string(),
                    image: None,
                    pull_policy: None,
                    environment: HashMap::new(),
                    working_dir: None,
                    timeout_secs: Some(30),
                }],
                parallel: false,
                container: None,
                when: None,
                approval: None,
                post: Default::default(),
                environment: HashMap::new(),
            }],
            ..Default::default()
        },
        required_labels: Default::default(),
        parameters: HashMap::new(),
        default_branch: "main".to_string(),
        org_id: None,
        repo_url: None,
    }
}

async fn state_with(config_mutator: impl FnOnce(&mut SystemConfig)) -> AppState {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = SystemConfig::default();
    config.workspace.root = workspace.path().to_string_lossy().to_string();
    config_mutator(&mut config);
    // Leak the tempdir so workspaces survive for the test's duration.
    std::mem::forget(workspace);
    AppState::init_with_store(config, Store::development())
        .await
        .unwrap()
}

async fn post_json(state: &AppState, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = router(state.clone())
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn trigger_runs_locally_and_streams_events() {
    let state = state_with(|_| {}).await;
    let job = echo_job("local-svc");
    state.store.builds.create_job(&job).await.unwrap();

    let (status, body) = post_json(
        &state,
        "/jobs/local-svc/trigger",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["decision"]["mode"], "local");
    let build_id: ResourceId = body["build_id"].as_str().unwrap().parse().unwrap();

    // Wait for the pool to finish the build.
    let mut done = false;
    for _ in 0..100 {
        let build = state.store.builds.get_build(build_id).await.unwrap();
        if build.status.is_terminal() {
            assert_eq!(build.status, BuildStatus::Success);
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(done, "build did not finish");

    let events = state.bus.replay(build_id, 0, 1000).await.unwrap();
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));

    state.shutdown().await;
}

#[tokio::test]
async fn queued_build_without_agents_stays_queued() {
    // distributed + queue on, no fallback, feature flag on, and no agents:
    // the build parks in the queue and the processor makes no progress.
    let state = state_with(|config| {
        config.distributed.enabled = true;
        config.distributed.dispatch.queue_enabled = true;
        config.distributed.dispatch.fallback_local = false;
        config.distributed.dispatch.max_retries = 5;
        config.feature_flags.distributed_dispatch = true;
    })
    .await;
    let mut job = echo_job("gpu-svc");
    job.required_labels = ["gpu".to_string()].into_iter().collect();
    state.store.builds.create_job(&job).await.unwrap();

    let (status, body) = post_json(&state, "/jobs/gpu-svc/trigger", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["decision"]["mode"], "queued");
    let build_id: ResourceId = body["build_id"].as_str().unwrap().parse().unwrap();

    // Several processor ticks: the item cycles pending -> no agent -> pending.
    for _ in 0..3 {
        state.processor.run_once().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let build = state.store.builds.get_build(build_id).await.unwrap();
    assert_eq!(build.status, BuildStatus::Queued);
    let metrics = state.processor.metrics();
    assert!(metrics.oldest_pending_age_ms.load(Ordering::Relaxed) >= 0);
    assert_eq!(metrics.dead_letter_count.load(Ordering::Relaxed), 0);

    state.shutdown().await;
}

#[tokio::test]
async fn dispatch_fails_fast_without_queue_or_fallback() {
    let state = state_with(|config| {
        config.distributed.enabled = true;
        config.distributed.dispatch.queue_enabled = false;
        config.distributed.dispatch.fallback_local = false;
        config.feature_flags.distributed_dispatch = true;
    })
    .await;
    let mut job = echo_job("nowhere-svc");
    job.required_labels = ["gpu".to_string()].into_iter().collect();
    state.store.builds.create_job(&job).await.unwrap();

    let (status, body) =
        post_json(&state, "/jobs/nowhere-svc/trigger", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["decision"]["mode"], "failed");

    let build_id: ResourceId = body["build_id"].as_str().unwrap().parse().unwrap();
    let build = state.store.builds.get_build(build_id).await.unwrap();
    assert_eq!(build.status, BuildStatus::Failure);

    state.shutdown().await;
}

#[tokio::test]
async fn replay_endpoint_returns_ascending_events() {
    let state = state_with(|_| {}).await;
    let job = echo_job("replay-svc");
    state.store.builds.create_job(&job).await.unwrap();

    let (_, body) = post_json(&state, "/jobs/replay-svc/trigger", serde_json::json!({})).await;
    let build_id = body["build_id"].as_str().unwrap().to_string();
    let parsed: ResourceId = build_id.parse().unwrap();

    for _ in 0..100 {
        let build = state.store.builds.get_build(parsed).await.unwrap();
        if build.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let response = router(state.clone())
        .oneshot(
            Request::get(format!("/api/builds/{build_id}/events/replay?since=0&limit=100"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let events: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert!(!events.is_empty());
    let ids: Vec<i64> = events.iter().map(|e| e["id"].as_i64().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // Resume after the midpoint returns only the tail.
    let mid = ids[ids.len() / 2];
    let response = router(state.clone())
        .oneshot(
            Request::get(format!(
                "/api/builds/{build_id}/events/replay?since={mid}&limit=100"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let tail: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert!(tail.iter().all(|e| e["id"].as_i64().unwrap() > mid));
    assert_eq!(tail.len(), ids.iter().filter(|id| **id > mid).count());

    state.shutdown().await;
}

#[tokio::test]
async fn agent_register_and_heartbeat_roundtrip() {
    let state = state_with(|config| {
        config.distributed.enabled = true;
        config.distributed.auth_token = Some("shared-secret".to_string());
    })
    .await;

    let registration = serde_json::json!({
        "name": "worker-1",
        "url": "http://worker-1:9090",
        "labels": ["linux"],
        "max_builds": 2,
    });

    // Without the token: rejected.
    let response = router(state.clone())
        .oneshot(
            Request::post("/api/agents/register")
                .header("content-type", "application/json")
                .body(Body::from(registration.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With the token: created.
    let response = router(state.clone())
        .oneshot(
            Request::post("/api/agents/register")
                .header("content-type", "application/json")
                .header("x-chengis-token", "shared-secret")
                .body(Body::from(registration.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let agent_id = body["agent_id"].as_str().unwrap().to_string();

    let response = router(state.clone())
        .oneshot(
            Request::post(format!("/api/agents/{agent_id}/heartbeat"))
                .header("content-type", "application/json")
                .header("x-chengis-token", "shared-secret")
                .body(Body::from(
                    serde_json::json!({ "current_builds": 1 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown agents get 404.
    let response = router(state.clone())
        .oneshot(
            Request::post(format!("/api/agents/{}/heartbeat", ResourceId::new()))
                .header("content-type", "application/json")
                .header("x-chengis-token", "shared-secret")
                .body(Body::from(serde_json::json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state.shutdown().await;
}
