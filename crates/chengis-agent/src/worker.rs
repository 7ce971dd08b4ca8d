//! Agent-side build execution.
//!
//! Picks payloads off the intake queue and runs them with the same build
//! runner semantics as the master. Every event the build emits is forwarded
//! upstream in batches, artifacts are uploaded, and the terminal status is
//! reported through the completion callback with the dispatch token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chengis_core::artifact::ArtifactStore;
use chengis_core::build::{Build, BuildStatus, Job, TriggerKind};
use chengis_core::event::{BuildEvent, NewBuildEvent};
use chengis_core::policy::PermissivePolicy;
use chengis_core::queue::DispatchPayload;
use chengis_core::ResourceId;
use chengis_db::BuildRepo as _;
use chengis_db::memory::MemoryStore;
use chengis_engine::approval::ApprovalManager;
use chengis_engine::artifact::LocalArtifactStore;
use chengis_engine::bus::EventBus;
use chengis_engine::pipeline::PipelineExecutor;
use chengis_engine::runner::BuildRunner;
use chengis_executor::ExecutorRegistry;

use crate::{AgentWorker, client::MasterClient};

const FORWARD_BATCH: usize = 100;
const FORWARD_FLUSH: Duration = Duration::from_millis(200);

/// Local execution environment, shared by every build on this agent.
struct ExecutionEnv {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    runner: BuildRunner,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ExecutionEnv {
    fn new(agent: &AgentWorker) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(store.clone()));
        let policy = Arc::new(PermissivePolicy);
        let mut executors = ExecutorRegistry::builtin(policy.clone());
        match chengis_executor::DockerStepExecutor::new(policy.clone()) {
            Ok(docker) => executors.register(Arc::new(docker)),
            Err(e) => warn!(error = %e, "docker unavailable on agent"),
        }
        let approvals = Arc::new(ApprovalManager::new(store.clone()));
        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(executors),
            policy,
            approvals,
            25,
        ));
        let artifact_root = agent.config().workspace_root.join("artifacts");
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(artifact_root));
        let runner = BuildRunner::new(
            store.clone(),
            bus.clone(),
            executor,
            artifacts.clone(),
            agent.config().workspace_root.join("builds"),
        );
        Self {
            store,
            bus,
            runner,
            artifacts,
        }
    }
}

/// Drain the intake queue until shutdown; each build runs on the pool.
pub async fn run_worker_loop(
    agent: Arc<AgentWorker>,
    mut intake: mpsc::Receiver<DispatchPayload>,
    shutdown: CancellationToken,
) {
    let env = Arc::new(ExecutionEnv::new(&agent));
    loop {
        let payload = tokio::select! {
            payload = intake.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let pool = agent.pool().clone();
        let task_agent = agent.clone();
        let env = env.clone();
        pool.spawn(async move {
            run_build(task_agent, env, payload).await;
        });
    }
}

async fn run_build(agent: Arc<AgentWorker>, env: Arc<ExecutionEnv>, payload: DispatchPayload) {
    let build_id = payload.build_id;
    info!(build_id = %build_id, job = %payload.job_name, "remote build starting");

    let job = Job {
        id: payload.job_id,
        name: payload.job_name.clone(),
        display_name: payload.job_name.clone(),
        pipeline: payload.pipeline.clone(),
        required_labels: Default::default(),
        parameters: payload.parameters.clone(),
        default_branch: payload.branch.clone(),
        org_id: payload.org_id,
        repo_url: payload.repo_url.clone(),
    };
    let mut build = Build::new(&job, payload.build_number, TriggerKind::Api, payload.branch.clone());
    build.id = build_id;
    build.root_build_id = build_id;
    if let Err(e) = env.store.create_build(&build).await {
        warn!(build_id = %build_id, error = %e, "local build record failed");
    }

    // Forward events upstream while the build runs.
    let live = env.bus.subscribe(build_id).await;
    let forwarder = tokio::spawn(forward_events(
        agent.client().clone(),
        build_id,
        live,
    ));

    let result = env
        .runner
        .run(&build, &job, CancellationToken::new())
        .await;
    let _ = forwarder.await;

    // Artifacts, then the terminal callback.
    match env.artifacts.list(build_id).await {
        Ok(artifacts) => {
            for artifact in artifacts {
                let local = agent
                    .config()
                    .workspace_root
                    .join("artifacts")
                    .join(build_id.to_string())
                    .join(&artifact.path);
                match tokio::fs::read(&local).await {
                    Ok(content) => {
                        if let Err(e) = agent
                            .client()
                            .upload_artifact(build_id, &artifact.path, content)
                            .await
                        {
                            warn!(build_id = %build_id, path = %artifact.path, error = %e, "artifact upload failed");
                        }
                    }
                    Err(e) => {
                        warn!(path = %local.display(), error = %e, "artifact read failed");
                    }
                }
            }
        }
        Err(e) => warn!(build_id = %build_id, error = %e, "artifact listing failed"),
    }

    report_completion(&agent, build_id, &payload, result.status, &result).await;
}

async fn report_completion(
    agent: &AgentWorker,
    build_id: ResourceId,
    payload: &DispatchPayload,
    status: BuildStatus,
    result: &chengis_core::build::BuildResult,
) {
    // The master treats duplicate completions as idempotent; retry a couple
    // of times so a blip does not orphan the build.
    for attempt in 0..3 {
        match agent
            .client()
            .complete_build(
                build_id,
                status,
                result.failure_reason.as_deref(),
                result.failed_stage.as_deref(),
                payload.dispatch_token,
            )
            .await
        {
            Ok(()) => {
                info!(build_id = %build_id, status = %status, "completion reported");
                return;
            }
            Err(e) => {
                warn!(build_id = %build_id, attempt, error = %e, "completion callback failed");
                tokio::time::sleep(Duration::from_millis(500 * (attempt + 1))).await;
            }
        }
    }
}

/// Batch live events and push them to the master. Ends when the build's
/// subscription closes.
async fn forward_events(
    client: MasterClient,
    build_id: ResourceId,
    mut live: mpsc::Receiver<BuildEvent>,
) {
    let mut batch: Vec<NewBuildEvent> = Vec::with_capacity(FORWARD_BATCH);
    loop {
        let event = tokio::select! {
            event = live.recv() => event,
            _ = tokio::time::sleep(FORWARD_FLUSH), if !batch.is_empty() => {
                flush(&client, build_id, &mut batch).await;
                continue;
            }
        };
        match event {
            Some(event) => {
                batch.push(NewBuildEvent {
                    kind: event.kind,
                    stage: event.stage,
                    step: event.step,
                    payload: event.payload,
                });
                if batch.len() >= FORWARD_BATCH {
                    flush(&client, build_id, &mut batch).await;
                }
            }
            None => {
                flush(&client, build_id, &mut batch).await;
                break;
            }
        }
    }
}

async fn flush(client: &MasterClient, build_id: ResourceId, batch: &mut Vec<NewBuildEvent>) {
    if batch.is_empty() {
        return;
    }
    let events: Vec<NewBuildEvent> = batch.drain(..).collect();
    if let Err(e) = client.forward_events(build_id, &events).await {
        warn!(build_id = %build_id, count = events.len(), error = %e, "event forwarding failed");
    }
}
