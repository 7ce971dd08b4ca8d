//! Application state wiring.
//!
//! Builds the engine singletons from configuration: store, event bus, agent
//! registry, breakers, dispatcher, runner, worker pool, and the leader-only
//! loops. Explicit init and shutdown; nothing hides in module constructors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chengis_config::SystemConfig;
use chengis_config::system::{DatabaseType, SecretBackendKind};
use chengis_core::ResourceId;
use chengis_core::policy::PermissivePolicy;
use chengis_db::{LocalSecretBackend, Store};
use chengis_engine::approval::ApprovalManager;
use chengis_engine::artifact::LocalArtifactStore;
use chengis_engine::breaker::BreakerRegistry;
use chengis_engine::bus::EventBus;
use chengis_engine::client::AgentClient;
use chengis_engine::dispatcher::Dispatcher;
use chengis_engine::leader::{LeaderHandle, start_leader_loop};
use chengis_engine::orphan::OrphanMonitor;
use chengis_engine::pipeline::PipelineExecutor;
use chengis_engine::pool::BuildWorkerPool;
use chengis_engine::processor::QueueProcessor;
use chengis_engine::registry::AgentRegistry;
use chengis_engine::runner::BuildRunner;
use chengis_executor::ExecutorRegistry;

/// Advisory lock id for the master's singleton loops.
const LEADER_LOCK_ID: i64 = 0x43_48_45_4e; // "CHEN"

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SystemConfig>,
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub registry: Arc<AgentRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub approvals: Arc<ApprovalManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub runner: Arc<BuildRunner>,
    pub pool: Arc<BuildWorkerPool>,
    pub processor: Arc<QueueProcessor>,
    pub orphan: Arc<OrphanMonitor>,
    pub leader: Arc<LeaderHandle>,
    pub artifact_root: std::path::PathBuf,
    /// Cancel tokens for builds running locally on this master.
    pub cancels: Arc<Mutex<HashMap<ResourceId, CancellationToken>>>,
}

impl AppState {
    /// Wire the engine against the configured store and start the leader
    /// loop (which owns the queue processor and orphan monitor).
    pub async fn init(config: SystemConfig) -> anyhow::Result<Self> {
        let store = match config.database.r#type {
            DatabaseType::Production => {
                let url = config.database.url.clone().ok_or_else(|| {
                    anyhow::anyhow!("database.url is required for the production store")
                })?;
                let pool = chengis_db::create_pool(&url).await?;
                chengis_db::run_migrations(&pool).await?;
                Store::production(pool)
            }
            DatabaseType::Development => Store::development(),
        };
        Self::init_with_store(config, store).await
    }

    /// Same wiring against an existing store. Tests use this with the
    /// development store.
    pub async fn init_with_store(config: SystemConfig, store: Store) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new(store.events.clone()));
        let registry = Arc::new(AgentRegistry::new(
            Some(store.agents.clone()),
            config.feature_flags.resource_aware_scheduling,
        ));
        match registry.hydrate().await {
            Ok(count) if count > 0 => info!(count, "agent registry hydrated"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "agent registry hydration failed"),
        }

        let breakers = Arc::new(BreakerRegistry::new(
            config.distributed.dispatch.circuit_breaker_threshold,
            Duration::from_millis(config.distributed.dispatch.circuit_breaker_reset_ms),
        ));
        let approvals = Arc::new(ApprovalManager::new(store.approvals.clone()));
        let client = AgentClient::new(config.distributed.auth_token.clone());

        let policy = Arc::new(PermissivePolicy);
        let mut executors = ExecutorRegistry::builtin(policy.clone());
        match chengis_executor::DockerStepExecutor::new(policy.clone()) {
            Ok(docker) => executors.register(Arc::new(docker)),
            Err(e) => warn!(error = %e, "docker unavailable, docker steps disabled"),
        }
        let pipeline_executor = Arc::new(PipelineExecutor::new(
            Arc::new(executors),
            policy,
            approvals.clone(),
            config.matrix.max_combinations,
        ));

        let workspace_root = std::path::PathBuf::from(&config.workspace.root);
        let artifact_root = workspace_root.join("artifacts");
        let artifacts: Arc<dyn chengis_core::artifact::ArtifactStore> =
            Arc::new(LocalArtifactStore::new(artifact_root.clone()));

        let mut runner = BuildRunner::new(
            store.builds.clone(),
            bus.clone(),
            pipeline_executor,
            artifacts,
            workspace_root.join("builds"),
        )
        .with_retain_on_failure(config.workspace.retain_on_failure);
        match (config.secrets.backend, config.secrets.master_key.as_deref()) {
            (SecretBackendKind::Local, Some(key)) => {
                match LocalSecretBackend::new(store.secrets.clone(), key) {
                    Ok(backend) => runner = runner.with_secrets(Arc::new(backend)),
                    Err(e) => warn!(error = %e, "secret backend disabled"),
                }
            }
            (SecretBackendKind::Local, None) => {}
            (other, _) => {
                warn!(backend = ?other, "secrets backend not supported in this build, secrets disabled");
            }
        }
        let runner = Arc::new(runner);

        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            registry.clone(),
            breakers.clone(),
            store.queue.clone(),
            store.builds.clone(),
            client.clone(),
        ));

        let processor = QueueProcessor::new(
            store.queue.clone(),
            store.builds.clone(),
            registry.clone(),
            breakers.clone(),
            client,
            Duration::from_millis(config.distributed.dispatch.poll_interval_ms),
        );
        let orphan = OrphanMonitor::new(
            registry.clone(),
            store.queue.clone(),
            store.builds.clone(),
            bus.clone(),
            config.distributed.heartbeat_timeout_ms,
            config.distributed.agent_ttl_ms,
            config.distributed.dispatch.dispatching_timeout_ms,
            Duration::from_millis(config.distributed.heartbeat_timeout_ms.max(1000) / 3),
        );

        // Singleton loops run only while this process leads.
        let leader = {
            let processor = processor.clone();
            let orphan = orphan.clone();
            let processor_stop = processor.clone();
            let orphan_stop = orphan.clone();
            start_leader_loop(
                store.leader.clone(),
                LEADER_LOCK_ID,
                Arc::new(move || {
                    processor.start();
                    orphan.start();
                }),
                Arc::new(move || {
                    let processor = processor_stop.clone();
                    let orphan = orphan_stop.clone();
                    tokio::spawn(async move {
                        processor.stop().await;
                        orphan.stop().await;
                    });
                }),
                Duration::from_secs(5),
            )
        };

        let pool = Arc::new(BuildWorkerPool::new(config.server.max_concurrent_builds));

        Ok(Self {
            config,
            store,
            bus,
            registry,
            breakers,
            approvals,
            dispatcher,
            runner,
            pool,
            processor,
            orphan,
            leader,
            artifact_root,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn shutdown(&self) {
        self.leader.stop().await;
        self.processor.stop().await;
        self.orphan.stop().await;
    }
}
