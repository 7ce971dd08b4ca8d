//! Remote build agent.
//!
//! Registers with the master on boot, heartbeats periodically, accepts
//! build payloads into a bounded local queue, runs them through the same
//! build runner the master uses, forwards every event upstream, uploads
//! artifacts, and drains cleanly on shutdown.

pub mod client;
pub mod server;
pub mod worker;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chengis_core::ResourceId;
use chengis_core::agent::{AgentRegistration, HeartbeatUpdate, SystemInfo};
use chengis_core::queue::DispatchPayload;
use chengis_engine::pool::BuildWorkerPool;

use crate::client::MasterClient;

/// Local intake bound: payloads the agent will hold beyond running builds.
const INTAKE_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_url: String,
    pub name: String,
    pub bind: String,
    /// URL the master should dispatch to (defaults from bind).
    pub advertise_url: Option<String>,
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    pub auth_token: Option<String>,
    pub workspace_root: PathBuf,
    pub region: Option<String>,
    pub heartbeat_interval: Duration,
}

pub struct AgentWorker {
    config: AgentConfig,
    client: MasterClient,
    pool: Arc<BuildWorkerPool>,
    intake: mpsc::Sender<DispatchPayload>,
    shutdown: CancellationToken,
}

impl AgentWorker {
    /// Boot the agent: register, start the heartbeat loop and worker pool,
    /// serve the build intake endpoint until signalled, then drain and
    /// deregister.
    pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
        let client = MasterClient::new(config.master_url.clone(), config.auth_token.clone());
        let advertise_url = config
            .advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", config.bind));

        let agent_id = client
            .register(&AgentRegistration {
                name: config.name.clone(),
                url: advertise_url,
                labels: config.labels.clone(),
                max_builds: config.max_builds,
                system: detect_system_info(),
                region: config.region.clone(),
                org_id: None,
            })
            .await?;
        info!(agent_id = %agent_id, name = %config.name, "registered with master");

        let pool = Arc::new(BuildWorkerPool::new(config.max_builds as usize));
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_BUFFER);
        let shutdown = CancellationToken::new();

        let agent = Arc::new(Self {
            config: config.clone(),
            client: client.clone(),
            pool: pool.clone(),
            intake: intake_tx,
            shutdown: shutdown.clone(),
        });

        let heartbeat = tokio::spawn(heartbeat_loop(
            client.clone(),
            agent_id,
            pool.clone(),
            config.heartbeat_interval,
            shutdown.clone(),
        ));
        let workers = tokio::spawn(worker::run_worker_loop(
            agent.clone(),
            intake_rx,
            shutdown.clone(),
        ));

        server::serve(agent.clone(), &config.bind, shutdown.clone()).await?;

        // Shutdown path: stop accepting, drain, deregister.
        info!("agent draining");
        shutdown.cancel();
        let _ = workers.await;
        while pool.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = heartbeat.await;
        if let Err(e) = client.deregister(agent_id).await {
            warn!(error = %e, "deregistration failed");
        }
        info!("agent stopped");
        Ok(())
    }

    pub fn client(&self) -> &MasterClient {
        &self.client
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BuildWorkerPool> {
        &self.pool
    }

    /// Accept a build payload into the bounded intake. False when the agent
    /// is shutting down or the queue is full.
    pub fn accept(&self, payload: DispatchPayload) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.intake.try_send(payload).is_ok()
    }

    /// Healthy while the worker pool is not fully wedged.
    pub fn is_healthy(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.pool.is_saturated()
    }
}

async fn heartbeat_loop(
    client: MasterClient,
    agent_id: ResourceId,
    pool: Arc<BuildWorkerPool>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let update = HeartbeatUpdate {
            current_builds: Some(pool.active_count() as u32),
            system: Some(detect_system_info()),
        };
        if let Err(e) = client.heartbeat(agent_id, &update).await {
            warn!(error = %e, "heartbeat failed");
        }
    }
}

fn detect_system_info() -> SystemInfo {
    SystemInfo {
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_mb: 0,
    }
}
