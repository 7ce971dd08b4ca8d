//! Orphan monitor: recovers builds stranded on silent agents.
//!
//! A leader-only periodic task. Ages out agents whose heartbeat went stale,
//! returns their dispatched queue items to pending (or dead-letters them
//! past the retry budget), emits `build-orphaned` for every affected build,
//! and sweeps items stuck in the transient dispatching state.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chengis_core::build::BuildStatus;
use chengis_core::event::{BuildEventKind, NewBuildEvent};
use chengis_core::ResourceId;
use chengis_db::{BuildRepo, QueueRepo};

use crate::bus::EventBus;
use crate::registry::AgentRegistry;

/// What one sweep did.
#[derive(Debug, Default, Clone)]
pub struct OrphanSweep {
    pub agents_marked_offline: usize,
    pub builds_requeued: usize,
    pub builds_dead_lettered: usize,
    pub stuck_dispatching_swept: u64,
    pub agents_expired: usize,
}

pub struct OrphanMonitor {
    registry: Arc<AgentRegistry>,
    queue: Arc<dyn QueueRepo>,
    builds: Arc<dyn BuildRepo>,
    bus: Arc<EventBus>,
    heartbeat_timeout: chrono::Duration,
    agent_ttl: chrono::Duration,
    dispatching_timeout: chrono::Duration,
    poll_interval: Duration,
    /// Fresh token per leadership term so the loop can restart.
    stop: std::sync::Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OrphanMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<dyn QueueRepo>,
        builds: Arc<dyn BuildRepo>,
        bus: Arc<EventBus>,
        heartbeat_timeout_ms: u64,
        agent_ttl_ms: u64,
        dispatching_timeout_ms: u64,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            builds,
            bus,
            heartbeat_timeout: chrono::Duration::milliseconds(heartbeat_timeout_ms as i64),
            agent_ttl: chrono::Duration::milliseconds(agent_ttl_ms as i64),
            dispatching_timeout: chrono::Duration::milliseconds(dispatching_timeout_ms as i64),
            poll_interval,
            stop: std::sync::Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let stop = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = stop.clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            info!("orphan monitor started");
            let mut interval = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }
                this.run_once().await;
            }
            info!("orphan monitor stopped");
        });
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(task);
        }
    }

    pub async fn stop(&self) {
        self.stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// One sweep over agent health and stranded queue items.
    pub async fn run_once(&self) -> OrphanSweep {
        let mut sweep = OrphanSweep {
            agents_marked_offline: self
                .registry
                .check_agent_health(self.heartbeat_timeout)
                .await,
            ..Default::default()
        };

        for agent_id in self.registry.offline_agents().await {
            match self.queue.requeue_for_agent(agent_id).await {
                Ok(summary) => {
                    for build_id in &summary.requeued {
                        self.emit_orphaned(*build_id, agent_id, true).await;
                        if let Err(e) = self
                            .builds
                            .update_build_status(*build_id, BuildStatus::Queued)
                            .await
                        {
                            warn!(build_id = %build_id, error = %e, "failed to requeue build status");
                        }
                    }
                    for build_id in &summary.dead_lettered {
                        self.emit_orphaned(*build_id, agent_id, false).await;
                        if let Err(e) = self
                            .builds
                            .complete_build(
                                *build_id,
                                BuildStatus::Orphaned,
                                Some("agent offline, retries exhausted"),
                                None,
                            )
                            .await
                        {
                            warn!(build_id = %build_id, error = %e, "failed to orphan build");
                        }
                    }
                    sweep.builds_requeued += summary.requeued.len();
                    sweep.builds_dead_lettered += summary.dead_lettered.len();
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "requeue for offline agent failed");
                }
            }
        }

        // Accepted-but-never-ran items stuck in dispatching.
        match self.queue.sweep_stuck_dispatching(self.dispatching_timeout).await {
            Ok(swept) => sweep.stuck_dispatching_swept = swept,
            Err(e) => warn!(error = %e, "dispatching sweep failed"),
        }

        sweep.agents_expired = self.registry.expire_offline(self.agent_ttl).await;

        if sweep.builds_requeued > 0 || sweep.builds_dead_lettered > 0 {
            info!(
                requeued = sweep.builds_requeued,
                dead_lettered = sweep.builds_dead_lettered,
                "orphan recovery pass complete"
            );
        }
        sweep
    }

    async fn emit_orphaned(&self, build_id: ResourceId, agent_id: ResourceId, requeued: bool) {
        self.bus
            .publish(
                build_id,
                NewBuildEvent::new(BuildEventKind::BuildOrphaned).payload(serde_json::json!({
                    "agent_id": agent_id.to_string(),
                    "requeued": requeued,
                })),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::agent::{AgentRegistration, AgentStatus};
    use chengis_core::build::{Build, Job, TriggerKind};
    use chengis_core::pipeline::Pipeline;
    use chengis_db::memory::MemoryStore;
    use chengis_db::NewQueueItem;
    use std::collections::{BTreeSet, HashMap};

    async fn register_agent(registry: &AgentRegistry) -> ResourceId {
        registry
            .register(AgentRegistration {
                name: "worker".to_string(),
                url: "http://worker:9090".to_string(),
                labels: BTreeSet::new(),
                max_builds: 2,
                system: Default::default(),
                region: None,
                org_id: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn dispatched_item(
        store: &MemoryStore,
        agent_id: ResourceId,
        max_retries: u32,
    ) -> (ResourceId, ResourceId) {
        let job = Job {
            id: ResourceId::new(),
            name: "j".to_string(),
            display_name: "J".to_string(),
            pipeline: Pipeline::default(),
            required_labels: BTreeSet::new(),
            parameters: HashMap::new(),
            default_branch: "main".to_string(),
            org_id: None,
            repo_url: None,
        };
        let build = Build::new(&job, 1, TriggerKind::Manual, "main".to_string());
        store.create_build(&build).await.unwrap();
        let item = store
            .enqueue(NewQueueItem {
                build_id: build.id,
                job_id: job.id,
                payload: serde_json::json!({}),
                required_labels: BTreeSet::new(),
                max_retries,
                org_id: None,
            })
            .await
            .unwrap();
        let dequeued = store.dequeue_next().await.unwrap().unwrap();
        assert_eq!(dequeued.id, item.id);
        store.mark_dispatched(item.id, agent_id).await.unwrap();
        (build.id, item.id)
    }

    fn monitor(
        registry: Arc<AgentRegistry>,
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        heartbeat_timeout_ms: u64,
    ) -> Arc<OrphanMonitor> {
        OrphanMonitor::new(
            registry,
            store.clone(),
            store,
            bus,
            heartbeat_timeout_ms,
            24 * 60 * 60 * 1000,
            60_000,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn silent_agent_gets_its_builds_requeued() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let bus = Arc::new(EventBus::new(store.clone()));
        let agent_id = register_agent(&registry).await;
        let (build_id, item_id) = dispatched_item(&store, agent_id, 3).await;

        // Heartbeat timeout of zero: the agent is immediately stale.
        let m = monitor(registry.clone(), store.clone(), bus.clone(), 0);
        let sweep = m.run_once().await;

        assert_eq!(sweep.agents_marked_offline, 1);
        assert_eq!(sweep.builds_requeued, 1);
        assert_eq!(sweep.builds_dead_lettered, 0);
        assert_eq!(
            registry.get(agent_id).await.unwrap().status,
            AgentStatus::Offline
        );

        let item = store.get_by_build_id(build_id).await.unwrap().unwrap();
        assert_eq!(item.id, item_id);
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.status,
            chengis_core::queue::QueueItemStatus::Pending
        );

        let events = bus.replay(build_id, 0, 100).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == BuildEventKind::BuildOrphaned));

        let build = store.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_dead_letters_and_orphans() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let bus = Arc::new(EventBus::new(store.clone()));
        let agent_id = register_agent(&registry).await;
        let (build_id, _) = dispatched_item(&store, agent_id, 0).await;

        let m = monitor(registry, store.clone(), bus.clone(), 0);
        let sweep = m.run_once().await;

        assert_eq!(sweep.builds_dead_lettered, 1);
        assert_eq!(store.dead_letter_count().await.unwrap(), 1);

        let build = store.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Orphaned);
        let events = bus.replay(build_id, 0, 100).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == BuildEventKind::BuildOrphaned));
    }

    #[tokio::test]
    async fn healthy_agents_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let bus = Arc::new(EventBus::new(store.clone()));
        let agent_id = register_agent(&registry).await;
        dispatched_item(&store, agent_id, 3).await;

        // Generous timeout: the fresh registration heartbeat is recent.
        let m = monitor(registry.clone(), store.clone(), bus, 90_000);
        let sweep = m.run_once().await;
        assert_eq!(sweep.agents_marked_offline, 0);
        assert_eq!(sweep.builds_requeued, 0);
        assert_eq!(
            registry.get(agent_id).await.unwrap().status,
            AgentStatus::Online
        );
    }
}
