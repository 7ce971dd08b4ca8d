//! Dispatch decision engine: local vs remote vs queued.
//!
//! Decision order: distributed off or feature-flagged off runs locally; a
//! configured queue always enqueues; otherwise try agents directly with the
//! circuit-breaker filter, falling back to local only when explicitly
//! configured (default is fail-fast).

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use tracing::{info, warn};

use chengis_core::ResourceId;
use chengis_core::agent::ResourceHints;
use chengis_core::build::{Build, Job};
use chengis_core::queue::DispatchPayload;
use chengis_db::{BuildRepo, NewQueueItem, QueueRepo};
use chengis_config::system::SystemConfig;

use crate::breaker::BreakerRegistry;
use crate::client::AgentClient;
use crate::registry::AgentRegistry;

/// Where a build ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    Local,
    Remote { agent_id: ResourceId },
    Queued { queue_id: ResourceId },
    Failed { reason: String },
}

pub struct Dispatcher {
    distributed_enabled: bool,
    dispatch_flag: bool,
    queue_enabled: bool,
    fallback_local: bool,
    max_retries: u32,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    queue: Arc<dyn QueueRepo>,
    builds: Arc<dyn BuildRepo>,
    client: AgentClient,
}

impl Dispatcher {
    pub fn new(
        config: &SystemConfig,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerRegistry>,
        queue: Arc<dyn QueueRepo>,
        builds: Arc<dyn BuildRepo>,
        client: AgentClient,
    ) -> Self {
        Self {
            distributed_enabled: config.distributed.enabled,
            dispatch_flag: config.feature_flags.distributed_dispatch,
            queue_enabled: config.distributed.dispatch.queue_enabled,
            fallback_local: config.distributed.dispatch.fallback_local,
            max_retries: config.distributed.dispatch.max_retries,
            registry,
            breakers,
            queue,
            builds,
            client,
        }
    }

    /// Decide where this build runs, reserving remote capacity on the way.
    pub async fn dispatch(&self, build: &Build, job: &Job) -> DispatchDecision {
        if !self.distributed_enabled || !self.dispatch_flag {
            return DispatchDecision::Local;
        }

        let payload = build_payload(build, job);

        if self.queue_enabled {
            let item = NewQueueItem {
                build_id: build.id,
                job_id: job.id,
                payload: match serde_json::to_value(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        return DispatchDecision::Failed {
                            reason: format!("payload serialization failed: {e}"),
                        };
                    }
                },
                required_labels: job.required_labels.clone(),
                max_retries: self.max_retries,
                org_id: build.org_id,
            };
            return match self.queue.enqueue(item).await {
                Ok(queued) => {
                    info!(build_id = %build.id, queue_id = %queued.id, "build queued for dispatch");
                    DispatchDecision::Queued {
                        queue_id: queued.id,
                    }
                }
                Err(e) => DispatchDecision::Failed {
                    reason: format!("enqueue failed: {e}"),
                },
            };
        }

        // Direct dispatch: try agents until one accepts or none remain.
        let mut tried: HashSet<ResourceId> = HashSet::new();
        loop {
            let candidate = self
                .registry
                .find_available_agent(&job.required_labels, &ResourceHints::default(), |agent| {
                    !tried.contains(&agent.id) && self.breakers.allow_request(agent.id)
                })
                .await;
            let Some(agent) = candidate else { break };
            tried.insert(agent.id);

            if self.registry.increment_builds(agent.id).await.is_err() {
                continue;
            }
            if let Err(e) = self.builds.set_build_dispatched(build.id, agent.id).await {
                warn!(build_id = %build.id, error = %e, "failed to record dispatch");
            }

            match self.client.dispatch_build(&agent.url, &payload).await {
                Ok(()) => {
                    self.breakers.record_success(agent.id);
                    info!(build_id = %build.id, agent = %agent.name, "build dispatched");
                    return DispatchDecision::Remote { agent_id: agent.id };
                }
                Err(e) => {
                    warn!(build_id = %build.id, agent = %agent.name, error = %e, "dispatch failed");
                    self.breakers.record_failure(agent.id);
                    self.registry.decrement_builds(agent.id).await;
                }
            }
        }

        if self.fallback_local {
            info!(build_id = %build.id, "no agent available, falling back to local");
            DispatchDecision::Local
        } else {
            DispatchDecision::Failed {
                reason: "no agent available".to_string(),
            }
        }
    }
}

/// Everything the agent needs to run the build, plus the dispatch token the
/// master uses to ignore duplicate dispatches.
pub fn build_payload(build: &Build, job: &Job) -> DispatchPayload {
    DispatchPayload {
        build_id: build.id,
        job_id: job.id,
        job_name: job.name.clone(),
        build_number: build.number,
        pipeline: job.pipeline.clone(),
        parameters: build.parameters.clone(),
        branch: build.branch.clone(),
        repo_url: job.repo_url.clone(),
        org_id: build.org_id,
        dispatch_token: Uuid::new_v4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::build::TriggerKind;
    use chengis_core::pipeline::Pipeline;
    use chengis_db::memory::MemoryStore;
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    fn config(distributed: bool, flag: bool, queue: bool, fallback: bool) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.distributed.enabled = distributed;
        config.feature_flags.distributed_dispatch = flag;
        config.distributed.dispatch.queue_enabled = queue;
        config.distributed.dispatch.fallback_local = fallback;
        config
    }

    fn job(labels: &[&str]) -> Job {
        Job {
            id: ResourceId::new(),
            name: "svc".to_string(),
            display_name: "Service".to_string(),
            pipeline: Pipeline::default(),
            required_labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            parameters: HashMap::new(),
            default_branch: "main".to_string(),
            org_id: None,
            repo_url: None,
        }
    }

    fn build(job: &Job) -> Build {
        Build::new(job, 1, TriggerKind::Manual, "main".to_string())
    }

    fn dispatcher(config: &SystemConfig, store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(
            config,
            Arc::new(AgentRegistry::new(None, false)),
            Arc::new(BreakerRegistry::new(5, Duration::from_secs(60))),
            store.clone(),
            store,
            AgentClient::new(None),
        )
    }

    #[tokio::test]
    async fn distributed_disabled_runs_local() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(&config(false, true, false, false), store);
        let job = job(&[]);
        assert_eq!(d.dispatch(&build(&job), &job).await, DispatchDecision::Local);
    }

    #[tokio::test]
    async fn feature_flag_off_runs_local() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(&config(true, false, false, false), store);
        let job = job(&[]);
        assert_eq!(d.dispatch(&build(&job), &job).await, DispatchDecision::Local);
    }

    #[tokio::test]
    async fn queue_enabled_enqueues() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(&config(true, true, true, false), store.clone());
        let job = job(&["gpu"]);
        let b = build(&job);
        store.create_build(&b).await.unwrap();

        match d.dispatch(&b, &job).await {
            DispatchDecision::Queued { .. } => {}
            other => panic!("expected queued, got {other:?}"),
        }
        let item = store.get_by_build_id(b.id).await.unwrap().unwrap();
        assert!(item.required_labels.contains("gpu"));
    }

    #[tokio::test]
    async fn no_agent_and_no_fallback_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(&config(true, true, false, false), store);
        let job = job(&["gpu"]);
        match d.dispatch(&build(&job), &job).await {
            DispatchDecision::Failed { reason } => {
                assert!(reason.contains("no agent"));
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fallback_local_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(&config(true, true, false, true), store);
        let job = job(&["gpu"]);
        assert_eq!(d.dispatch(&build(&job), &job).await, DispatchDecision::Local);
    }

    #[test]
    fn payloads_carry_distinct_dispatch_tokens() {
        let job = job(&[]);
        let b = build(&job);
        let a = build_payload(&b, &job);
        let c = build_payload(&b, &job);
        assert_ne!(a.dispatch_token, c.dispatch_token);
        assert_eq!(a.build_id, b.id);
    }
}
