//! Queue processor: the leader-only loop draining the durable queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chengis_core::agent::ResourceHints;
use chengis_core::queue::{DispatchPayload, QueueItem};
use chengis_db::{BuildRepo, QueueRepo};

use crate::breaker::BreakerRegistry;
use crate::client::AgentClient;
use crate::registry::AgentRegistry;

/// Gauges published every poll.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub queue_depth: AtomicU64,
    pub dead_letter_count: AtomicU64,
    pub oldest_pending_age_ms: AtomicI64,
}

pub struct QueueProcessor {
    queue: Arc<dyn QueueRepo>,
    builds: Arc<dyn BuildRepo>,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    client: AgentClient,
    poll_interval: Duration,
    metrics: QueueMetrics,
    /// Fresh token per leadership term so the loop can restart.
    stop: std::sync::Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn QueueRepo>,
        builds: Arc<dyn BuildRepo>,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerRegistry>,
        client: AgentClient,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            builds,
            registry,
            breakers,
            client,
            poll_interval,
            metrics: QueueMetrics::default(),
            stop: std::sync::Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Start the polling loop. Called from the leader's `on_acquire`.
    pub fn start(self: &Arc<Self>) {
        let stop = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = stop.clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            info!("queue processor started");
            let mut interval = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }
                this.run_once().await;
            }
            info!("queue processor stopped");
        });
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(task);
        }
    }

    /// Interrupt the sleep and wait for the current iteration to finish.
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

    /// One poll: publish gauges, drain at most one item, dispatch it.
    pub async fn run_once(&self) {
        self.publish_metrics().await;

        let item = match self.queue.dequeue_next().await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dequeue failed");
                return;
            }
        };
        self.dispatch_item(item).await;
    }

    async fn dispatch_item(&self, item: QueueItem) {
        let payload: DispatchPayload = match serde_json::from_value(item.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(queue_id = %item.id, error = %e, "malformed queue payload");
                let _ = self
                    .queue
                    .mark_failed(item.id, &format!("malformed payload: {e}"))
                    .await;
                return;
            }
        };

        let agent = self
            .registry
            .find_available_agent(&item.required_labels, &ResourceHints::default(), |agent| {
                self.breakers.allow_request(agent.id)
            })
            .await;
        let Some(agent) = agent else {
            debug!(queue_id = %item.id, "no matching agent for queue item");
            let _ = self.queue.mark_failed(item.id, "no matching agent").await;
            return;
        };

        if self.registry.increment_builds(agent.id).await.is_err() {
            let _ = self.queue.mark_failed(item.id, "agent at capacity").await;
            return;
        }

        match self.client.dispatch_build(&agent.url, &payload).await {
            Ok(()) => {
                self.breakers.record_success(agent.id);
                if let Err(e) = self.queue.mark_dispatched(item.id, agent.id).await {
                    warn!(queue_id = %item.id, error = %e, "mark_dispatched failed");
                }
                if let Err(e) = self
                    .builds
                    .set_build_dispatched(payload.build_id, agent.id)
                    .await
                {
                    warn!(build_id = %payload.build_id, error = %e, "failed to record dispatch");
                }
                info!(build_id = %payload.build_id, agent = %agent.name, "queued build dispatched");
            }
            Err(e) => {
                warn!(queue_id = %item.id, agent = %agent.name, error = %e, "agent dispatch failed");
                self.breakers.record_failure(agent.id);
                self.registry.decrement_builds(agent.id).await;
                let _ = self.queue.mark_failed(item.id, &e.to_string()).await;
            }
        }
    }

    async fn publish_metrics(&self) {
        if let Ok(depth) = self.queue.get_queue_depth().await {
            self.metrics.queue_depth.store(depth, Ordering::Relaxed);
        }
        if let Ok(dead) = self.queue.dead_letter_count().await {
            self.metrics
                .dead_letter_count
                .store(dead, Ordering::Relaxed);
        }
        if let Ok(age) = self.queue.get_oldest_pending_age_ms().await {
            self.metrics
                .oldest_pending_age_ms
                .store(age.unwrap_or(0), Ordering::Relaxed);
        }
        debug!(
            depth = self.metrics.queue_depth.load(Ordering::Relaxed),
            dead_letter = self.metrics.dead_letter_count.load(Ordering::Relaxed),
            oldest_pending_ms = self.metrics.oldest_pending_age_ms.load(Ordering::Relaxed),
            "queue gauges"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::agent::AgentRegistration;
    use chengis_db::memory::MemoryStore;
    use chengis_db::NewQueueItem;
    use std::collections::BTreeSet;

    fn processor(store: Arc<MemoryStore>, registry: Arc<AgentRegistry>) -> Arc<QueueProcessor> {
        QueueProcessor::new(
            store.clone(),
            store,
            registry,
            Arc::new(BreakerRegistry::new(5, Duration::from_secs(60))),
            AgentClient::new(None),
            Duration::from_millis(50),
        )
    }

    fn item(labels: &[&str]) -> NewQueueItem {
        let payload = DispatchPayload {
            build_id: ResourceId::new(),
            job_id: ResourceId::new(),
            job_name: "svc".to_string(),
            build_number: 1,
            pipeline: Default::default(),
            parameters: Default::default(),
            branch: "main".to_string(),
            repo_url: None,
            org_id: None,
            dispatch_token: uuid::Uuid::new_v4(),
        };
        NewQueueItem {
            build_id: payload.build_id,
            job_id: payload.job_id,
            payload: serde_json::to_value(&payload).unwrap(),
            required_labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            max_retries: 1,
            org_id: None,
        }
    }

    #[tokio::test]
    async fn no_matching_agent_marks_failed_and_retries() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let p = processor(store.clone(), registry);

        let queued = store.enqueue(item(&["gpu"])).await.unwrap();
        p.run_once().await;

        let after = store.get_by_build_id(queued.build_id).await.unwrap().unwrap();
        // Back to pending with a retry recorded.
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.error.as_deref(), Some("no matching agent"));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let p = processor(store.clone(), registry);

        let mut queue_item = item(&["gpu"]);
        queue_item.max_retries = 0;
        store.enqueue(queue_item).await.unwrap();
        p.run_once().await;

        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
        assert_eq!(
            p.metrics().dead_letter_count.load(Ordering::Relaxed),
            0,
            "gauge reflects the state at poll start"
        );
        p.run_once().await;
        assert_eq!(p.metrics().dead_letter_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unreachable_agent_trips_breaker_and_requeues() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let agent = registry
            .register(AgentRegistration {
                name: "a1".to_string(),
                // Nothing listens here; dispatch fails fast.
                url: "http://127.0.0.1:1".to_string(),
                labels: ["gpu".to_string()].into_iter().collect(),
                max_builds: 2,
                system: Default::default(),
                region: None,
                org_id: None,
            })
            .await
            .unwrap();
        let p = processor(store.clone(), registry.clone());

        let queued = store.enqueue(item(&["gpu"])).await.unwrap();
        p.run_once().await;

        let after = store.get_by_build_id(queued.build_id).await.unwrap().unwrap();
        assert_eq!(after.retry_count, 1);
        // Reserved capacity was released.
        assert_eq!(registry.get(agent.id).await.unwrap().current_builds, 0);
    }

    #[tokio::test]
    async fn stop_interrupts_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(None, false));
        let p = processor(store, registry);
        p.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.stop().await;
    }
}
