//! In-process development store.
//!
//! Implements every repository trait over mutex-guarded maps. Queue
//! transitions happen under one lock, which gives the same no-double-dequeue
//! guarantee the production store gets from conditional updates.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::agent::Agent;
use chengis_core::approval::ApprovalGate;
use chengis_core::build::{Build, BuildStatus, Job};
use chengis_core::event::{BuildEvent, EventId};
use chengis_core::queue::{FailOutcome, QueueItem, QueueItemStatus, retry_backoff};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::repo::queue::{NewQueueItem, RequeueSummary};
use crate::repo::secrets::SecretRow;
use crate::{
    AgentRepo, ApprovalRepo, BuildRepo, DbError, DbResult, EventRepo, QueueRepo, SecretRepo,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<ResourceId, Job>,
    builds: HashMap<ResourceId, Build>,
    build_numbers: HashMap<ResourceId, u64>,
    events: HashMap<ResourceId, Vec<BuildEvent>>,
    queue: Vec<QueueItem>,
    agents: HashMap<ResourceId, Agent>,
    approvals: HashMap<(ResourceId, String), ApprovalGate>,
    secrets: Vec<SecretRow>,
}

/// Development store backing every repo trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_job(&self, job: &Job) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn get_job_by_name(&self, org_id: Option<ResourceId>, name: &str) -> DbResult<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .values()
            .find(|j| j.name == name && j.org_id == org_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {name:?}")))
    }

    async fn list_jobs(&self, org_id: Option<ResourceId>) -> DbResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.org_id == org_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn delete_job(&self, id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(&id);
        Ok(())
    }

    async fn next_build_number(&self, job_id: ResourceId) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        let number = inner.build_numbers.entry(job_id).or_insert(0);
        *number += 1;
        Ok(*number)
    }

    async fn create_build(&self, build: &Build) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let inner = self.inner.lock().await;
        inner
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))
    }

    async fn update_build_status(&self, id: ResourceId, status: BuildStatus) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        build.status = status;
        Ok(())
    }

    async fn set_build_started(&self, id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        build.status = BuildStatus::Running;
        build.started_at = Some(Utc::now());
        Ok(())
    }

    async fn set_build_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        build.status = BuildStatus::Dispatching;
        build.dispatched_at = Some(Utc::now());
        build.agent_id = Some(agent_id);
        Ok(())
    }

    async fn complete_build(
        &self,
        id: ResourceId,
        status: BuildStatus,
        failure_reason: Option<&str>,
        failed_stage: Option<&str>,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        build.status = status;
        build.completed_at = Some(Utc::now());
        build.failure_reason = failure_reason.map(String::from);
        build.failed_stage = failed_stage.map(String::from);
        Ok(())
    }

    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>> {
        let inner = self.inner.lock().await;
        let mut builds: Vec<Build> = inner
            .builds
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        builds.truncate(limit as usize);
        Ok(builds)
    }

    async fn active_builds_for_agent(&self, agent_id: ResourceId) -> DbResult<Vec<Build>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .builds
            .values()
            .filter(|b| {
                b.agent_id == Some(agent_id)
                    && matches!(b.status, BuildStatus::Dispatching | BuildStatus::Running)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn append(&self, event: &BuildEvent) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .events
            .entry(event.build_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn replay(
        &self,
        build_id: ResourceId,
        since_id: EventId,
        limit: i64,
    ) -> DbResult<Vec<BuildEvent>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<BuildEvent> = inner
            .events
            .get(&build_id)
            .map(|v| v.iter().filter(|e| e.id > since_id).cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.id);
        events.truncate(limit as usize);
        Ok(events)
    }
}

#[async_trait]
impl QueueRepo for MemoryStore {
    async fn enqueue(&self, item: NewQueueItem) -> DbResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        if inner
            .queue
            .iter()
            .any(|q| q.build_id == item.build_id && !q.status.is_terminal())
        {
            return Err(DbError::Conflict(format!(
                "build {} already queued",
                item.build_id
            )));
        }
        let now = Utc::now();
        let queued = QueueItem {
            id: ResourceId::new(),
            build_id: item.build_id,
            job_id: item.job_id,
            payload: item.payload,
            required_labels: item.required_labels,
            status: QueueItemStatus::Pending,
            agent_id: None,
            retry_count: 0,
            max_retries: item.max_retries,
            error: None,
            next_retry_at: None,
            org_id: item.org_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.queue.push(queued.clone());
        Ok(queued)
    }

    async fn dequeue_next(&self) -> DbResult<Option<QueueItem>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let next = inner
            .queue
            .iter_mut()
            .filter(|q| {
                q.status == QueueItemStatus::Pending
                    && q.next_retry_at.is_none_or(|t| t <= now)
            })
            .min_by_key(|q| q.created_at);
        Ok(next.map(|item| {
            item.status = QueueItemStatus::Dispatching;
            item.updated_at = now;
            item.clone()
        }))
    }

    async fn mark_dispatched(&self, item_id: ResourceId, agent_id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .queue
            .iter_mut()
            .find(|q| q.id == item_id)
            .ok_or_else(|| DbError::NotFound(format!("queue item {item_id}")))?;
        if item.status != QueueItemStatus::Dispatching {
            return Err(DbError::Conflict(format!(
                "queue item {item_id} not in dispatching"
            )));
        }
        item.status = QueueItemStatus::Dispatched;
        item.agent_id = Some(agent_id);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(&self, item_id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.queue.iter_mut().find(|q| q.id == item_id) {
            if !item.status.is_terminal() {
                item.status = QueueItemStatus::Completed;
                item.completed_at = Some(Utc::now());
                item.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_completed_by_build_id(&self, build_id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        for item in inner
            .queue
            .iter_mut()
            .filter(|q| q.build_id == build_id && !q.status.is_terminal())
        {
            item.status = QueueItemStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, item_id: ResourceId, error: &str) -> DbResult<FailOutcome> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .queue
            .iter_mut()
            .find(|q| q.id == item_id)
            .ok_or_else(|| DbError::NotFound(format!("queue item {item_id}")))?;
        item.error = Some(error.to_string());
        item.updated_at = Utc::now();
        if item.retry_count + 1 <= item.max_retries {
            item.retry_count += 1;
            let next_retry_at = Utc::now() + retry_backoff(item.retry_count - 1);
            item.next_retry_at = Some(next_retry_at);
            item.status = QueueItemStatus::Pending;
            item.agent_id = None;
            Ok(FailOutcome::Retried { next_retry_at })
        } else {
            item.status = QueueItemStatus::DeadLetter;
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn requeue_for_agent(&self, agent_id: ResourceId) -> DbResult<RequeueSummary> {
        let mut inner = self.inner.lock().await;
        let mut summary = RequeueSummary::default();
        let now = Utc::now();
        for item in inner
            .queue
            .iter_mut()
            .filter(|q| q.agent_id == Some(agent_id) && q.status == QueueItemStatus::Dispatched)
        {
            item.agent_id = None;
            item.updated_at = now;
            if item.retry_count < item.max_retries {
                item.retry_count += 1;
                item.status = QueueItemStatus::Pending;
                item.next_retry_at = Some(now);
                item.error = Some("agent offline".to_string());
                summary.requeued.push(item.build_id);
            } else {
                item.status = QueueItemStatus::DeadLetter;
                item.error = Some("agent offline, retries exhausted".to_string());
                summary.dead_lettered.push(item.build_id);
            }
        }
        Ok(summary)
    }

    async fn sweep_stuck_dispatching(&self, older_than: Duration) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - older_than;
        let mut swept = 0;
        for item in inner
            .queue
            .iter_mut()
            .filter(|q| q.status == QueueItemStatus::Dispatching && q.updated_at < cutoff)
        {
            item.status = QueueItemStatus::Pending;
            item.updated_at = Utc::now();
            swept += 1;
        }
        Ok(swept)
    }

    async fn get_by_build_id(&self, build_id: ResourceId) -> DbResult<Option<QueueItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|q| q.build_id == build_id)
            .max_by_key(|q| q.created_at)
            .cloned())
    }

    async fn get_queue_depth(&self) -> DbResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|q| q.status == QueueItemStatus::Pending)
            .count() as u64)
    }

    async fn get_oldest_pending_age_ms(&self) -> DbResult<Option<i64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|q| q.status == QueueItemStatus::Pending)
            .map(|q| q.created_at)
            .min()
            .map(|t| (Utc::now() - t).num_milliseconds()))
    }

    async fn dead_letter_count(&self) -> DbResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|q| q.status == QueueItemStatus::DeadLetter)
            .count() as u64)
    }

    async fn cleanup_completed(&self, retention_hours: u32) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::hours(retention_hours as i64);
        let before = inner.queue.len();
        inner.queue.retain(|q| {
            !(q.status == QueueItemStatus::Completed
                && q.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.queue.len()) as u64)
    }
}

#[async_trait]
impl AgentRepo for MemoryStore {
    async fn upsert(&self, agent: &Agent) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.agents.remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> DbResult<Vec<Agent>> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}

#[async_trait]
impl ApprovalRepo for MemoryStore {
    async fn create(&self, gate: &ApprovalGate) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .approvals
            .entry((gate.build_id, gate.stage.clone()))
            .or_insert_with(|| gate.clone());
        Ok(())
    }

    async fn get(&self, build_id: ResourceId, stage: &str) -> DbResult<Option<ApprovalGate>> {
        let inner = self.inner.lock().await;
        Ok(inner.approvals.get(&(build_id, stage.to_string())).cloned())
    }

    async fn update(&self, gate: &ApprovalGate) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .approvals
            .insert((gate.build_id, gate.stage.clone()), gate.clone());
        Ok(())
    }

    async fn list_pending(&self) -> DbResult<Vec<ApprovalGate>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .approvals
            .values()
            .filter(|g| g.status == chengis_core::approval::ApprovalStatus::Pending)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SecretRepo for MemoryStore {
    async fn put(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
        ciphertext: Vec<u8>,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let org = org_id.map(|o| *o.as_uuid());
        let job = job_id.map(|j| *j.as_uuid());
        inner
            .secrets
            .retain(|s| !(s.org_id == org && s.job_id == job && s.key == key));
        inner.secrets.push(SecretRow {
            org_id: org,
            job_id: job,
            key: key.to_string(),
            ciphertext,
        });
        Ok(())
    }

    async fn delete(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let org = org_id.map(|o| *o.as_uuid());
        let job = job_id.map(|j| *j.as_uuid());
        inner
            .secrets
            .retain(|s| !(s.org_id == org && s.job_id == job && s.key == key));
        Ok(())
    }

    async fn get_scope(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
    ) -> DbResult<Vec<SecretRow>> {
        let inner = self.inner.lock().await;
        let org = org_id.map(|o| *o.as_uuid());
        let job = job_id.map(|j| *j.as_uuid());
        Ok(inner
            .secrets
            .iter()
            .filter(|s| s.org_id == org && s.job_id == job)
            .cloned()
            .collect())
    }
}
