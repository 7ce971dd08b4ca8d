//! Durable build queue.
//!
//! A persistent FIFO-with-retry for builds awaiting remote dispatch. Status
//! transitions are conditional on the prior status so concurrent dequeuers
//! never share an item; under storage contention dequeue retries with
//! bounded exponential backoff.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::queue::{FailOutcome, QueueItem, QueueItemStatus, retry_backoff};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::warn;

use crate::{DbError, DbResult};

/// Attributes for a new queue item.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub build_id: ResourceId,
    pub job_id: ResourceId,
    pub payload: serde_json::Value,
    pub required_labels: BTreeSet<String>,
    pub max_retries: u32,
    pub org_id: Option<ResourceId>,
}

/// Result of a bulk requeue.
#[derive(Debug, Clone, Default)]
pub struct RequeueSummary {
    pub requeued: Vec<ResourceId>,
    pub dead_lettered: Vec<ResourceId>,
}

impl RequeueSummary {
    pub fn affected_builds(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.requeued.iter().chain(&self.dead_lettered).copied()
    }
}

#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Insert in pending. At most one non-terminal item may exist per build.
    async fn enqueue(&self, item: NewQueueItem) -> DbResult<QueueItem>;

    /// Atomically select the oldest pending (or ready-for-retry) item and
    /// transition it to dispatching. Concurrent calls never return the same
    /// item.
    async fn dequeue_next(&self) -> DbResult<Option<QueueItem>>;

    async fn mark_dispatched(&self, item_id: ResourceId, agent_id: ResourceId) -> DbResult<()>;
    async fn mark_completed(&self, item_id: ResourceId) -> DbResult<()>;
    /// Idempotent: completing an already-completed build is not an error.
    async fn mark_completed_by_build_id(&self, build_id: ResourceId) -> DbResult<()>;

    /// Retry (pending + backoff) while budget remains, else dead-letter.
    async fn mark_failed(&self, item_id: ResourceId, error: &str) -> DbResult<FailOutcome>;

    /// Bulk-return all items dispatched to an agent back to pending,
    /// incrementing retry counts; items beyond budget go to dead-letter.
    async fn requeue_for_agent(&self, agent_id: ResourceId) -> DbResult<RequeueSummary>;

    /// Items stuck in dispatching longer than `older_than` back to pending.
    async fn sweep_stuck_dispatching(&self, older_than: Duration) -> DbResult<u64>;

    async fn get_by_build_id(&self, build_id: ResourceId) -> DbResult<Option<QueueItem>>;
    async fn get_queue_depth(&self) -> DbResult<u64>;
    async fn get_oldest_pending_age_ms(&self) -> DbResult<Option<i64>>;
    async fn dead_letter_count(&self) -> DbResult<u64>;
    async fn cleanup_completed(&self, retention_hours: u32) -> DbResult<u64>;
}

#[derive(Debug, sqlx::FromRow)]
struct QueueItemRecord {
    id: uuid::Uuid,
    build_id: uuid::Uuid,
    job_id: uuid::Uuid,
    payload: serde_json::Value,
    required_labels: Vec<String>,
    status: String,
    agent_id: Option<uuid::Uuid>,
    retry_count: i32,
    max_retries: i32,
    error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    org_id: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<QueueItemRecord> for QueueItem {
    type Error = DbError;

    fn try_from(r: QueueItemRecord) -> DbResult<QueueItem> {
        let status = match r.status.as_str() {
            "pending" => QueueItemStatus::Pending,
            "dispatching" => QueueItemStatus::Dispatching,
            "dispatched" => QueueItemStatus::Dispatched,
            "completed" => QueueItemStatus::Completed,
            "dead_letter" => QueueItemStatus::DeadLetter,
            other => return Err(DbError::Conflict(format!("unknown queue status {other:?}"))),
        };
        Ok(QueueItem {
            id: r.id.into(),
            build_id: r.build_id.into(),
            job_id: r.job_id.into(),
            payload: r.payload,
            required_labels: r.required_labels.into_iter().collect(),
            status,
            agent_id: r.agent_id.map(Into::into),
            retry_count: r.retry_count as u32,
            max_retries: r.max_retries as u32,
            error: r.error,
            next_retry_at: r.next_retry_at,
            org_id: r.org_id.map(Into::into),
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        })
    }
}

/// PostgreSQL implementation of [`QueueRepo`].
pub struct PgQueueRepo {
    pool: PgPool,
}

impl PgQueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    const DEQUEUE_ATTEMPTS: u32 = 3;
}

#[async_trait]
impl QueueRepo for PgQueueRepo {
    async fn enqueue(&self, item: NewQueueItem) -> DbResult<QueueItem> {
        let record = sqlx::query_as::<_, QueueItemRecord>(
            r#"
            INSERT INTO build_queue (id, build_id, job_id, payload, required_labels, status,
                                     retry_count, max_retries, org_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(item.build_id.as_uuid())
        .bind(item.job_id.as_uuid())
        .bind(&item.payload)
        .bind(item.required_labels.iter().cloned().collect::<Vec<_>>())
        .bind(item.max_retries as i32)
        .bind(item.org_id.map(|o| *o.as_uuid()))
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn dequeue_next(&self) -> DbResult<Option<QueueItem>> {
        // SKIP LOCKED keeps concurrent dequeuers off the same row; transient
        // storage errors retry with exponential backoff.
        let mut attempt = 0;
        loop {
            let result = sqlx::query_as::<_, QueueItemRecord>(
                r#"
                UPDATE build_queue
                SET status = 'dispatching', updated_at = NOW()
                WHERE id = (
                    SELECT id FROM build_queue
                    WHERE status = 'pending'
                      AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                    ORDER BY created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .fetch_optional(&self.pool)
            .await;

            match result {
                Ok(Some(record)) => return Ok(Some(record.try_into()?)),
                Ok(None) => return Ok(None),
                Err(e) => {
                    attempt += 1;
                    if attempt >= Self::DEQUEUE_ATTEMPTS {
                        return Err(e.into());
                    }
                    let backoff = std::time::Duration::from_millis(50 << attempt);
                    warn!(error = %e, attempt, "dequeue contention, backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn mark_dispatched(&self, item_id: ResourceId, agent_id: ResourceId) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_queue
            SET status = 'dispatched', agent_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'dispatching'
            "#,
        )
        .bind(item_id.as_uuid())
        .bind(agent_id.as_uuid())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::Conflict(format!(
                "queue item {item_id} not in dispatching"
            )));
        }
        Ok(())
    }

    async fn mark_completed(&self, item_id: ResourceId) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE build_queue
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'dead_letter')
            "#,
        )
        .bind(item_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed_by_build_id(&self, build_id: ResourceId) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE build_queue
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE build_id = $1 AND status NOT IN ('completed', 'dead_letter')
            "#,
        )
        .bind(build_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, item_id: ResourceId, error: &str) -> DbResult<FailOutcome> {
        let record = sqlx::query_as::<_, QueueItemRecord>("SELECT * FROM build_queue WHERE id = $1")
            .bind(item_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("queue item {item_id}")))?;

        let retry_count = record.retry_count as u32;
        if retry_count + 1 <= record.max_retries as u32 {
            let next_retry_at = Utc::now() + retry_backoff(retry_count);
            sqlx::query(
                r#"
                UPDATE build_queue
                SET status = 'pending', retry_count = retry_count + 1, error = $2,
                    next_retry_at = $3, agent_id = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item_id.as_uuid())
            .bind(error)
            .bind(next_retry_at)
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::Retried { next_retry_at })
        } else {
            sqlx::query(
                r#"
                UPDATE build_queue
                SET status = 'dead_letter', error = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item_id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn requeue_for_agent(&self, agent_id: ResourceId) -> DbResult<RequeueSummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = RequeueSummary::default();

        let requeued: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE build_queue
            SET status = 'pending', retry_count = retry_count + 1, agent_id = NULL,
                error = 'agent offline', next_retry_at = NOW(), updated_at = NOW()
            WHERE agent_id = $1 AND status = 'dispatched' AND retry_count < max_retries
            RETURNING build_id
            "#,
        )
        .bind(agent_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let dead: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE build_queue
            SET status = 'dead_letter', agent_id = NULL, error = 'agent offline, retries exhausted',
                updated_at = NOW()
            WHERE agent_id = $1 AND status = 'dispatched'
            RETURNING build_id
            "#,
        )
        .bind(agent_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        summary.requeued = requeued.into_iter().map(Into::into).collect();
        summary.dead_lettered = dead.into_iter().map(Into::into).collect();
        Ok(summary)
    }

    async fn sweep_stuck_dispatching(&self, older_than: Duration) -> DbResult<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            r#"
            UPDATE build_queue
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'dispatching' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_by_build_id(&self, build_id: ResourceId) -> DbResult<Option<QueueItem>> {
        let record = sqlx::query_as::<_, QueueItemRecord>(
            "SELECT * FROM build_queue WHERE build_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(build_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        record.map(TryInto::try_into).transpose()
    }

    async fn get_queue_depth(&self) -> DbResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn get_oldest_pending_age_ms(&self) -> DbResult<Option<i64>> {
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM build_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(oldest.map(|t| (Utc::now() - t).num_milliseconds()))
    }

    async fn dead_letter_count(&self) -> DbResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_queue WHERE status = 'dead_letter'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn cleanup_completed(&self, retention_hours: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::hours(retention_hours as i64);
        let result = sqlx::query(
            "DELETE FROM build_queue WHERE status = 'completed' AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
