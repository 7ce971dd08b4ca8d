//! Durable build event log.
//!
//! Append-only; the replay API serves reconnecting live-stream clients and
//! is the source of truth for per-build event ordering.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::event::{BuildEvent, BuildEventKind, EventId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn append(&self, event: &BuildEvent) -> DbResult<()>;

    /// Events with id > `since_id`, ascending, at most `limit`.
    async fn replay(
        &self,
        build_id: ResourceId,
        since_id: EventId,
        limit: i64,
    ) -> DbResult<Vec<BuildEvent>>;
}

#[derive(Debug, sqlx::FromRow)]
struct EventRecord {
    id: i64,
    build_id: uuid::Uuid,
    kind: String,
    stage: Option<String>,
    step: Option<String>,
    payload: serde_json::Value,
    at: DateTime<Utc>,
}

impl TryFrom<EventRecord> for BuildEvent {
    type Error = DbError;

    fn try_from(r: EventRecord) -> DbResult<BuildEvent> {
        let kind: BuildEventKind =
            serde_json::from_value(serde_json::Value::String(r.kind.clone()))
                .map_err(|_| DbError::Conflict(format!("unknown event kind {:?}", r.kind)))?;
        Ok(BuildEvent {
            id: r.id,
            build_id: r.build_id.into(),
            kind,
            stage: r.stage,
            step: r.step,
            payload: r.payload,
            at: r.at,
        })
    }
}

/// PostgreSQL implementation of [`EventRepo`].
pub struct PgEventRepo {
    pool: PgPool,
}

impl PgEventRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepo for PgEventRepo {
    async fn append(&self, event: &BuildEvent) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_events (id, build_id, kind, stage, step, payload, at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.build_id.as_uuid())
        .bind(event.kind.as_str())
        .bind(&event.stage)
        .bind(&event.step)
        .bind(&event.payload)
        .bind(event.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replay(
        &self,
        build_id: ResourceId,
        since_id: EventId,
        limit: i64,
    ) -> DbResult<Vec<BuildEvent>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT * FROM build_events
            WHERE build_id = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(since_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }
}
