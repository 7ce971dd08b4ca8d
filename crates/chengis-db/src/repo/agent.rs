//! Agent persistence.
//!
//! The in-memory agent registry is authoritative at runtime; this repo is
//! its write-through so registrations survive a master restart.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::agent::{Agent, AgentStatus, SystemInfo};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait AgentRepo: Send + Sync {
    async fn upsert(&self, agent: &Agent) -> DbResult<()>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
    /// Hydrate the registry on boot.
    async fn load_all(&self) -> DbResult<Vec<Agent>>;
}

#[derive(Debug, sqlx::FromRow)]
struct AgentRecord {
    id: uuid::Uuid,
    name: String,
    url: String,
    labels: Vec<String>,
    max_builds: i32,
    current_builds: i32,
    status: String,
    last_heartbeat: DateTime<Utc>,
    cpu_count: i32,
    memory_mb: i64,
    region: Option<String>,
    org_id: Option<uuid::Uuid>,
}

impl TryFrom<AgentRecord> for Agent {
    type Error = DbError;

    fn try_from(r: AgentRecord) -> DbResult<Agent> {
        let status = match r.status.as_str() {
            "online" => AgentStatus::Online,
            "offline" => AgentStatus::Offline,
            "draining" => AgentStatus::Draining,
            other => return Err(DbError::Conflict(format!("unknown agent status {other:?}"))),
        };
        Ok(Agent {
            id: r.id.into(),
            name: r.name,
            url: r.url,
            labels: r.labels.into_iter().collect(),
            max_builds: r.max_builds as u32,
            current_builds: r.current_builds as u32,
            status,
            last_heartbeat: r.last_heartbeat,
            system: SystemInfo {
                cpu_count: r.cpu_count as u32,
                memory_mb: r.memory_mb as u64,
            },
            region: r.region,
            org_id: r.org_id.map(Into::into),
        })
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
        AgentStatus::Draining => "draining",
    }
}

/// PostgreSQL implementation of [`AgentRepo`].
pub struct PgAgentRepo {
    pool: PgPool,
}

impl PgAgentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepo for PgAgentRepo {
    async fn upsert(&self, agent: &Agent) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, url, labels, max_builds, current_builds, status,
                                last_heartbeat, cpu_count, memory_mb, region, org_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                labels = EXCLUDED.labels,
                max_builds = EXCLUDED.max_builds,
                current_builds = EXCLUDED.current_builds,
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                cpu_count = EXCLUDED.cpu_count,
                memory_mb = EXCLUDED.memory_mb,
                region = EXCLUDED.region
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(&agent.name)
        .bind(&agent.url)
        .bind(agent.labels.iter().cloned().collect::<Vec<_>>())
        .bind(agent.max_builds as i32)
        .bind(agent.current_builds as i32)
        .bind(status_str(agent.status))
        .bind(agent.last_heartbeat)
        .bind(agent.system.cpu_count as i32)
        .bind(agent.system.memory_mb as i64)
        .bind(&agent.region)
        .bind(agent.org_id.map(|o| *o.as_uuid()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> DbResult<Vec<Agent>> {
        let records = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }
}
