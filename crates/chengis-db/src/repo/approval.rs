//! Approval gate persistence.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::approval::{ApprovalGate, ApprovalStatus};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ApprovalRepo: Send + Sync {
    async fn create(&self, gate: &ApprovalGate) -> DbResult<()>;
    async fn get(&self, build_id: ResourceId, stage: &str) -> DbResult<Option<ApprovalGate>>;
    async fn update(&self, gate: &ApprovalGate) -> DbResult<()>;
    async fn list_pending(&self) -> DbResult<Vec<ApprovalGate>>;
}

#[derive(Debug, sqlx::FromRow)]
struct ApprovalRecord {
    build_id: uuid::Uuid,
    stage: String,
    required_role: String,
    min_approvals: i32,
    responses: serde_json::Value,
    deadline: DateTime<Utc>,
    status: String,
}

impl TryFrom<ApprovalRecord> for ApprovalGate {
    type Error = DbError;

    fn try_from(r: ApprovalRecord) -> DbResult<ApprovalGate> {
        let status = match r.status.as_str() {
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            "timed_out" => ApprovalStatus::TimedOut,
            other => {
                return Err(DbError::Conflict(format!(
                    "unknown approval status {other:?}"
                )));
            }
        };
        Ok(ApprovalGate {
            build_id: r.build_id.into(),
            stage: r.stage,
            required_role: r.required_role,
            min_approvals: r.min_approvals as u32,
            responses: serde_json::from_value(r.responses)?,
            deadline: r.deadline,
            status,
        })
    }
}

fn status_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::TimedOut => "timed_out",
    }
}

/// PostgreSQL implementation of [`ApprovalRepo`].
pub struct PgApprovalRepo {
    pool: PgPool,
}

impl PgApprovalRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalRepo for PgApprovalRepo {
    async fn create(&self, gate: &ApprovalGate) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_gates (build_id, stage, required_role, min_approvals,
                                        responses, deadline, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (build_id, stage) DO NOTHING
            "#,
        )
        .bind(gate.build_id.as_uuid())
        .bind(&gate.stage)
        .bind(&gate.required_role)
        .bind(gate.min_approvals as i32)
        .bind(serde_json::to_value(&gate.responses)?)
        .bind(gate.deadline)
        .bind(status_str(gate.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, build_id: ResourceId, stage: &str) -> DbResult<Option<ApprovalGate>> {
        let record = sqlx::query_as::<_, ApprovalRecord>(
            "SELECT * FROM approval_gates WHERE build_id = $1 AND stage = $2",
        )
        .bind(build_id.as_uuid())
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        record.map(TryInto::try_into).transpose()
    }

    async fn update(&self, gate: &ApprovalGate) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE approval_gates
            SET responses = $3, status = $4
            WHERE build_id = $1 AND stage = $2
            "#,
        )
        .bind(gate.build_id.as_uuid())
        .bind(&gate.stage)
        .bind(serde_json::to_value(&gate.responses)?)
        .bind(status_str(gate.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(&self) -> DbResult<Vec<ApprovalGate>> {
        let records = sqlx::query_as::<_, ApprovalRecord>(
            "SELECT * FROM approval_gates WHERE status = 'pending' ORDER BY deadline",
        )
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }
}
