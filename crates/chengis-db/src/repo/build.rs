//! Job and build repository.

use async_trait::async_trait;
use chengis_core::ResourceId;
use chengis_core::build::{Build, BuildStatus, TriggerKind};
use chengis_core::build::Job;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait BuildRepo: Send + Sync {
    async fn create_job(&self, job: &Job) -> DbResult<()>;
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;
    async fn get_job_by_name(&self, org_id: Option<ResourceId>, name: &str) -> DbResult<Job>;
    async fn list_jobs(&self, org_id: Option<ResourceId>) -> DbResult<Vec<Job>>;
    async fn delete_job(&self, id: ResourceId) -> DbResult<()>;

    /// Allocate the next build number for a job. (job, number) is unique.
    async fn next_build_number(&self, job_id: ResourceId) -> DbResult<u64>;
    async fn create_build(&self, build: &Build) -> DbResult<()>;
    async fn get_build(&self, id: ResourceId) -> DbResult<Build>;
    async fn update_build_status(&self, id: ResourceId, status: BuildStatus) -> DbResult<()>;
    async fn set_build_started(&self, id: ResourceId) -> DbResult<()>;
    async fn set_build_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> DbResult<()>;
    async fn complete_build(
        &self,
        id: ResourceId,
        status: BuildStatus,
        failure_reason: Option<&str>,
        failed_stage: Option<&str>,
    ) -> DbResult<()>;
    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>>;
    /// Non-terminal builds currently assigned to an agent.
    async fn active_builds_for_agent(&self, agent_id: ResourceId) -> DbResult<Vec<Build>>;
}

#[derive(Debug, sqlx::FromRow)]
struct JobRecord {
    id: uuid::Uuid,
    name: String,
    display_name: String,
    pipeline: serde_json::Value,
    required_labels: Vec<String>,
    parameters: serde_json::Value,
    default_branch: String,
    org_id: Option<uuid::Uuid>,
    repo_url: Option<String>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Job> {
        Ok(Job {
            id: r.id.into(),
            name: r.name,
            display_name: r.display_name,
            pipeline: serde_json::from_value(r.pipeline)?,
            required_labels: r.required_labels.into_iter().collect(),
            parameters: serde_json::from_value(r.parameters)?,
            default_branch: r.default_branch,
            org_id: r.org_id.map(Into::into),
            repo_url: r.repo_url,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRecord {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    number: i64,
    status: String,
    trigger_kind: String,
    parameters: serde_json::Value,
    branch: String,
    workspace: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    dispatched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    agent_id: Option<uuid::Uuid>,
    attempt_number: i32,
    root_build_id: uuid::Uuid,
    org_id: Option<uuid::Uuid>,
    failure_reason: Option<String>,
    failed_stage: Option<String>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(r: BuildRecord) -> DbResult<Build> {
        Ok(Build {
            id: r.id.into(),
            job_id: r.job_id.into(),
            number: r.number as u64,
            status: parse_status(&r.status)?,
            trigger: parse_trigger(&r.trigger_kind)?,
            parameters: serde_json::from_value(r.parameters)?,
            branch: r.branch,
            workspace: r.workspace,
            created_at: r.created_at,
            started_at: r.started_at,
            dispatched_at: r.dispatched_at,
            completed_at: r.completed_at,
            agent_id: r.agent_id.map(Into::into),
            attempt_number: r.attempt_number as u32,
            root_build_id: r.root_build_id.into(),
            org_id: r.org_id.map(Into::into),
            failure_reason: r.failure_reason,
            failed_stage: r.failed_stage,
        })
    }
}

fn parse_status(s: &str) -> DbResult<BuildStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| DbError::Conflict(format!("unknown build status {s:?}")))
}

fn parse_trigger(s: &str) -> DbResult<TriggerKind> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| DbError::Conflict(format!("unknown trigger kind {s:?}")))
}

fn status_str(status: BuildStatus) -> String {
    status.to_string()
}

fn trigger_str(trigger: TriggerKind) -> DbResult<String> {
    match serde_json::to_value(trigger)? {
        serde_json::Value::String(s) => Ok(s),
        _ => Err(DbError::Conflict("trigger kind".to_string())),
    }
}

/// PostgreSQL implementation of [`BuildRepo`].
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_job(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, display_name, pipeline, required_labels, parameters,
                              default_branch, org_id, repo_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                pipeline = EXCLUDED.pipeline,
                required_labels = EXCLUDED.required_labels,
                parameters = EXCLUDED.parameters,
                default_branch = EXCLUDED.default_branch,
                repo_url = EXCLUDED.repo_url,
                updated_at = NOW()
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.display_name)
        .bind(serde_json::to_value(&job.pipeline)?)
        .bind(job.required_labels.iter().cloned().collect::<Vec<_>>())
        .bind(serde_json::to_value(&job.parameters)?)
        .bind(&job.default_branch)
        .bind(job.org_id.map(|o| *o.as_uuid()))
        .bind(&job.repo_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        record.try_into()
    }

    async fn get_job_by_name(&self, org_id: Option<ResourceId>, name: &str) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE name = $1 AND org_id IS NOT DISTINCT FROM $2",
        )
        .bind(name)
        .bind(org_id.map(|o| *o.as_uuid()))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {name:?}")))?;
        record.try_into()
    }

    async fn list_jobs(&self, org_id: Option<ResourceId>) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE org_id IS NOT DISTINCT FROM $1 ORDER BY name",
        )
        .bind(org_id.map(|o| *o.as_uuid()))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_job(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_build_number(&self, job_id: ResourceId) -> DbResult<u64> {
        // Serialized via the per-job counter row so (job, number) stays unique.
        let number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_build_counters (job_id, last_number)
            VALUES ($1, 1)
            ON CONFLICT (job_id) DO UPDATE SET last_number = job_build_counters.last_number + 1
            RETURNING last_number
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(number as u64)
    }

    async fn create_build(&self, build: &Build) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, job_id, number, status, trigger_kind, parameters, branch,
                                workspace, created_at, started_at, dispatched_at, completed_at,
                                agent_id, attempt_number, root_build_id, org_id,
                                failure_reason, failed_stage)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.job_id.as_uuid())
        .bind(build.number as i64)
        .bind(status_str(build.status))
        .bind(trigger_str(build.trigger)?)
        .bind(serde_json::to_value(&build.parameters)?)
        .bind(&build.branch)
        .bind(&build.workspace)
        .bind(build.created_at)
        .bind(build.started_at)
        .bind(build.dispatched_at)
        .bind(build.completed_at)
        .bind(build.agent_id.map(|a| *a.as_uuid()))
        .bind(build.attempt_number as i32)
        .bind(build.root_build_id.as_uuid())
        .bind(build.org_id.map(|o| *o.as_uuid()))
        .bind(&build.failure_reason)
        .bind(&build.failed_stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        record.try_into()
    }

    async fn update_build_status(&self, id: ResourceId, status: BuildStatus) -> DbResult<()> {
        sqlx::query("UPDATE builds SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status_str(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_build_started(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE builds SET status = 'running', started_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_build_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> DbResult<()> {
        sqlx::query(
            "UPDATE builds SET status = 'dispatching', dispatched_at = NOW(), agent_id = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(agent_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_build(
        &self,
        id: ResourceId,
        status: BuildStatus,
        failure_reason: Option<&str>,
        failed_stage: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE builds
            SET status = $2, completed_at = NOW(), failure_reason = $3, failed_stage = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status_str(status))
        .bind(failure_reason)
        .bind(failed_stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE job_id = $1 ORDER BY number DESC LIMIT $2",
        )
        .bind(job_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn active_builds_for_agent(&self, agent_id: ResourceId) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT * FROM builds
            WHERE agent_id = $1 AND status IN ('dispatching', 'running')
            "#,
        )
        .bind(agent_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TryInto::try_into).collect()
    }
}
