//! Job and build models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::ResourceId;
use crate::pipeline::Pipeline;

/// A named, org-scoped pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    /// Unique job name within the org.
    pub name: String,
    pub display_name: String,
    /// Server-stored pipeline definition; pipeline-as-code files override it.
    pub pipeline: Pipeline,
    /// Labels an agent must carry to run this job remotely.
    #[serde(default)]
    pub required_labels: BTreeSet<String>,
    /// Parameter names with default values.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub default_branch: String,
    pub org_id: Option<ResourceId>,
    /// Repository to check out, when set.
    #[serde(default)]
    pub repo_url: Option<String>,
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub job_id: ResourceId,
    /// Monotonically increasing within the job.
    pub number: u64,
    pub status: BuildStatus,
    pub trigger: TriggerKind,
    pub parameters: HashMap<String, String>,
    pub branch: String,
    pub workspace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_id: Option<ResourceId>,
    /// 1 for the first attempt, previous + 1 for retries.
    pub attempt_number: u32,
    /// Self for the first attempt, else the originating build.
    pub root_build_id: ResourceId,
    pub org_id: Option<ResourceId>,
    /// Root-cause tag when the build did not succeed.
    pub failure_reason: Option<String>,
    pub failed_stage: Option<String>,
}

impl Build {
    /// Construct a freshly triggered first attempt.
    pub fn new(job: &Job, number: u64, trigger: TriggerKind, branch: String) -> Self {
        let id = ResourceId::new();
        Self {
            id,
            job_id: job.id,
            number,
            status: BuildStatus::Queued,
            trigger,
            parameters: job.parameters.clone(),
            branch,
            workspace: None,
            created_at: Utc::now(),
            started_at: None,
            dispatched_at: None,
            completed_at: None,
            agent_id: None,
            attempt_number: 1,
            root_build_id: id,
            org_id: job.org_id,
            failure_reason: None,
            failed_stage: None,
        }
    }

    /// Construct a retry linked to this build's root. The retry shares the
    /// root's trigger and parameters unless the caller overrides them.
    pub fn retry(&self, number: u64) -> Self {
        Self {
            id: ResourceId::new(),
            job_id: self.job_id,
            number,
            status: BuildStatus::Queued,
            trigger: self.trigger,
            parameters: self.parameters.clone(),
            branch: self.branch.clone(),
            workspace: None,
            created_at: Utc::now(),
            started_at: None,
            dispatched_at: None,
            completed_at: None,
            agent_id: None,
            attempt_number: self.attempt_number + 1,
            root_build_id: self.root_build_id,
            org_id: self.org_id,
            failure_reason: None,
            failed_stage: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Dispatching,
    Running,
    Success,
    Failure,
    Aborted,
    Orphaned,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failure | BuildStatus::Aborted | BuildStatus::Orphaned
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Dispatching => "dispatching",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

/// What triggered a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
    Api,
}

/// Per-stage execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub ordinal: u32,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    WaitingApproval,
    Success,
    Failed { message: String },
    Skipped { reason: String },
    Aborted,
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped { .. })
    }
}

/// Per-step execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub ordinal: u32,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Captured output tails, already masked.
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
    Skipped,
}

/// Structured result of a pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub stages: Vec<StageRecord>,
    pub failure_reason: Option<String>,
    pub failed_stage: Option<String>,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: ResourceId::new(),
            name: "svc".to_string(),
            display_name: "Service".to_string(),
            pipeline: Pipeline::default(),
            required_labels: BTreeSet::new(),
            parameters: HashMap::new(),
            default_branch: "main".to_string(),
            org_id: None,
            repo_url: None,
        }
    }

    #[test]
    fn first_attempt_is_its_own_root() {
        let b = Build::new(&job(), 1, TriggerKind::Manual, "main".to_string());
        assert_eq!(b.root_build_id, b.id);
        assert_eq!(b.attempt_number, 1);
    }

    #[test]
    fn retry_chain_keeps_root_and_increments_attempt() {
        let first = Build::new(&job(), 1, TriggerKind::Webhook, "main".to_string());
        let second = first.retry(2);
        let third = second.retry(3);

        assert_eq!(second.root_build_id, first.id);
        assert_eq!(third.root_build_id, first.id);
        assert_eq!(second.attempt_number, 2);
        assert_eq!(third.attempt_number, 3);
        assert_eq!(third.trigger, TriggerKind::Webhook);
        assert_ne!(third.id, second.id);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
        assert!(BuildStatus::Orphaned.is_terminal());
    }
}
