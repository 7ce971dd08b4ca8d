//! Durable build queue item model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::ResourceId;
use crate::pipeline::Pipeline;

/// A build awaiting remote execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub job_id: ResourceId,
    /// Serialized [`DispatchPayload`].
    pub payload: serde_json::Value,
    pub required_labels: BTreeSet<String>,
    pub status: QueueItemStatus,
    pub agent_id: Option<ResourceId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub org_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    /// Transient state owned by exactly one dequeuer.
    Dispatching,
    Dispatched,
    Completed,
    DeadLetter,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::DeadLetter)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Dispatching => "dispatching",
            QueueItemStatus::Dispatched => "dispatched",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::DeadLetter => "dead_letter",
        }
    }
}

/// Which branch `mark_failed` took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, will be retried after the returned instant.
    Retried { next_retry_at: DateTime<Utc> },
    DeadLettered,
}

/// Exponential backoff for queue retries: 30s, 60s, 120s, ... capped at 15m.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let secs = 30u64.saturating_mul(1u64 << retry_count.min(16));
    Duration::seconds(secs.min(900) as i64)
}

/// The serialized body shipped to an agent: everything it needs to run the
/// build without calling back for the definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub build_id: ResourceId,
    pub job_id: ResourceId,
    pub job_name: String,
    pub build_number: u64,
    pub pipeline: Pipeline,
    pub parameters: HashMap<String, String>,
    pub branch: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    pub org_id: Option<ResourceId>,
    /// Token the master uses to ignore duplicate dispatches of one build.
    pub dispatch_token: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0).num_seconds(), 30);
        assert_eq!(retry_backoff(1).num_seconds(), 60);
        assert_eq!(retry_backoff(2).num_seconds(), 120);
        assert_eq!(retry_backoff(10).num_seconds(), 900);
        assert_eq!(retry_backoff(u32::MAX).num_seconds(), 900);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueItemStatus::Pending.is_terminal());
        assert!(!QueueItemStatus::Dispatching.is_terminal());
        assert!(QueueItemStatus::Completed.is_terminal());
        assert!(QueueItemStatus::DeadLetter.is_terminal());
    }
}
