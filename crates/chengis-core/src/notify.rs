//! Notifier plugin seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::build::BuildStatus;

/// Terminal build summary handed to notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: ResourceId,
    pub job_name: String,
    pub build_number: u64,
    pub status: BuildStatus,
    pub duration_ms: u64,
    pub failed_stage: Option<String>,
}

/// Trait for notifier plugins. Failures are the notifier's problem; callers
/// log and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, summary: &BuildSummary);
}
