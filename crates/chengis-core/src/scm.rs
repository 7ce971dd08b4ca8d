//! SCM checkout abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// What to check out into a build workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSpec {
    pub repo_url: String,
    pub branch: Option<String>,
    pub sha: Option<String>,
    /// Depth for shallow clone; None for full history.
    pub depth: Option<u32>,
}

/// Commit metadata captured at checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub short_sha: String,
    pub branch: Option<String>,
    pub message: String,
    pub author: String,
}

/// Trait for source checkout providers.
#[async_trait]
pub trait ScmProvider: Send + Sync {
    async fn checkout(&self, spec: &CheckoutSpec, dest: &Path) -> Result<CommitInfo>;
}
