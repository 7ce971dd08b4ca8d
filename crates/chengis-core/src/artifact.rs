//! Artifact storage abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{ResourceId, Result};

/// Reference to a collected artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    /// Path relative to the workspace root.
    pub path: String,
    pub size: u64,
    /// Hex-encoded sha256 of the content.
    pub sha256: String,
}

/// Trait for artifact stores.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store one file for a build; returns the recorded reference.
    async fn store(
        &self,
        build_id: ResourceId,
        relative_path: &str,
        file: &Path,
    ) -> Result<ArtifactRef>;

    /// List stored artifacts for a build.
    async fn list(&self, build_id: ResourceId) -> Result<Vec<ArtifactRef>>;
}
