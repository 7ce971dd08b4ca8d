//! Artifact collection and the local filesystem store.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use chengis_core::artifact::{ArtifactRef, ArtifactStore};
use chengis_core::{Error, ResourceId, Result};

/// Collect workspace files matching the pipeline's glob patterns into the
/// store. Unreadable files are skipped with a warning rather than failing
/// the build.
pub async fn collect_artifacts(
    store: &Arc<dyn ArtifactStore>,
    build_id: ResourceId,
    workspace: &Path,
    patterns: &[String],
) -> Vec<ArtifactRef> {
    let mut collected = Vec::new();
    for pattern in patterns {
        let absolute = workspace.join(pattern);
        let matches = match glob::glob(&absolute.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid artifact pattern");
                continue;
            }
        };
        for entry in matches.flatten() {
            if !entry.is_file() {
                continue;
            }
            let relative = entry
                .strip_prefix(workspace)
                .unwrap_or(&entry)
                .to_string_lossy()
                .to_string();
            match store.store(build_id, &relative, &entry).await {
                Ok(artifact) => collected.push(artifact),
                Err(e) => {
                    warn!(path = %relative, error = %e, "artifact upload failed");
                }
            }
        }
    }
    if !collected.is_empty() {
        info!(build_id = %build_id, count = collected.len(), "artifacts collected");
    }
    collected
}

/// Filesystem-backed artifact store: `<root>/<build_id>/<relative_path>`.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_dir(&self, build_id: ResourceId) -> PathBuf {
        self.root.join(build_id.to_string())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        build_id: ResourceId,
        relative_path: &str,
        file: &Path,
    ) -> Result<ArtifactRef> {
        let content = tokio::fs::read(file)
            .await
            .map_err(|e| Error::Storage(format!("read {}: {e}", file.display())))?;
        let sha256 = hex::encode(Sha256::digest(&content));
        let size = content.len() as u64;

        let dest = self.build_dir(build_id).join(relative_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("mkdir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&dest, &content)
            .await
            .map_err(|e| Error::Storage(format!("write {}: {e}", dest.display())))?;

        let name = Path::new(relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| relative_path.to_string());
        Ok(ArtifactRef {
            name,
            path: relative_path.to_string(),
            size,
            sha256,
        })
    }

    async fn list(&self, build_id: ResourceId) -> Result<Vec<ArtifactRef>> {
        let dir = self.build_dir(build_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| Error::Storage(format!("read_dir {}: {e}", current.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Storage(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let content = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                let relative = path
                    .strip_prefix(&dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                refs.push(ArtifactRef {
                    name: entry.file_name().to_string_lossy().to_string(),
                    path: relative,
                    size: content.len() as u64,
                    sha256: hex::encode(Sha256::digest(&content)),
                });
            }
        }
        refs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(refs)
    }
}
