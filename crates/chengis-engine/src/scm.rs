//! Git checkout provider.
//!
//! Shells out to `git` for clone and metadata capture. Clones are shallow by
//! default; a pinned sha deepens as needed via fetch.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::info;

use chengis_core::scm::{CheckoutSpec, CommitInfo, ScmProvider};
use chengis_core::{Error, Result};

pub struct GitScm;

impl GitScm {
    pub fn new() -> Self {
        Self
    }

    async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("git spawn failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExecutionFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for GitScm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScmProvider for GitScm {
    async fn checkout(&self, spec: &CheckoutSpec, dest: &Path) -> Result<CommitInfo> {
        let dest_str = dest.to_string_lossy().to_string();
        let mut args: Vec<String> = vec!["clone".to_string()];
        if let Some(depth) = spec.depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        if let Some(branch) = &spec.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        args.push(spec.repo_url.clone());
        args.push(dest_str);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::git(&arg_refs, None).await?;

        if let Some(sha) = &spec.sha {
            // A shallow clone may not contain the pinned commit yet.
            if Self::git(&["checkout", sha], Some(dest)).await.is_err() {
                Self::git(&["fetch", "--unshallow"], Some(dest)).await?;
                Self::git(&["checkout", sha], Some(dest)).await?;
            }
        }

        let sha = Self::git(&["rev-parse", "HEAD"], Some(dest)).await?;
        let message = Self::git(&["log", "-1", "--pretty=%s"], Some(dest)).await?;
        let author = Self::git(&["log", "-1", "--pretty=%an"], Some(dest)).await?;
        let info = CommitInfo {
            short_sha: sha.chars().take(7).collect(),
            sha,
            branch: spec.branch.clone(),
            message,
            author,
        };
        info!(sha = %info.short_sha, repo = %spec.repo_url, "checked out source");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Needs git on PATH; builds a throwaway repo and clones it.
    #[tokio::test]
    async fn clones_and_captures_commit_metadata() {
        let origin = tempfile::tempdir().unwrap();
        let dest_parent = tempfile::tempdir().unwrap();
        let dest = dest_parent.path().join("checkout");

        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "ci@example.com"],
            vec!["config", "user.name", "CI"],
        ] {
            GitScm::git(&args, Some(origin.path())).await.unwrap();
        }
        std::fs::write(origin.path().join("README.md"), "hello").unwrap();
        GitScm::git(&["add", "."], Some(origin.path())).await.unwrap();
        GitScm::git(&["commit", "-m", "initial import"], Some(origin.path()))
            .await
            .unwrap();

        let spec = CheckoutSpec {
            repo_url: origin.path().to_string_lossy().to_string(),
            branch: Some("main".to_string()),
            sha: None,
            depth: Some(1),
        };
        let info = GitScm::new().checkout(&spec, &dest).await.unwrap();
        assert_eq!(info.message, "initial import");
        assert_eq!(info.author, "CI");
        assert_eq!(info.short_sha.len(), 7);
        assert!(dest.join("README.md").exists());
    }
}
