//! Secret backend abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ResourceId, Result};

/// Scope a secret is attached to. Job-scoped values win over global on merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    Global,
    Job(ResourceId),
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Merge global-scope secrets with job-scope secrets (job wins) for one
    /// build. Returns env-name to plaintext value.
    async fn resolve(
        &self,
        org_id: Option<ResourceId>,
        job_id: ResourceId,
    ) -> Result<HashMap<String, String>>;

    /// Set or replace a secret.
    async fn put(
        &self,
        org_id: Option<ResourceId>,
        scope: SecretScope,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Delete a secret; missing keys are not an error.
    async fn delete(&self, org_id: Option<ResourceId>, scope: SecretScope, key: &str)
    -> Result<()>;

    /// List key names in a scope (values are never listed).
    async fn list(&self, org_id: Option<ResourceId>, scope: SecretScope) -> Result<Vec<String>>;
}

/// The mask set for a resolved secret map: values, not keys.
pub fn mask_values(secrets: &HashMap<String, String>) -> Vec<String> {
    secrets
        .values()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .collect()
}
