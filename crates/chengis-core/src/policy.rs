//! Policy engine seams.
//!
//! Stage policies can abort a build mid-flight; image and tool policies gate
//! what the docker and IaC executors may run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySeverity {
    Info,
    Warn,
    Block,
}

/// A single policy evaluation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub severity: PolicySeverity,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            severity: PolicySeverity::Info,
            reason: None,
        }
    }

    pub fn deny(severity: PolicySeverity, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            severity,
            reason: Some(reason.into()),
        }
    }

    /// A denial at or above `block` severity fails the subject.
    pub fn is_blocking(&self) -> bool {
        !self.allowed && self.severity >= PolicySeverity::Block
    }
}

/// Subject of a stage-level policy evaluation.
#[derive(Debug, Clone)]
pub struct StageSubject<'a> {
    pub org_id: Option<ResourceId>,
    pub job_name: &'a str,
    pub stage_name: &'a str,
    pub branch: &'a str,
}

/// Trait for the policy engine collaborator.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate all policies attached to a stage.
    async fn evaluate_stage(&self, subject: StageSubject<'_>) -> Vec<PolicyDecision>;
}

/// Trait for container image policy.
#[async_trait]
pub trait ImagePolicy: Send + Sync {
    async fn allow_image(&self, org_id: Option<ResourceId>, image: &str) -> PolicyDecision;
}

/// Trait for IaC tool policy.
#[async_trait]
pub trait ToolPolicy: Send + Sync {
    async fn allow_tool(&self, org_id: Option<ResourceId>, tool: &str) -> PolicyDecision;
}

/// Policy engine that allows everything. The default wiring when no external
/// policy collaborator is registered.
#[derive(Debug, Default)]
pub struct PermissivePolicy;

#[async_trait]
impl PolicyEngine for PermissivePolicy {
    async fn evaluate_stage(&self, _subject: StageSubject<'_>) -> Vec<PolicyDecision> {
        Vec::new()
    }
}

#[async_trait]
impl ImagePolicy for PermissivePolicy {
    async fn allow_image(&self, _org_id: Option<ResourceId>, _image: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

#[async_trait]
impl ToolPolicy for PermissivePolicy {
    async fn allow_tool(&self, _org_id: Option<ResourceId>, _tool: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_requires_deny_and_block_severity() {
        assert!(!PolicyDecision::allow().is_blocking());
        assert!(!PolicyDecision::deny(PolicySeverity::Warn, "advisory").is_blocking());
        assert!(PolicyDecision::deny(PolicySeverity::Block, "forbidden").is_blocking());
    }
}
