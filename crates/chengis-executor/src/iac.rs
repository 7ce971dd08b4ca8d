//! IaC and compose step executors.
//!
//! Thin wrappers around the shell path: the step command holds the tool's
//! arguments (`plan -input=false`), the executor prefixes the tool binary.
//! The tool policy is consulted first; a denial short-circuits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use chengis_core::context::BuildContext;
use chengis_core::executor::{StepErrorTag, StepExecutor, StepOutcome};
use chengis_core::pipeline::{StepDef, StepKind};
use chengis_core::policy::ToolPolicy;
use chengis_core::Result;

use crate::shell::run_shell_command;

/// Executor for steps that shell out to a named tool.
pub struct ToolStepExecutor {
    kind: StepKind,
    tool: &'static str,
    policy: Arc<dyn ToolPolicy>,
}

impl ToolStepExecutor {
    pub fn new(kind: StepKind, tool: &'static str, policy: Arc<dyn ToolPolicy>) -> Self {
        Self { kind, tool, policy }
    }
}

#[async_trait]
impl StepExecutor for ToolStepExecutor {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn execute(
        &self,
        ctx: &BuildContext,
        step: &StepDef,
        default_timeout: Duration,
    ) -> Result<StepOutcome> {
        let decision = self.policy.allow_tool(ctx.org_id, self.tool).await;
        if decision.is_blocking() {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("tool {:?} denied", self.tool));
            return Ok(StepOutcome::failed(StepErrorTag::PolicyDenied, reason));
        }

        let command_line = if step.command.trim_start().starts_with(self.tool) {
            step.command.clone()
        } else {
            format!("{} {}", self.tool, step.command)
        };
        run_shell_command(ctx, step, &command_line, default_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::event::NullEventSink;
    use chengis_core::policy::{ImagePolicy, PolicyDecision, PolicySeverity, PermissivePolicy};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct DenyAll;

    #[async_trait]
    impl ToolPolicy for DenyAll {
        async fn allow_tool(
            &self,
            _org_id: Option<ResourceId>,
            tool: &str,
        ) -> PolicyDecision {
            PolicyDecision::deny(PolicySeverity::Block, format!("{tool} is not approved"))
        }
    }

    #[async_trait]
    impl ImagePolicy for DenyAll {
        async fn allow_image(
            &self,
            _org_id: Option<ResourceId>,
            image: &str,
        ) -> PolicyDecision {
            PolicyDecision::deny(PolicySeverity::Block, format!("{image} is not approved"))
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            build_id: ResourceId::new(),
            job_id: ResourceId::new(),
            job_name: "iac".to_string(),
            build_number: 1,
            org_id: None,
            workspace: std::env::temp_dir(),
            branch: "main".to_string(),
            parameters: HashMap::new(),
            environment: HashMap::new(),
            secrets: HashMap::new(),
            mask_values: vec![],
            current_stage: None,
            cancel: CancellationToken::new(),
            events: Arc::new(NullEventSink),
        }
    }

    fn step(command: &str) -> StepDef {
        StepDef {
            name: "tf".to_string(),
            kind: StepKind::Terraform,
            command: command.to_string(),
            image: None,
            pull_policy: None,
            environment: HashMap::new(),
            working_dir: None,
            timeout_secs: Some(10),
        }
    }

    #[tokio::test]
    async fn policy_denial_short_circuits() {
        let exec = ToolStepExecutor::new(StepKind::Terraform, "terraform", Arc::new(DenyAll));
        let outcome = exec
            .execute(&ctx(), &step("plan"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error, Some(StepErrorTag::PolicyDenied));
        assert!(outcome.stderr.contains("not approved"));
    }

    #[tokio::test]
    async fn allowed_tool_runs_through_the_shell() {
        // `echo` stands in for the tool binary so the test has no terraform
        // dependency.
        let exec = ToolStepExecutor::new(StepKind::Terraform, "echo", Arc::new(PermissivePolicy));
        let outcome = exec
            .execute(&ctx(), &step("plan -input=false"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("plan -input=false"));
    }
}
