//! Step executors for the Chengis CI engine.
//!
//! The registry maps a step kind to its implementation. From the core's
//! viewpoint this is a compile-time map; external plugins register through
//! the same interface from glue code.

pub mod docker;
pub mod iac;
pub mod shell;

pub use docker::DockerStepExecutor;
pub use iac::ToolStepExecutor;
pub use shell::ShellExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use chengis_core::executor::StepExecutor;
use chengis_core::pipeline::StepKind;
use chengis_core::policy::ToolPolicy;

/// Registry of step executors keyed by step kind.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in process-based executors. The docker
    /// executor needs a daemon connection and is registered separately.
    pub fn builtin(tool_policy: Arc<dyn ToolPolicy>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor::new()));
        registry.register(Arc::new(ToolStepExecutor::new(
            StepKind::DockerCompose,
            "docker-compose",
            tool_policy.clone(),
        )));
        registry.register(Arc::new(ToolStepExecutor::new(
            StepKind::Terraform,
            "terraform",
            tool_policy.clone(),
        )));
        registry.register(Arc::new(ToolStepExecutor::new(
            StepKind::Pulumi,
            "pulumi",
            tool_policy.clone(),
        )));
        registry.register(Arc::new(ToolStepExecutor::new(
            StepKind::Cloudformation,
            "aws",
            tool_policy,
        )));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.executors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::policy::PermissivePolicy;

    #[test]
    fn builtin_registry_covers_process_kinds() {
        let registry = ExecutorRegistry::builtin(Arc::new(PermissivePolicy));
        assert!(registry.get(StepKind::Shell).is_some());
        assert!(registry.get(StepKind::Terraform).is_some());
        assert!(registry.get(StepKind::Pulumi).is_some());
        assert!(registry.get(StepKind::Cloudformation).is_some());
        assert!(registry.get(StepKind::DockerCompose).is_some());
        assert!(registry.get(StepKind::Docker).is_none());
    }
}
