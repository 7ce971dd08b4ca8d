//! Step executor trait and result types.
//!
//! Executors run a single step in the build workspace (a shell process, a
//! container, an IaC tool). Implementations must honor the build context's
//! working directory, environment, mask values, and cancel signal, and must
//! never terminate the hosting process: everything comes back as a result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;
use crate::context::BuildContext;
use crate::pipeline::{StepDef, StepKind};

/// Exit code conventionally meaning the tool was not found.
pub const EXIT_TOOL_NOT_FOUND: i32 = 127;

/// Result of executing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub exit_code: i32,
    /// Captured stdout tail, already masked.
    pub stdout: String,
    /// Captured stderr tail, already masked.
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default)]
    pub error: Option<StepErrorTag>,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.error.is_none()
    }

    /// Outcome for a step that failed before any process ran.
    pub fn failed(tag: StepErrorTag, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0,
            timed_out: false,
            error: Some(tag),
        }
    }
}

/// Structured failure tag on a step outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepErrorTag {
    ToolNotFound,
    PolicyDenied,
    TimedOut,
    Cancelled,
    Spawn,
}

/// Trait for step executors.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step kind this executor handles.
    fn kind(&self) -> StepKind;

    /// Execute the step. `default_timeout` applies when the step definition
    /// carries none. Errors are reserved for internal faults; ordinary
    /// failures (non-zero exit, timeout, policy denial) are outcomes.
    async fn execute(
        &self,
        ctx: &BuildContext,
        step: &StepDef,
        default_timeout: Duration,
    ) -> Result<StepOutcome>;
}
