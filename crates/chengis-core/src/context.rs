//! Build execution context.
//!
//! The build runner constructs one context per attempt and owns it for the
//! build's lifetime. Step executors receive it by reference and use it for
//! the workspace path, merged environment, secret masking, cancellation,
//! and event emission.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::ResourceId;
use crate::event::{BuildEventKind, EventSink, NewBuildEvent};
use crate::masker::StreamMasker;
use crate::pipeline::StepDef;

/// Everything a running build carries with it.
#[derive(Clone)]
pub struct BuildContext {
    pub build_id: ResourceId,
    pub job_id: ResourceId,
    pub job_name: String,
    pub build_number: u64,
    pub org_id: Option<ResourceId>,
    pub workspace: PathBuf,
    pub branch: String,
    pub parameters: HashMap<String, String>,
    /// Build-level environment (job env + trigger bindings).
    pub environment: HashMap<String, String>,
    /// Resolved secret values keyed by env name.
    pub secrets: HashMap<String, String>,
    /// Secret values (not keys) to redact from all emitted output.
    pub mask_values: Vec<String>,
    /// Name of the stage currently executing, for event attribution.
    pub current_stage: Option<String>,
    pub cancel: CancellationToken,
    pub events: Arc<dyn EventSink>,
}

impl BuildContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Full environment for a step: build env, then secrets, then stage and
    /// step overrides in that order.
    pub fn step_environment(
        &self,
        stage_env: &HashMap<String, String>,
        step: &StepDef,
    ) -> HashMap<String, String> {
        let mut env = self.environment.clone();
        env.extend(self.secrets.clone());
        env.extend(stage_env.clone());
        env.extend(step.environment.clone());
        env.insert("CHENGIS_BUILD_ID".to_string(), self.build_id.to_string());
        env.insert(
            "CHENGIS_BUILD_NUMBER".to_string(),
            self.build_number.to_string(),
        );
        env.insert("CHENGIS_JOB".to_string(), self.job_name.clone());
        env.insert("CHENGIS_BRANCH".to_string(), self.branch.clone());
        env
    }

    /// Resolve a step's working directory inside the workspace.
    pub fn step_working_dir(&self, step: &StepDef) -> PathBuf {
        match &step.working_dir {
            Some(rel) => self.workspace.join(rel),
            None => self.workspace.clone(),
        }
    }

    /// Per-step log emitter with stream-safe masking for stdout and stderr.
    /// Events are attributed to the current stage.
    pub fn step_logger(&self, step: &str) -> StepLogger {
        StepLogger {
            build_id: self.build_id,
            stage: self.current_stage.clone().unwrap_or_default(),
            step: step.to_string(),
            stdout: StreamMasker::new(&self.mask_values),
            stderr: StreamMasker::new(&self.mask_values),
            events: self.events.clone(),
        }
    }

    /// One-shot masking for text that is not part of a stream.
    pub fn mask(&self, text: &str) -> String {
        StreamMasker::mask_full(&self.mask_values, text)
    }
}

/// Emits `step-log` events for one step, masking both streams.
pub struct StepLogger {
    build_id: ResourceId,
    stage: String,
    step: String,
    stdout: StreamMasker,
    stderr: StreamMasker,
    events: Arc<dyn EventSink>,
}

impl StepLogger {
    /// Returns the masked text that was actually emitted so callers can
    /// capture it alongside streaming.
    pub async fn stdout(&mut self, fragment: &str) -> String {
        let safe = self.stdout.push(fragment);
        self.emit(safe.clone(), "stdout").await;
        safe
    }

    pub async fn stderr(&mut self, fragment: &str) -> String {
        let safe = self.stderr.push(fragment);
        self.emit(safe.clone(), "stderr").await;
        safe
    }

    /// Flush held-back tails at end of step; returns (stdout, stderr) tails.
    pub async fn finish(&mut self) -> (String, String) {
        let out = self.stdout.finish();
        self.emit(out.clone(), "stdout").await;
        let err = self.stderr.finish();
        self.emit(err.clone(), "stderr").await;
        (out, err)
    }

    async fn emit(&self, text: String, stream: &str) {
        if text.is_empty() {
            return;
        }
        self.events
            .emit(
                self.build_id,
                NewBuildEvent::new(BuildEventKind::StepLog)
                    .stage(self.stage.clone())
                    .step(self.step.clone())
                    .payload(serde_json::json!({ "stream": stream, "text": text })),
            )
            .await;
    }
}
