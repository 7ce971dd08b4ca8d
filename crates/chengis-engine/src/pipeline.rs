//! Pipeline executor.
//!
//! Walks the pipeline tree: evaluates `when` conditions, parks on approval
//! gates, applies stage policies, runs sequential or parallel steps, then
//! post hooks. Cooperative cancellation is checked at every stage and step
//! boundary; `always` post hooks run even after a cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_core::approval::ApprovalDecision;
use chengis_core::build::{
    BuildResult, BuildStatus, StageRecord, StageStatus, StepRecord, StepStatus,
};
use chengis_core::context::BuildContext;
use chengis_core::event::{BuildEventKind, NewBuildEvent};
use chengis_core::executor::{StepErrorTag, StepOutcome};
use chengis_core::pipeline::{Pipeline, Stage, StepDef, StepKind};
use chengis_core::policy::{PolicyEngine, StageSubject};
use chengis_executor::ExecutorRegistry;

use crate::approval::{ApprovalManager, GateWait};
use crate::matrix;

/// Applied when a step definition carries no timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

enum StageOutcome {
    Success,
    Failed(String),
    Aborted,
}

pub struct PipelineExecutor {
    registry: Arc<ExecutorRegistry>,
    policy: Arc<dyn PolicyEngine>,
    approvals: Arc<ApprovalManager>,
    max_matrix_combinations: usize,
    default_step_timeout: Duration,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        policy: Arc<dyn PolicyEngine>,
        approvals: Arc<ApprovalManager>,
        max_matrix_combinations: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            approvals,
            max_matrix_combinations,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Run a pipeline to a terminal status. Step-level errors never escape
    /// as exceptions; everything lands in the structured result.
    pub async fn execute(&self, ctx: &BuildContext, pipeline: &Pipeline) -> BuildResult {
        let stages = match matrix::expand_stages(pipeline, self.max_matrix_combinations) {
            Ok(stages) => stages,
            Err(e) => {
                // Malformed matrix fails the build before any step runs.
                return BuildResult {
                    status: BuildStatus::Failure,
                    stages: Vec::new(),
                    failure_reason: Some(e.to_string()),
                    failed_stage: None,
                };
            }
        };

        let mut records: Vec<StageRecord> = Vec::with_capacity(stages.len());
        let mut failure: Option<(String, String)> = None;
        let mut aborted = false;

        for (ordinal, stage) in stages.iter().enumerate() {
            let ordinal = ordinal as u32;

            if ctx.is_cancelled() {
                aborted = true;
                records.push(skipped_record(stage, ordinal, StageStatus::Aborted));
                continue;
            }
            if failure.is_some() {
                records.push(skipped_record(
                    stage,
                    ordinal,
                    StageStatus::Skipped {
                        reason: "previous stage failed".to_string(),
                    },
                ));
                continue;
            }

            if let Some(when) = &stage.when {
                if !when.evaluate(&ctx.branch, &ctx.parameters) {
                    let status = StageStatus::Skipped {
                        reason: "condition not met".to_string(),
                    };
                    self.emit_stage_completed(ctx, &stage.name, &status).await;
                    records.push(skipped_record(stage, ordinal, status));
                    continue;
                }
            }

            let record = self.run_stage(ctx, stage, ordinal).await;
            match &record.status {
                StageStatus::Failed { message } => {
                    failure = Some((message.clone(), stage.name.clone()));
                }
                StageStatus::Aborted => aborted = true,
                _ => {}
            }
            records.push(record);
        }

        // Pipeline-level post block against the aggregate status.
        let succeeded = failure.is_none() && !aborted;
        self.run_post_block(ctx, None, &pipeline.post, succeeded, aborted)
            .await;

        if aborted {
            ctx.events
                .emit(ctx.build_id, NewBuildEvent::new(BuildEventKind::Cancelled))
                .await;
        }

        let status = if aborted {
            BuildStatus::Aborted
        } else if failure.is_some() {
            BuildStatus::Failure
        } else {
            BuildStatus::Success
        };
        let (failure_reason, failed_stage) = match failure {
            Some((reason, stage)) => (Some(reason), Some(stage)),
            None => (None, None),
        };
        BuildResult {
            status,
            stages: records,
            failure_reason,
            failed_stage,
        }
    }

    async fn run_stage(&self, ctx: &BuildContext, stage: &Stage, ordinal: u32) -> StageRecord {
        let started_at = Utc::now();

        // Approval gate blocks the transition before anything runs.
        if let Some(approval) = &stage.approval {
            ctx.events
                .emit(
                    ctx.build_id,
                    NewBuildEvent::new(BuildEventKind::GatePending)
                        .stage(stage.name.clone())
                        .payload(serde_json::json!({
                            "required_role": approval.required_role,
                            "min_approvals": approval.min_approvals,
                        })),
                )
                .await;

            let wait = self
                .approvals
                .wait(ctx.build_id, &stage.name, approval, &ctx.cancel)
                .await;
            let gate_status = match wait {
                Ok(GateWait::Decision(ApprovalDecision::Approved)) => None,
                Ok(GateWait::Decision(ApprovalDecision::Rejected)) => {
                    Some(StageStatus::Failed {
                        message: "approval rejected".to_string(),
                    })
                }
                Ok(GateWait::Decision(ApprovalDecision::TimedOut)) => {
                    Some(StageStatus::Failed {
                        message: "approval timed out".to_string(),
                    })
                }
                Ok(GateWait::Cancelled) => Some(StageStatus::Aborted),
                Err(e) => Some(StageStatus::Failed {
                    message: format!("approval gate error: {e}"),
                }),
            };
            if let Some(status) = gate_status {
                self.emit_stage_completed(ctx, &stage.name, &status).await;
                return StageRecord {
                    name: stage.name.clone(),
                    ordinal,
                    status,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    steps: Vec::new(),
                };
            }
        }

        // Attached policies; a blocking denial fails the stage.
        let subject = StageSubject {
            org_id: ctx.org_id,
            job_name: &ctx.job_name,
            stage_name: &stage.name,
            branch: &ctx.branch,
        };
        let decisions = self.policy.evaluate_stage(subject).await;
        if let Some(denied) = decisions.iter().find(|d| d.is_blocking()) {
            let reason = denied
                .reason
                .clone()
                .unwrap_or_else(|| "policy denied".to_string());
            warn!(stage = %stage.name, reason = %reason, "stage blocked by policy");
            let status = StageStatus::Failed {
                message: format!("policy denied: {reason}"),
            };
            self.emit_stage_completed(ctx, &stage.name, &status).await;
            return StageRecord {
                name: stage.name.clone(),
                ordinal,
                status,
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
                steps: Vec::new(),
            };
        }

        ctx.events
            .emit(
                ctx.build_id,
                NewBuildEvent::new(BuildEventKind::StageStarted).stage(stage.name.clone()),
            )
            .await;
        info!(build_id = %ctx.build_id, stage = %stage.name, "stage started");

        let (steps, outcome) = if stage.parallel {
            self.run_parallel_steps(ctx, stage).await
        } else {
            self.run_sequential_steps(ctx, stage).await
        };

        let status = match outcome {
            StageOutcome::Success => StageStatus::Success,
            StageOutcome::Failed(message) => StageStatus::Failed { message },
            StageOutcome::Aborted => StageStatus::Aborted,
        };

        // Post hooks never alter stage status.
        let succeeded = matches!(status, StageStatus::Success);
        let stage_aborted = matches!(status, StageStatus::Aborted);
        self.run_post_block(ctx, Some(&stage.name), &stage.post, succeeded, stage_aborted)
            .await;

        self.emit_stage_completed(ctx, &stage.name, &status).await;
        StageRecord {
            name: stage.name.clone(),
            ordinal,
            status,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            steps,
        }
    }

    async fn run_sequential_steps(
        &self,
        ctx: &BuildContext,
        stage: &Stage,
    ) -> (Vec<StepRecord>, StageOutcome) {
        let mut records = Vec::with_capacity(stage.steps.len());
        let mut outcome = StageOutcome::Success;

        for (ordinal, step) in stage.steps.iter().enumerate() {
            let ordinal = ordinal as u32;
            match &outcome {
                StageOutcome::Success => {}
                // First failure or abort stops the rest.
                _ => {
                    records.push(StepRecord {
                        name: step.name.clone(),
                        ordinal,
                        status: StepStatus::Skipped,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        started_at: None,
                        finished_at: None,
                    });
                    continue;
                }
            }
            if ctx.is_cancelled() {
                outcome = StageOutcome::Aborted;
                records.push(StepRecord {
                    name: step.name.clone(),
                    ordinal,
                    status: StepStatus::Aborted,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    started_at: None,
                    finished_at: None,
                });
                continue;
            }

            let record = run_step(
                self.registry.clone(),
                ctx.clone(),
                stage.clone(),
                step.clone(),
                ordinal,
                self.default_step_timeout,
            )
            .await;
            match record.status {
                StepStatus::Success => {}
                StepStatus::Aborted => outcome = StageOutcome::Aborted,
                _ => {
                    outcome =
                        StageOutcome::Failed(format!("step {:?} failed", record.name));
                }
            }
            records.push(record);
        }
        (records, outcome)
    }

    /// All steps scheduled concurrently, joined before the stage completes.
    /// The stage fails iff any child step fails.
    async fn run_parallel_steps(
        &self,
        ctx: &BuildContext,
        stage: &Stage,
    ) -> (Vec<StepRecord>, StageOutcome) {
        let mut handles = Vec::with_capacity(stage.steps.len());
        for (ordinal, step) in stage.steps.iter().enumerate() {
            handles.push(tokio::spawn(run_step(
                self.registry.clone(),
                ctx.clone(),
                stage.clone(),
                step.clone(),
                ordinal as u32,
                self.default_step_timeout,
            )));
        }

        let mut records = Vec::with_capacity(handles.len());
        for (ordinal, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(error = %e, "parallel step task panicked");
                    records.push(StepRecord {
                        name: format!("step-{ordinal}"),
                        ordinal: ordinal as u32,
                        status: StepStatus::Failed,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        started_at: None,
                        finished_at: None,
                    });
                }
            }
        }
        records.sort_by_key(|r| r.ordinal);

        let outcome = if records.iter().any(|r| r.status == StepStatus::Aborted) {
            StageOutcome::Aborted
        } else if let Some(failed) = records.iter().find(|r| r.status == StepStatus::Failed) {
            StageOutcome::Failed(format!("step {:?} failed", failed.name))
        } else {
            StageOutcome::Success
        };
        (records, outcome)
    }

    /// Run a post block: `always` unconditionally (even after cancel),
    /// `on_success`/`on_failure` by status. Failures are logged only.
    async fn run_post_block(
        &self,
        ctx: &BuildContext,
        stage_name: Option<&str>,
        post: &chengis_core::pipeline::PostBlock,
        succeeded: bool,
        aborted: bool,
    ) {
        if post.is_empty() {
            return;
        }
        let scope = stage_name.unwrap_or("pipeline");

        // `always` hooks run on a fresh cancel scope so an aborted build
        // still executes them.
        let mut always_ctx = ctx.clone();
        always_ctx.cancel = CancellationToken::new();
        for (ordinal, step) in post.always.iter().enumerate() {
            self.run_post_step(&always_ctx, scope, step, ordinal as u32)
                .await;
        }

        if aborted {
            return;
        }
        let conditional = if succeeded {
            &post.on_success
        } else {
            &post.on_failure
        };
        for (ordinal, step) in conditional.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            self.run_post_step(ctx, scope, step, ordinal as u32).await;
        }
    }

    async fn run_post_step(&self, ctx: &BuildContext, scope: &str, step: &StepDef, ordinal: u32) {
        let stage = Stage {
            name: scope.to_string(),
            steps: Vec::new(),
            parallel: false,
            container: None,
            when: None,
            approval: None,
            post: Default::default(),
            environment: HashMap::new(),
        };
        let record = run_step(
            self.registry.clone(),
            ctx.clone(),
            stage,
            step.clone(),
            ordinal,
            self.default_step_timeout,
        )
        .await;
        if record.status != StepStatus::Success {
            warn!(scope = %scope, step = %record.name, "post hook failed");
        }
    }

    async fn emit_stage_completed(&self, ctx: &BuildContext, stage: &str, status: &StageStatus) {
        let status_json = serde_json::to_value(status).unwrap_or(serde_json::Value::Null);
        ctx.events
            .emit(
                ctx.build_id,
                NewBuildEvent::new(BuildEventKind::StageCompleted)
                    .stage(stage.to_string())
                    .payload(serde_json::json!({ "status": status_json })),
            )
            .await;
    }
}

fn skipped_record(stage: &Stage, ordinal: u32, status: StageStatus) -> StageRecord {
    StageRecord {
        name: stage.name.clone(),
        ordinal,
        status,
        started_at: None,
        finished_at: None,
        steps: Vec::new(),
    }
}

/// Resolve the executor-facing step definition: stage environment merges
/// under step environment, and a stage container binding turns shell steps
/// into docker steps.
fn effective_step(stage: &Stage, step: &StepDef) -> StepDef {
    let mut effective = step.clone();
    let mut env = stage.environment.clone();
    env.extend(effective.environment);
    effective.environment = env;

    if let Some(container) = &stage.container {
        if effective.kind == StepKind::Shell {
            effective.kind = StepKind::Docker;
            effective.image = Some(container.image.clone());
            effective.pull_policy = Some(container.pull_policy);
        }
    }
    effective
}

/// Execute one step and produce its record. Executor exceptions become step
/// failures with the error captured as stderr.
async fn run_step(
    registry: Arc<ExecutorRegistry>,
    mut ctx: BuildContext,
    stage: Stage,
    step: StepDef,
    ordinal: u32,
    default_timeout: Duration,
) -> StepRecord {
    ctx.current_stage = Some(stage.name.clone());
    let started_at = Utc::now();
    ctx.events
        .emit(
            ctx.build_id,
            NewBuildEvent::new(BuildEventKind::StepStarted)
                .stage(stage.name.clone())
                .step(step.name.clone())
                .payload(serde_json::json!({ "ordinal": ordinal })),
        )
        .await;

    let effective = effective_step(&stage, &step);
    let outcome = match registry.get(effective.kind) {
        Some(executor) => match executor.execute(&ctx, &effective, default_timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(step = %step.name, error = %e, "step executor error");
                StepOutcome::failed(StepErrorTag::Spawn, e.to_string())
            }
        },
        None => StepOutcome::failed(
            StepErrorTag::Spawn,
            format!("no executor registered for {:?}", effective.kind.as_str()),
        ),
    };

    let status = if outcome.success() {
        StepStatus::Success
    } else if outcome.error == Some(StepErrorTag::Cancelled) {
        StepStatus::Aborted
    } else {
        StepStatus::Failed
    };

    ctx.events
        .emit(
            ctx.build_id,
            NewBuildEvent::new(BuildEventKind::StepCompleted)
                .stage(stage.name.clone())
                .step(step.name.clone())
                .payload(serde_json::json!({
                    "ordinal": ordinal,
                    "exit_code": outcome.exit_code,
                    "duration_ms": outcome.duration_ms,
                    "timed_out": outcome.timed_out,
                    "error": outcome.error,
                })),
        )
        .await;

    StepRecord {
        name: step.name.clone(),
        ordinal,
        status,
        exit_code: Some(outcome.exit_code),
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
    }
}
