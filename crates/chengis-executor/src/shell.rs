//! Shell step executor.
//!
//! Runs the step command through `sh -c` in the step's working directory,
//! streaming masked output through the build context's event sink. Never
//! kills the hosting process; timeouts and cancellation terminate the child
//! and come back as failure outcomes.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use chengis_core::context::BuildContext;
use chengis_core::executor::{EXIT_TOOL_NOT_FOUND, StepErrorTag, StepExecutor, StepOutcome};
use chengis_core::pipeline::{StepDef, StepKind};
use chengis_core::{Error, Result};

/// Bound on the captured per-stream tail.
const CAPTURE_LIMIT: usize = 64 * 1024;

pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Shell
    }

    async fn execute(
        &self,
        ctx: &BuildContext,
        step: &StepDef,
        default_timeout: Duration,
    ) -> Result<StepOutcome> {
        run_shell_command(ctx, step, &step.command, default_timeout).await
    }
}

enum ChildLine {
    Stdout(String),
    Stderr(String),
}

/// Shared process-running path for the shell and tool executors.
pub(crate) async fn run_shell_command(
    ctx: &BuildContext,
    step: &StepDef,
    command_line: &str,
    default_timeout: Duration,
) -> Result<StepOutcome> {
    if ctx.is_cancelled() {
        return Ok(StepOutcome::failed(StepErrorTag::Cancelled, "cancelled"));
    }

    let timeout = step
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);
    let working_dir = ctx.step_working_dir(step);
    let env = ctx.step_environment(&Default::default(), step);

    debug!(step = %step.name, command = %ctx.mask(command_line), "spawning shell step");

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(&working_dir)
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StepOutcome {
                exit_code: EXIT_TOOL_NOT_FOUND,
                stdout: String::new(),
                stderr: format!("sh: not found: {e}"),
                duration_ms: 0,
                timed_out: false,
                error: Some(StepErrorTag::ToolNotFound),
            });
        }
        Err(e) => {
            return Ok(StepOutcome::failed(
                StepErrorTag::Spawn,
                format!("failed to spawn step: {e}"),
            ));
        }
    };

    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel::<ChildLine>(256);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("child stdout not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("child stderr not piped".to_string()))?;

    let out_tx = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx.send(ChildLine::Stdout(line)).await.is_err() {
                break;
            }
        }
    });
    let err_tx = tx;
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if err_tx.send(ChildLine::Stderr(line)).await.is_err() {
                break;
            }
        }
    });

    let mut logger = ctx.step_logger(&step.name);
    let mut captured_out = String::new();
    let mut captured_err = String::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // Drain reader output until both pipes hit EOF (child exited), the
    // timeout fires, or the build is cancelled.
    let mut timed_out = false;
    let mut cancelled = false;
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Some(ChildLine::Stdout(text)) => {
                        let masked = logger.stdout(&format!("{text}\n")).await;
                        append_capped(&mut captured_out, &masked);
                    }
                    Some(ChildLine::Stderr(text)) => {
                        let masked = logger.stderr(&format!("{text}\n")).await;
                        append_capped(&mut captured_err, &masked);
                    }
                    None => break,
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
            _ = ctx.cancel.cancelled() => {
                cancelled = true;
                break;
            }
        }
    }

    if timed_out || cancelled {
        let _ = child.start_kill();
        stdout_task.abort();
        stderr_task.abort();
    }
    let status = child
        .wait()
        .await
        .map_err(|e| Error::Internal(format!("wait failed: {e}")))?;
    // Pick up anything the readers buffered before they stopped.
    while let Ok(line) = rx.try_recv() {
        match line {
            ChildLine::Stdout(text) => {
                let masked = logger.stdout(&format!("{text}\n")).await;
                append_capped(&mut captured_out, &masked);
            }
            ChildLine::Stderr(text) => {
                let masked = logger.stderr(&format!("{text}\n")).await;
                append_capped(&mut captured_err, &masked);
            }
        }
    }
    let exit_code = if timed_out || cancelled {
        -1
    } else {
        status.code().unwrap_or(-1)
    };

    let (out_tail, err_tail) = logger.finish().await;
    append_capped(&mut captured_out, &out_tail);
    append_capped(&mut captured_err, &err_tail);

    let duration_ms = started.elapsed().as_millis() as u64;
    let error = if cancelled {
        Some(StepErrorTag::Cancelled)
    } else if timed_out {
        Some(StepErrorTag::TimedOut)
    } else if exit_code == EXIT_TOOL_NOT_FOUND {
        Some(StepErrorTag::ToolNotFound)
    } else {
        None
    };

    Ok(StepOutcome {
        exit_code,
        stdout: captured_out,
        stderr: captured_err,
        duration_ms,
        timed_out,
        error,
    })
}

pub(crate) fn append_capped(buffer: &mut String, text: &str) {
    buffer.push_str(text);
    if buffer.len() > CAPTURE_LIMIT {
        let start = buffer.len() - CAPTURE_LIMIT;
        let boundary = (start..buffer.len())
            .find(|&i| buffer.is_char_boundary(i))
            .unwrap_or(start);
        buffer.drain(..boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::event::{EventSink, NewBuildEvent};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<NewBuildEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, _build_id: ResourceId, event: NewBuildEvent) {
            self.events.lock().await.push(event);
        }
    }

    fn ctx(sink: Arc<RecordingSink>, masks: Vec<String>) -> BuildContext {
        BuildContext {
            build_id: ResourceId::new(),
            job_id: ResourceId::new(),
            job_name: "test".to_string(),
            build_number: 1,
            org_id: None,
            workspace: std::env::temp_dir(),
            branch: "main".to_string(),
            parameters: HashMap::new(),
            environment: HashMap::new(),
            secrets: HashMap::new(),
            mask_values: masks,
            current_stage: None,
            cancel: CancellationToken::new(),
            events: sink,
        }
    }

    fn step(command: &str) -> StepDef {
        StepDef {
            name: "step".to_string(),
            kind: StepKind::Shell,
            command: command.to_string(),
            image: None,
            pull_policy: None,
            environment: HashMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn echo_succeeds_and_captures_output() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink.clone(), vec![]);
        let outcome = ShellExecutor::new()
            .execute(&ctx, &step("echo hello"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.success());
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_outcome() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink, vec![]);
        let outcome = ShellExecutor::new()
            .execute(&ctx, &step("exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn exit_127_tagged_tool_not_found() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink, vec![]);
        let outcome = ShellExecutor::new()
            .execute(
                &ctx,
                &step("definitely-not-a-real-tool-xyz"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, EXIT_TOOL_NOT_FOUND);
        assert_eq!(outcome.error, Some(StepErrorTag::ToolNotFound));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink, vec![]);
        let mut s = step("sleep 30");
        s.timeout_secs = Some(1);
        let started = Instant::now();
        let outcome = ShellExecutor::new()
            .execute(&ctx, &s, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.error, Some(StepErrorTag::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_step() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink, vec![]);
        ctx.cancel.cancel();
        let outcome = ShellExecutor::new()
            .execute(&ctx, &step("sleep 30"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome.error, Some(StepErrorTag::Cancelled));
    }

    #[tokio::test]
    async fn secrets_are_masked_in_events_and_capture() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink.clone(), vec!["hunter2".to_string()]);
        let outcome = ShellExecutor::new()
            .execute(&ctx, &step("echo the password is hunter2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!outcome.stdout.contains("hunter2"));
        assert!(outcome.stdout.contains("***"));
        for event in sink.events.lock().await.iter() {
            let text = event.payload.to_string();
            assert!(!text.contains("hunter2"), "event leaked secret: {text}");
        }
    }

    #[tokio::test]
    async fn step_env_reaches_the_child() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx(sink, vec![]);
        let mut s = step("echo value=$MY_FLAG");
        s.environment
            .insert("MY_FLAG".to_string(), "on".to_string());
        let outcome = ShellExecutor::new()
            .execute(&ctx, &s, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.stdout.contains("value=on"));
    }
}
