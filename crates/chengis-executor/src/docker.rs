//! Docker step executor.
//!
//! Runs the step command inside a container with the build workspace mounted
//! at `/workspace`. Consults the image policy before anything is pulled; a
//! denial short-circuits with a `policy-denied` outcome.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use chengis_core::context::BuildContext;
use chengis_core::executor::{StepErrorTag, StepExecutor, StepOutcome};
use chengis_core::pipeline::{PullPolicy, StepDef, StepKind};
use chengis_core::policy::ImagePolicy;
use chengis_core::{Error, ResourceId, Result};

const WORKSPACE_MOUNT: &str = "/workspace";

pub struct DockerStepExecutor {
    docker: Docker,
    image_policy: Arc<dyn ImagePolicy>,
}

impl DockerStepExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(image_policy: Arc<dyn ImagePolicy>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            docker,
            image_policy,
        })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, image_policy: Arc<dyn ImagePolicy>) -> Self {
        Self {
            docker,
            image_policy,
        }
    }

    fn container_name(build_id: &ResourceId, step: &str) -> String {
        let step_slug: String = step
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("chengis-step-{build_id}-{step_slug}")
    }

    async fn ensure_image(&self, image: &str, pull_policy: PullPolicy) -> Result<()> {
        if pull_policy == PullPolicy::IfNotPresent
            && self.docker.inspect_image(image).await.is_ok()
        {
            return Ok(());
        }
        debug!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull.next().await {
            if let Err(e) = result {
                return Err(Error::ExecutionFailed(format!(
                    "failed to pull {image}: {e}"
                )));
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            warn!(container = %name, error = %e, "container cleanup failed");
        }
    }
}

#[async_trait]
impl StepExecutor for DockerStepExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Docker
    }

    async fn execute(
        &self,
        ctx: &BuildContext,
        step: &StepDef,
        default_timeout: Duration,
    ) -> Result<StepOutcome> {
        if ctx.is_cancelled() {
            return Ok(StepOutcome::failed(StepErrorTag::Cancelled, "cancelled"));
        }

        let Some(image) = step.image.as_deref() else {
            return Ok(StepOutcome::failed(
                StepErrorTag::Spawn,
                format!("docker step {:?} has no image", step.name),
            ));
        };

        let decision = self.image_policy.allow_image(ctx.org_id, image).await;
        if decision.is_blocking() {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("image {image:?} denied"));
            return Ok(StepOutcome::failed(StepErrorTag::PolicyDenied, reason));
        }

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        let pull_policy = step.pull_policy.unwrap_or_default();
        if let Err(e) = self.ensure_image(image, pull_policy).await {
            return Ok(StepOutcome::failed(StepErrorTag::Spawn, e.to_string()));
        }

        let env: Vec<String> = ctx
            .step_environment(&Default::default(), step)
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                ctx.workspace.display(),
                WORKSPACE_MOUNT
            )]),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                step.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = Self::container_name(&ctx.build_id, &step.name);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        debug!(container = %container_name, image = %image, "creating step container");
        if let Err(e) = self
            .docker
            .create_container(Some(create_options), config)
            .await
        {
            return Ok(StepOutcome::failed(
                StepErrorTag::Spawn,
                format!("failed to create container: {e}"),
            ));
        }

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&container_name).await;
            return Ok(StepOutcome::failed(
                StepErrorTag::Spawn,
                format!("failed to start container: {e}"),
            ));
        }

        let started = Instant::now();
        let mut logger = ctx.step_logger(&step.name);
        let mut captured_out = String::new();
        let mut captured_err = String::new();

        let log_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(&container_name, Some(log_options));
        let mut wait = self
            .docker
            .wait_container(&container_name, Some(WaitContainerOptions { condition: "not-running" }));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let mut cancelled = false;
        let mut exit_code: Option<i32> = None;

        // The follow-mode log stream ends when the container exits.
        loop {
            tokio::select! {
                entry = logs.next() => {
                    match entry {
                        Some(Ok(LogOutput::StdOut { message }))
                        | Some(Ok(LogOutput::Console { message })) => {
                            let text = String::from_utf8_lossy(&message).to_string();
                            let masked = logger.stdout(&text).await;
                            crate::shell::append_capped(&mut captured_out, &masked);
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            let text = String::from_utf8_lossy(&message).to_string();
                            let masked = logger.stderr(&text).await;
                            crate::shell::append_capped(&mut captured_err, &masked);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "log stream error");
                        }
                        None => break,
                    }
                }
                result = wait.next(), if exit_code.is_none() => {
                    match result {
                        Some(Ok(response)) => exit_code = Some(response.status_code as i32),
                        Some(Err(e)) => {
                            warn!(error = %e, "wait error");
                            exit_code = Some(-1);
                        }
                        None => exit_code = Some(-1),
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
            let _ = self.docker.stop_container(&container_name, None).await;
        } else if exit_code.is_none() {
            // Logs closed before the wait response arrived.
            if let Ok(Some(Ok(response))) =
                tokio::time::timeout(Duration::from_secs(5), wait.next()).await
            {
                exit_code = Some(response.status_code as i32);
            }
        }

        let (out_tail, err_tail) = logger.finish().await;
        crate::shell::append_capped(&mut captured_out, &out_tail);
        crate::shell::append_capped(&mut captured_err, &err_tail);

        self.remove_container(&container_name).await;

        let error = if cancelled {
            Some(StepErrorTag::Cancelled)
        } else if timed_out {
            Some(StepErrorTag::TimedOut)
        } else if exit_code == Some(127) {
            Some(StepErrorTag::ToolNotFound)
        } else {
            None
        };

        Ok(StepOutcome {
            exit_code: exit_code.unwrap_or(-1),
            stdout: captured_out,
            stderr: captured_err,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
            error,
        })
    }
}


/// Integration tests that require a Docker daemon.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use chengis_core::event::NullEventSink;
    use chengis_core::policy::PermissivePolicy;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn ctx(workspace: std::path::PathBuf) -> BuildContext {
        BuildContext {
            build_id: ResourceId::new(),
            job_id: ResourceId::new(),
            job_name: "it".to_string(),
            build_number: 1,
            org_id: None,
            workspace,
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

    #[tokio::test]
    #[ignore]
    async fn runs_a_container_step() {
        let executor = DockerStepExecutor::new(Arc::new(PermissivePolicy)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_path_buf());
        let step = StepDef {
            name: "hello".to_string(),
            kind: StepKind::Docker,
            command: "echo hi from container".to_string(),
            image: Some("alpine:latest".to_string()),
            pull_policy: None,
            environment: HashMap::new(),
            working_dir: None,
            timeout_secs: Some(120),
        };
        let outcome = executor
            .execute(&ctx, &step, Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hi from container"));
    }
}
