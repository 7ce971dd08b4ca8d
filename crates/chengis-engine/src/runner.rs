//! Build runner: the lifecycle around one build attempt.
//!
//! Owns the workspace, source checkout, pipeline-as-code resolution, secret
//! hydration, the pipeline executor invocation, artifact collection,
//! notification, and cleanup. The runner exclusively owns the in-memory
//! build context for the attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_core::artifact::ArtifactStore;
use chengis_core::build::{Build, BuildResult, BuildStatus, Job};
use chengis_core::context::BuildContext;
use chengis_core::event::{BuildEventKind, NewBuildEvent};
use chengis_core::notify::{BuildSummary, Notifier};
use chengis_core::pipeline::Pipeline;
use chengis_core::scm::{CheckoutSpec, ScmProvider};
use chengis_core::secret::{SecretBackend, mask_values};
use chengis_core::{Error, Result};
use chengis_db::BuildRepo;

use crate::artifact::collect_artifacts;
use crate::bus::EventBus;
use crate::pipeline::PipelineExecutor;
use crate::scm::GitScm;

pub struct BuildRunner {
    builds: Arc<dyn BuildRepo>,
    bus: Arc<EventBus>,
    executor: Arc<PipelineExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Option<Arc<dyn SecretBackend>>,
    scm: Arc<dyn ScmProvider>,
    notifiers: Vec<Arc<dyn Notifier>>,
    workspace_root: PathBuf,
    retain_on_failure: bool,
}

impl BuildRunner {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        bus: Arc<EventBus>,
        executor: Arc<PipelineExecutor>,
        artifacts: Arc<dyn ArtifactStore>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            builds,
            bus,
            executor,
            artifacts,
            secrets: None,
            scm: Arc::new(GitScm::new()),
            notifiers: vec![Arc::new(crate::notify::LogNotifier)],
            workspace_root: workspace_root.into(),
            retain_on_failure: false,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretBackend>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_scm(mut self, scm: Arc<dyn ScmProvider>) -> Self {
        self.scm = scm;
        self
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn with_retain_on_failure(mut self, retain: bool) -> Self {
        self.retain_on_failure = retain;
        self
    }

    /// Run one build attempt to completion. Internal failures become a
    /// failed build with a generic reason; they never escape as errors.
    pub async fn run(&self, build: &Build, job: &Job, cancel: CancellationToken) -> BuildResult {
        let started = Instant::now();
        if let Err(e) = self.builds.set_build_started(build.id).await {
            warn!(build_id = %build.id, error = %e, "failed to record build start");
        }
        self.bus
            .publish(
                build.id,
                NewBuildEvent::new(BuildEventKind::BuildStarted).payload(serde_json::json!({
                    "job": job.name,
                    "number": build.number,
                    "trigger": build.trigger,
                    "attempt": build.attempt_number,
                })),
            )
            .await;

        let result = match self.run_inner(build, job, cancel).await {
            Ok(result) => result,
            Err(Error::Cancelled) => BuildResult {
                status: BuildStatus::Aborted,
                stages: Vec::new(),
                failure_reason: Some("cancelled".to_string()),
                failed_stage: None,
            },
            Err(Error::Validation(reason)) => BuildResult {
                status: BuildStatus::Failure,
                stages: Vec::new(),
                failure_reason: Some(reason),
                failed_stage: None,
            },
            Err(e) => {
                // Log the detail, leak only a generic message.
                error!(build_id = %build.id, error = %e, "build runner failure");
                BuildResult {
                    status: BuildStatus::Failure,
                    stages: Vec::new(),
                    failure_reason: Some("internal error".to_string()),
                    failed_stage: None,
                }
            }
        };

        if let Err(e) = self
            .builds
            .complete_build(
                build.id,
                result.status,
                result.failure_reason.as_deref(),
                result.failed_stage.as_deref(),
            )
            .await
        {
            warn!(build_id = %build.id, error = %e, "failed to record build completion");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.bus
            .publish(
                build.id,
                NewBuildEvent::new(BuildEventKind::BuildCompleted).payload(serde_json::json!({
                    "status": result.status,
                    "duration_ms": duration_ms,
                    "failed_stage": result.failed_stage,
                    "reason": result.failure_reason,
                })),
            )
            .await;

        let summary = BuildSummary {
            build_id: build.id,
            job_name: job.name.clone(),
            build_number: build.number,
            status: result.status,
            duration_ms,
            failed_stage: result.failed_stage.clone(),
        };
        for notifier in &self.notifiers {
            notifier.notify(&summary).await;
        }

        self.bus.forget(build.id).await;
        result
    }

    async fn run_inner(
        &self,
        build: &Build,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<BuildResult> {
        let workspace = self.workspace_root.join(build.id.to_string());
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| Error::Storage(format!("workspace setup failed: {e}")))?;

        // SCM checkout when the job points at a repository.
        let mut environment = job.pipeline.environment.clone();
        if let Some(repo_url) = &job.repo_url {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let spec = CheckoutSpec {
                repo_url: repo_url.clone(),
                branch: Some(build.branch.clone()),
                sha: None,
                depth: Some(1),
            };
            let commit = self.scm.checkout(&spec, &workspace).await?;
            environment.insert("GIT_COMMIT".to_string(), commit.sha.clone());
            environment.insert("GIT_SHORT_COMMIT".to_string(), commit.short_sha.clone());
            environment.insert("GIT_AUTHOR".to_string(), commit.author.clone());
            info!(build_id = %build.id, sha = %commit.short_sha, "source checked out");
        }

        // Pipeline-as-code beats the server-stored definition.
        let pipeline = self.resolve_pipeline(&workspace, job)?;

        // Secret hydration; the mask set is values, never keys.
        let secrets = match &self.secrets {
            Some(backend) => backend.resolve(build.org_id, job.id).await?,
            None => HashMap::new(),
        };
        let masks = mask_values(&secrets);

        let ctx = BuildContext {
            build_id: build.id,
            job_id: job.id,
            job_name: job.name.clone(),
            build_number: build.number,
            org_id: build.org_id,
            workspace: workspace.clone(),
            branch: build.branch.clone(),
            parameters: build.parameters.clone(),
            environment,
            secrets,
            mask_values: masks,
            current_stage: None,
            cancel,
            events: self.bus.clone(),
        };

        let result = self.executor.execute(&ctx, &pipeline).await;

        if !pipeline.artifacts.is_empty() && result.status != BuildStatus::Aborted {
            collect_artifacts(&self.artifacts, build.id, &workspace, &pipeline.artifacts).await;
        }

        self.cleanup_workspace(&workspace, result.status).await;
        Ok(result)
    }

    fn resolve_pipeline(&self, workspace: &std::path::Path, job: &Job) -> Result<Pipeline> {
        if let Some(path) = chengis_config::pipeline::discover(workspace) {
            let pipeline = chengis_config::pipeline::parse_file(&path)
                .map_err(|e| Error::Validation(e.to_string()))?;
            info!(job = %job.name, file = %path.display(), "using pipeline-as-code definition");
            return Ok(pipeline);
        }
        chengis_config::pipeline::validate(&job.pipeline)
            .map_err(|e| Error::Validation(e.to_string()))?;
        Ok(job.pipeline.clone())
    }

    async fn cleanup_workspace(&self, workspace: &std::path::Path, status: BuildStatus) {
        let keep = self.retain_on_failure && status == BuildStatus::Failure;
        if keep {
            info!(workspace = %workspace.display(), "retaining failed build workspace");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            warn!(workspace = %workspace.display(), error = %e, "workspace cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalManager;
    use crate::artifact::LocalArtifactStore;
    use chengis_core::ResourceId;
    use chengis_core::build::TriggerKind;
    use chengis_core::pipeline::{Stage, StepDef, StepKind};
    use chengis_core::policy::PermissivePolicy;
    use chengis_db::memory::MemoryStore;
    use chengis_executor::ExecutorRegistry;
    use std::collections::BTreeSet;

    struct Harness {
        runner: BuildRunner,
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        _workspaces: tempfile::TempDir,
        _artifacts: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(ExecutorRegistry::builtin(Arc::new(PermissivePolicy)));
        let approvals = Arc::new(ApprovalManager::new(store.clone()));
        let executor = Arc::new(PipelineExecutor::new(
            registry,
            Arc::new(PermissivePolicy),
            approvals,
            25,
        ));
        let workspaces = tempfile::tempdir().unwrap();
        let artifacts_dir = tempfile::tempdir().unwrap();
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(artifacts_dir.path()));
        let runner = BuildRunner::new(
            store.clone(),
            bus.clone(),
            executor,
            artifacts,
            workspaces.path(),
        );
        Harness {
            runner,
            store,
            bus,
            _workspaces: workspaces,
            _artifacts: artifacts_dir,
        }
    }

    fn job_with_pipeline(pipeline: Pipeline) -> Job {
        Job {
            id: ResourceId::new(),
            name: "svc".to_string(),
            display_name: "Service".to_string(),
            pipeline,
            required_labels: BTreeSet::new(),
            parameters: HashMap::new(),
            default_branch: "main".to_string(),
            org_id: None,
            repo_url: None,
        }
    }

    fn echo_pipeline() -> Pipeline {
        Pipeline {
            name: "svc".to_string(),
            stages: vec![Stage {
                name: "build".to_string(),
                steps: vec![StepDef {
                    name: "hello".to_string(),
                    kind: StepKind::Shell,
                    command: "echo hello".to_string(),
                    image: None,
                    pull_policy: None,
                    environment: HashMap::new(),
                    working_dir: None,
                    timeout_secs: None,
                }],
                parallel: false,
                container: None,
                when: None,
                approval: None,
                post: Default::default(),
                environment: HashMap::new(),
            }],
            ..Default::default()
        }
    }

    async fn make_build(store: &MemoryStore, job: &Job) -> Build {
        let number = store.next_build_number(job.id).await.unwrap();
        let build = Build::new(job, number, TriggerKind::Manual, "main".to_string());
        store.create_build(&build).await.unwrap();
        build
    }

    #[tokio::test]
    async fn runs_a_build_end_to_end() {
        let h = harness();
        let job = job_with_pipeline(echo_pipeline());
        let build = make_build(&h.store, &job).await;

        let result = h.runner.run(&build, &job, CancellationToken::new()).await;
        assert_eq!(result.status, BuildStatus::Success);

        let stored = h.store.get_build(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Success);
        assert!(stored.completed_at.is_some());

        let events = h.bus.replay(build.id, 0, 1000).await.unwrap();
        assert_eq!(events.first().unwrap().kind, BuildEventKind::BuildStarted);
        assert_eq!(
            events.last().unwrap().kind,
            BuildEventKind::BuildCompleted
        );
    }

    #[tokio::test]
    async fn invalid_stored_pipeline_fails_before_steps() {
        let h = harness();
        let job = job_with_pipeline(Pipeline {
            name: "svc".to_string(),
            stages: Vec::new(),
            ..Default::default()
        });
        let build = make_build(&h.store, &job).await;

        let result = h.runner.run(&build, &job, CancellationToken::new()).await;
        assert_eq!(result.status, BuildStatus::Failure);
        assert!(result.stages.is_empty());
        assert!(result.failure_reason.unwrap().contains("no stages"));
    }

    #[tokio::test]
    async fn cancelled_build_completes_as_aborted() {
        let h = harness();
        let job = job_with_pipeline(echo_pipeline());
        let build = make_build(&h.store, &job).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.runner.run(&build, &job, cancel).await;
        assert_eq!(result.status, BuildStatus::Aborted);

        let events = h.bus.replay(build.id, 0, 1000).await.unwrap();
        assert!(events.iter().any(|e| e.kind == BuildEventKind::Cancelled));
        assert!(events.iter().any(|e| e.kind == BuildEventKind::BuildCompleted));
    }

    #[tokio::test]
    async fn pipeline_as_code_overrides_server_pipeline() {
        // The stored pipeline echoes "server"; the workspace pipeline echoes
        // a marker we can find in the event log.
        let h = harness();
        let mut job = job_with_pipeline(echo_pipeline());
        job.repo_url = None;

        // Plant the workspace file where the runner will create the dir.
        let build = make_build(&h.store, &job).await;
        let workspace = h._workspaces.path().join(build.id.to_string());
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(
            workspace.join("chengis.json"),
            r#"{
                "name": "svc",
                "stages": [
                    {"name": "from-code", "steps": [{"name": "mark", "command": "echo from-pipeline-file"}]}
                ]
            }"#,
        )
        .unwrap();

        let result = h.runner.run(&build, &job, CancellationToken::new()).await;
        assert_eq!(result.status, BuildStatus::Success);
        assert_eq!(result.stages[0].name, "from-code");
    }

    #[tokio::test]
    async fn secrets_are_resolved_and_masked() {
        use chengis_core::secret::SecretScope;
        use chengis_db::LocalSecretBackend;

        let h = harness();
        let key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
        let backend = Arc::new(LocalSecretBackend::new(h.store.clone(), key).unwrap());
        backend
            .put(None, SecretScope::Global, "DEPLOY_TOKEN", "hunter2")
            .await
            .unwrap();

        let mut pipeline = echo_pipeline();
        pipeline.stages[0].steps[0].command = "echo token is $DEPLOY_TOKEN".to_string();
        let job = job_with_pipeline(pipeline);
        let build = make_build(&h.store, &job).await;

        let runner = h.runner.with_secrets(backend);
        let result = runner.run(&build, &job, CancellationToken::new()).await;
        assert_eq!(result.status, BuildStatus::Success);

        // No event anywhere contains the plaintext.
        let events = h.bus.replay(build.id, 0, 1000).await.unwrap();
        for event in &events {
            assert!(
                !event.payload.to_string().contains("hunter2"),
                "secret leaked in {:?}",
                event.kind
            );
        }
        let log = events
            .iter()
            .find(|e| e.kind == BuildEventKind::StepLog)
            .unwrap();
        assert!(log.payload["text"].as_str().unwrap().contains("***"));
    }

    #[tokio::test]
    async fn artifacts_collected_on_success() {
        let h = harness();
        let mut pipeline = echo_pipeline();
        pipeline.stages[0].steps[0].command = "echo data > out.bin".to_string();
        pipeline.artifacts = vec!["*.bin".to_string()];
        let job = job_with_pipeline(pipeline);
        let build = make_build(&h.store, &job).await;

        let artifacts_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(artifacts_dir.path()));
        let runner = BuildRunner {
            artifacts: store.clone(),
            ..h.runner
        };

        let result = runner.run(&build, &job, CancellationToken::new()).await;
        assert_eq!(result.status, BuildStatus::Success);
        let stored = store.list(build.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].path, "out.bin");
    }
}
