//! Stage graph execution.
//!
//! [`PipelineExecutor::run`] walks the stages strictly in order. Each stage
//! runs its operations (sequentially, or all at once when marked parallel),
//! then its post-actions, before the next stage starts. The first failing
//! non-best-effort stage halts the sequence: later stages are recorded as
//! skipped and the outcome becomes FAILURE. An abort observed at any point
//! ends the run as ABORTED. Hooks run once the sequence has concluded.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::config::{self, ConfigError, PipelineConfig};
use crate::credentials::{CredentialBinding, CredentialScope, CredentialStore};
use crate::error::GantryError;
use crate::gate::{AnalysisServer, CommandAnalysisServer, QualityGateResult, QualityGateWaiter};
use crate::hooks::{CommandHook, HookCondition, HookRunner};
use crate::notify::{CommandTransport, LogTransport, NotificationDispatcher, NotificationTransport};
use crate::obs;
use crate::outcome::{Outcome, RunState, StageStatus};
use crate::report::{PipelineReport, PostActionRecord, StageRecord};
use crate::runner::{ArtifactRef, CommandExecutor, Invocation, OperationResult, OperationStatus};
use crate::stage::{CommandSpec, Operation, OperationKind, Stage};
use crate::versioner::{
    Artifact, ArtifactRegistry, ArtifactVersioner, CommandRegistry, TagScheme, TaggedArtifact,
    VersionLedger,
};

/// Deadline for a quality gate whose operation declares no timeout.
pub const DEFAULT_GATE_DEADLINE: Duration = Duration::from_secs(300);

/// A validated pipeline: configuration plus ordered stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate and build. Fails on any dangling reference.
    pub fn new(config: PipelineConfig, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        config::validate(&config, &stages)?;
        Ok(Self { config, stages })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

/// External systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn CommandExecutor>,
    pub credentials: Arc<dyn CredentialStore>,
    pub analysis: Option<Arc<dyn AnalysisServer>>,
    pub registry: Option<Arc<dyn ArtifactRegistry>>,
    /// Numeric tags claimed so far in this pipeline's lineage.
    pub versions: Arc<VersionLedger>,
}

impl Collaborators {
    pub fn new(executor: Arc<dyn CommandExecutor>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            executor,
            credentials,
            analysis: None,
            registry: None,
            versions: Arc::new(VersionLedger::new("default")),
        }
    }

    /// Command-backed analysis server and registry, as configured.
    pub fn from_config(
        config: &PipelineConfig,
        executor: Arc<dyn CommandExecutor>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let mut collaborators = Self::new(Arc::clone(&executor), credentials)
            .with_versions(Arc::new(VersionLedger::new(config.name.clone())));

        if let Some(analysis) = &config.analysis {
            if let (Some(submit), Some(query)) = (
                CommandSpec::from_argv(&analysis.submit),
                CommandSpec::from_argv(&analysis.query),
            ) {
                collaborators = collaborators.with_analysis(Arc::new(CommandAnalysisServer::new(
                    Arc::clone(&executor),
                    submit,
                    query,
                    seconds(analysis.command_timeout_secs),
                )));
            }
        }
        if let Some(registry) = &config.registry {
            if let Some(push) = CommandSpec::from_argv(&registry.push) {
                collaborators = collaborators.with_registry(Arc::new(CommandRegistry::new(
                    Arc::clone(&executor),
                    registry.repository.clone(),
                    push,
                    seconds(registry.timeout_secs),
                )));
            }
        }
        collaborators
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisServer>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ArtifactRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_versions(mut self, versions: Arc<VersionLedger>) -> Self {
        self.versions = versions;
        self
    }
}

/// Hooks declared in the configuration plus the notification dispatcher.
///
/// The dispatcher is registered as an ALWAYS hook after the command hooks, so
/// it reports on a run whose cleanup has already happened.
pub fn configured_hooks(config: &PipelineConfig, executor: Arc<dyn CommandExecutor>) -> HookRunner {
    let mut hooks = HookRunner::new();
    for definition in &config.hooks {
        if let Some(command) = CommandSpec::from_argv(&definition.command) {
            hooks = hooks.with_hook(
                definition.condition,
                Arc::new(CommandHook::new(
                    definition.name.clone(),
                    command,
                    Arc::clone(&executor),
                    seconds(definition.timeout_secs),
                )),
            );
        }
    }
    if let Some(notification) = &config.notification {
        let transport: Arc<dyn NotificationTransport> =
            match notification.command.as_deref().and_then(CommandSpec::from_argv) {
                Some(command) => Arc::new(CommandTransport::new(
                    executor,
                    command,
                    Some(Duration::from_secs(60)),
                )),
                None => Arc::new(LogTransport),
            };
        hooks = hooks.with_hook(
            HookCondition::Always,
            Arc::new(NotificationDispatcher::new(notification.clone(), transport)),
        );
    }
    hooks
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Structured outputs accumulated while the run progresses.
#[derive(Debug, Default)]
struct RunContext {
    built: HashMap<String, Artifact>,
    gate: Option<QualityGateResult>,
    published: Vec<TaggedArtifact>,
}

impl RunContext {
    fn absorb(&mut self, result: &OperationResult) {
        match &result.artifact {
            Some(ArtifactRef::Built { artifact }) if result.passed() => {
                self.built.insert(artifact.name.clone(), artifact.clone());
            }
            Some(ArtifactRef::Gate { result }) => self.gate = Some(result.clone()),
            Some(ArtifactRef::Published { artifact, .. }) => self.published.push(artifact.clone()),
            _ => {}
        }
    }
}

/// Per-run helpers shared by every operation.
struct RunScope<'a> {
    credentials: CredentialScope,
    versioner: ArtifactVersioner,
    abort: &'a AbortSignal,
}

/// Drives one pipeline run from PENDING to a terminal outcome.
pub struct PipelineExecutor {
    pipeline: Pipeline,
    collaborators: Collaborators,
    hooks: HookRunner,
    waiter: QualityGateWaiter,
}

impl PipelineExecutor {
    pub fn new(pipeline: Pipeline, collaborators: Collaborators) -> Self {
        let waiter = QualityGateWaiter::new(pipeline.config.poll_interval());
        Self {
            pipeline,
            collaborators,
            hooks: HookRunner::new(),
            waiter,
        }
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.waiter = QualityGateWaiter::new(interval);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Execute the pipeline once. Never fails: every problem is recorded in
    /// the returned report.
    pub async fn run(&self, abort: AbortSignal) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let config = &self.pipeline.config;
        let span = obs::run_span(&run_id.to_string(), &config.name, config.build_number);
        self.execute(run_id, abort).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, abort: AbortSignal) -> PipelineReport {
        let config = &self.pipeline.config;
        let started_at = Utc::now();
        let start = Instant::now();

        let mut state = RunState::new();
        let mut context = RunContext::default();
        let scope = RunScope {
            credentials: CredentialScope::new(Arc::clone(&self.collaborators.credentials)),
            versioner: ArtifactVersioner::new(
                config.build_number,
                run_id,
                Arc::clone(&self.collaborators.versions),
            ),
            abort: &abort,
        };

        obs::emit_run_started(&config.name, config.build_number, self.pipeline.stages.len());
        if abort.is_aborted() {
            obs::emit_abort_observed(None);
            state.transition(Outcome::Aborted);
        } else {
            state.transition(Outcome::Running);
        }

        let mut stages = Vec::with_capacity(self.pipeline.stages.len());
        for (position, stage) in self.pipeline.stages.iter().enumerate() {
            if !state.outcome().is_terminal() && abort.is_aborted() {
                obs::emit_abort_observed(None);
                state.transition(Outcome::Aborted);
            }
            if state.outcome().is_terminal() {
                let mut record = StageRecord::skipped(&stage.name, position, stage.best_effort);
                record.post_actions = self
                    .run_post_actions(stage, StageStatus::Skipped, &mut context, &scope)
                    .await;
                stages.push(record);
                continue;
            }

            let record = self.run_stage(position, stage, &mut context, &scope).await;
            match record.status {
                StageStatus::Aborted => {
                    state.transition(Outcome::Aborted);
                }
                StageStatus::Failure if !stage.best_effort => {
                    state.transition(Outcome::Failure);
                }
                _ => {}
            }
            stages.push(record);
        }
        if state.outcome() == Outcome::Running {
            state.transition(Outcome::Success);
        }

        let mut report = PipelineReport {
            run_id,
            pipeline: config.name.clone(),
            build_number: config.build_number,
            outcome: state.outcome(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            stages,
            gate: context.gate,
            artifacts: context.published,
            hooks: Vec::new(),
        };

        report.hooks = self.hooks.finalize(&report).await;
        obs::emit_run_finished(
            report.outcome,
            report.duration_ms,
            report.deciding_stage().map(|s| s.name.as_str()),
        );
        report
    }

    async fn run_stage(
        &self,
        position: usize,
        stage: &Stage,
        context: &mut RunContext,
        scope: &RunScope<'_>,
    ) -> StageRecord {
        obs::emit_stage_started(&stage.name, position);
        let start = Instant::now();
        let mut interrupted = false;

        let operations = if stage.parallel {
            let shared: &RunContext = context;
            let results = join_all(
                stage
                    .operations
                    .iter()
                    .map(|op| self.run_operation(op, shared, scope, scope.abort)),
            )
            .await;
            for result in &results {
                context.absorb(result);
            }
            results
        } else {
            let mut results = Vec::with_capacity(stage.operations.len());
            for op in &stage.operations {
                if scope.abort.is_aborted() {
                    obs::emit_abort_observed(Some(&stage.name));
                    interrupted = true;
                    break;
                }
                let result = self.run_operation(op, context, scope, scope.abort).await;
                context.absorb(&result);
                let passed = result.passed();
                results.push(result);
                if !passed {
                    break;
                }
            }
            results
        };
        for result in &operations {
            obs::emit_operation_finished(&stage.name, result);
        }

        let aborted = interrupted
            || operations
                .iter()
                .any(|op| op.status == OperationStatus::Aborted);
        let (status, failure) = if aborted {
            (StageStatus::Aborted, Some("aborted by operator".to_string()))
        } else if let Some(failed) = operations.iter().find(|op| !op.passed()) {
            let reason = failed.error.as_deref().unwrap_or("failed");
            (
                StageStatus::Failure,
                Some(format!("operation '{}': {}", failed.operation, reason)),
            )
        } else {
            (StageStatus::Success, None)
        };

        let post_actions = self.run_post_actions(stage, status, context, scope).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_stage_finished(&stage.name, status, duration_ms);
        StageRecord {
            name: stage.name.clone(),
            position,
            status,
            best_effort: stage.best_effort,
            operations,
            post_actions,
            failure,
            duration_ms,
        }
    }

    /// Run the post-actions of `stage` whose condition matches `status`.
    /// They run to completion even after an abort.
    async fn run_post_actions(
        &self,
        stage: &Stage,
        status: StageStatus,
        context: &mut RunContext,
        scope: &RunScope<'_>,
    ) -> Vec<PostActionRecord> {
        let never = AbortSignal::never();
        let mut records = Vec::new();
        for post in stage.post.iter().filter(|p| p.condition.matches(status)) {
            let result = self
                .run_operation(&post.operation, context, scope, &never)
                .await;
            context.absorb(&result);
            obs::emit_operation_finished(&stage.name, &result);
            records.push(PostActionRecord {
                condition: post.condition,
                result,
            });
        }
        records
    }

    /// Run one operation inside its credential scope. Credentials are
    /// resolved before anything external happens; a resolution failure is the
    /// operation's failure.
    async fn run_operation(
        &self,
        op: &Operation,
        context: &RunContext,
        scope: &RunScope<'_>,
        abort: &AbortSignal,
    ) -> OperationResult {
        let start = Instant::now();
        let outcome = scope
            .credentials
            .with_credentials(&op.credentials, |bindings| async move {
                Ok::<_, GantryError>(self.dispatch(op, context, scope, &bindings, abort).await)
            })
            .await;
        match outcome {
            Ok(result) => result,
            Err(e) => OperationResult::from_error(&op.name, &e, start.elapsed()),
        }
    }

    async fn dispatch(
        &self,
        op: &Operation,
        context: &RunContext,
        scope: &RunScope<'_>,
        bindings: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> OperationResult {
        match &op.kind {
            OperationKind::Command(command) => {
                self.collaborators
                    .executor
                    .execute(Invocation {
                        operation: &op.name,
                        command,
                        timeout: op.timeout(),
                        credentials: bindings,
                        abort,
                    })
                    .await
            }
            OperationKind::QualityGate {
                source_ref,
                project_key,
                ..
            } => {
                self.evaluate_gate(op, source_ref, project_key, bindings, abort)
                    .await
            }
            OperationKind::Publish { artifact, scheme, .. } => {
                self.publish(op, artifact, *scheme, context, scope, bindings, abort)
                    .await
            }
        }
    }

    async fn evaluate_gate(
        &self,
        op: &Operation,
        source_ref: &str,
        project_key: &str,
        bindings: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> OperationResult {
        let start = Instant::now();
        let Some(server) = &self.collaborators.analysis else {
            let err = GantryError::MissingCollaborator("analysis server");
            return OperationResult::from_error(&op.name, &err, start.elapsed());
        };
        // Submission and polling share one deadline.
        let deadline = op.timeout().unwrap_or(DEFAULT_GATE_DEADLINE);
        let waiter = &self.waiter;
        let (evaluated, expired) = abort
            .bounded(Some(deadline), |stop| async move {
                let correlation_id = server
                    .submit(source_ref, project_key, bindings, &stop)
                    .await?;
                let remaining = deadline.saturating_sub(start.elapsed());
                Ok::<_, GantryError>(
                    waiter
                        .await_verdict(
                            server.as_ref(),
                            &correlation_id,
                            remaining,
                            bindings,
                            &stop,
                        )
                        .await,
                )
            })
            .await;

        if abort.is_aborted() {
            let err = GantryError::AbortRequested;
            return OperationResult::from_error(&op.name, &err, start.elapsed());
        }
        if expired && evaluated.is_err() {
            return OperationResult::timed_out(&op.name, deadline, start.elapsed());
        }

        match evaluated {
            Ok(gate) => {
                let passed = self.pipeline.config.warn_policy().accepts(gate.verdict);
                obs::emit_gate_evaluated(
                    gate.correlation_id.as_str(),
                    gate.verdict,
                    passed,
                    gate.polls,
                );
                let summary = format!("quality gate {} ({})", gate.verdict, gate.correlation_id);
                let result = if passed {
                    OperationResult::succeeded(&op.name, start.elapsed())
                } else {
                    let err = GantryError::GateFailure {
                        verdict: gate.verdict,
                    };
                    OperationResult::from_error(&op.name, &err, start.elapsed())
                };
                result
                    .with_output(summary)
                    .with_artifact(ArtifactRef::Gate { result: gate })
            }
            Err(e) => OperationResult::from_error(&op.name, &e, start.elapsed()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        op: &Operation,
        artifact: &str,
        scheme: TagScheme,
        context: &RunContext,
        scope: &RunScope<'_>,
        bindings: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> OperationResult {
        let start = Instant::now();
        let Some(registry) = &self.collaborators.registry else {
            let err = GantryError::MissingCollaborator("artifact registry");
            return OperationResult::from_error(&op.name, &err, start.elapsed());
        };
        let Some(built) = context.built.get(artifact) else {
            let err = GantryError::ArtifactNotFound(artifact.to_string());
            return OperationResult::from_error(&op.name, &err, start.elapsed());
        };
        let tagged = match scope.versioner.tag(built, scheme) {
            Ok(tagged) => tagged,
            Err(e) => return OperationResult::from_error(&op.name, &e, start.elapsed()),
        };

        let request = &tagged;
        let (pushed, expired) = abort
            .bounded(op.timeout(), |stop| async move {
                registry.publish(request, bindings, &stop).await
            })
            .await;
        if let (true, Some(limit)) = (expired, op.timeout()) {
            return OperationResult::timed_out(&op.name, limit, start.elapsed());
        }

        match pushed {
            Ok(receipt) => {
                obs::emit_artifact_published(&tagged, &receipt.references);
                OperationResult::succeeded(&op.name, start.elapsed())
                    .with_output(receipt.references.join("\n"))
                    .with_artifact(ArtifactRef::Published {
                        artifact: tagged,
                        receipt,
                    })
            }
            Err(e) => OperationResult::from_error(&op.name, &e, start.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::abort_pair;
    use crate::config::NotificationConfig;
    use crate::credentials::StaticCredentialStore;
    use crate::fakes::{RecordingHook, Scripted, ScriptedExecutor};
    use crate::stage::{OutputCapture, PostCondition};

    fn cmd(name: &str) -> Operation {
        Operation::command(name, CommandSpec::new("tool", [name]))
    }

    fn executor_for(
        stages: Vec<Stage>,
        executor: Arc<ScriptedExecutor>,
    ) -> PipelineExecutor {
        let pipeline = Pipeline::new(PipelineConfig::new("shop", 7), stages).unwrap();
        let collaborators = Collaborators::new(executor, Arc::new(StaticCredentialStore::new()));
        PipelineExecutor::new(pipeline, collaborators)
    }

    #[tokio::test]
    async fn test_sequential_stage_stops_at_first_failure() {
        let executor = Arc::new(ScriptedExecutor::new().on(
            "compile",
            Scripted::Fail {
                exit_code: 1,
                output: "error[E0308]".to_string(),
            },
        ));
        let stages = vec![Stage::new("build")
            .with_operation(cmd("fetch"))
            .with_operation(cmd("compile"))
            .with_operation(cmd("package"))];
        let report = executor_for(stages, executor.clone())
            .run(AbortSignal::never())
            .await;

        assert_eq!(report.outcome, Outcome::Failure);
        assert_eq!(executor.operations(), vec!["fetch", "compile"]);
        let stage = report.stage("build").unwrap();
        assert_eq!(stage.status, StageStatus::Failure);
        assert!(stage.failure.as_deref().unwrap().contains("compile"));
    }

    #[tokio::test]
    async fn test_parallel_stage_is_conjunction() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .on("lint", Scripted::Delay(Duration::from_millis(20)))
                .on(
                    "audit",
                    Scripted::Fail {
                        exit_code: 1,
                        output: String::new(),
                    },
                ),
        );
        let stages = vec![Stage::new("checks")
            .parallel()
            .with_operation(cmd("lint"))
            .with_operation(cmd("audit"))
            .with_operation(cmd("fmt"))];
        let report = executor_for(stages, executor.clone())
            .run(AbortSignal::never())
            .await;

        let stage = report.stage("checks").unwrap();
        assert_eq!(stage.operations.len(), 3);
        assert_eq!(stage.status, StageStatus::Failure);
        assert_eq!(report.outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_post_actions_follow_stage_status() {
        let executor = Arc::new(ScriptedExecutor::new().on(
            "unit",
            Scripted::Fail {
                exit_code: 1,
                output: String::new(),
            },
        ));
        let stages = vec![Stage::new("test")
            .with_operation(cmd("unit"))
            .with_post(PostCondition::Always, cmd("junit"))
            .with_post(PostCondition::Success, cmd("coverage"))
            .with_post(PostCondition::Failure, cmd("archive-logs"))];
        let report = executor_for(stages, executor.clone())
            .run(AbortSignal::never())
            .await;

        assert_eq!(executor.operations(), vec!["unit", "junit", "archive-logs"]);
        let stage = report.stage("test").unwrap();
        assert_eq!(stage.post_actions.len(), 2);
        assert_eq!(stage.status, StageStatus::Failure);
    }

    #[tokio::test]
    async fn test_failed_post_action_keeps_stage_status() {
        let executor = Arc::new(ScriptedExecutor::new().on(
            "junit",
            Scripted::Fail {
                exit_code: 1,
                output: String::new(),
            },
        ));
        let stages = vec![Stage::new("test")
            .with_operation(cmd("unit"))
            .with_post(PostCondition::Always, cmd("junit"))];
        let report = executor_for(stages, executor).run(AbortSignal::never()).await;

        let stage = report.stage("test").unwrap();
        assert_eq!(stage.status, StageStatus::Success);
        assert!(!stage.post_actions[0].result.passed());
        assert_eq!(report.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_skipped_stage_runs_always_post_actions() {
        let executor = Arc::new(ScriptedExecutor::new().on(
            "unit",
            Scripted::Fail {
                exit_code: 1,
                output: String::new(),
            },
        ));
        let stages = vec![
            Stage::new("test").with_operation(cmd("unit")),
            Stage::new("deploy")
                .with_operation(cmd("apply"))
                .with_post(PostCondition::Always, cmd("cleanup"))
                .with_post(PostCondition::Success, cmd("smoke"))
                .with_post(PostCondition::Failure, cmd("rollback")),
        ];
        let report = executor_for(stages, executor.clone())
            .run(AbortSignal::never())
            .await;

        assert_eq!(report.outcome, Outcome::Failure);
        assert_eq!(executor.operations(), vec!["unit", "cleanup"]);
        let deploy = report.stage("deploy").unwrap();
        assert_eq!(deploy.status, StageStatus::Skipped);
        assert!(deploy.operations.is_empty());
        assert_eq!(deploy.post_actions.len(), 1);
        assert_eq!(deploy.post_actions[0].condition, PostCondition::Always);
        assert!(deploy.post_actions[0].result.passed());
    }

    #[tokio::test]
    async fn test_abort_before_start_skips_everything() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (handle, signal) = abort_pair();
        handle.abort();
        let log = RecordingHook::new();
        let stages = vec![Stage::new("test").with_operation(cmd("unit"))];
        let report = executor_for(stages, executor.clone())
            .with_hooks(
                HookRunner::new()
                    .with_hook(HookCondition::Failure, log.named("failure"))
                    .with_hook(HookCondition::Always, log.named("always")),
            )
            .run(signal)
            .await;

        assert_eq!(report.outcome, Outcome::Aborted);
        assert!(executor.operations().is_empty());
        assert_eq!(report.stages[0].status, StageStatus::Skipped);
        assert_eq!(log.calls(), vec!["always"]);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_publish() {
        let pipeline = Pipeline {
            config: PipelineConfig::new("shop", 1),
            stages: vec![Stage::new("publish").with_operation(Operation::publish("push", "app"))],
        };
        let collaborators = Collaborators::new(
            Arc::new(ScriptedExecutor::new()),
            Arc::new(StaticCredentialStore::new()),
        )
        .with_registry(Arc::new(crate::fakes::MemoryRegistry::new("r")));
        let report = PipelineExecutor::new(pipeline, collaborators)
            .run(AbortSignal::never())
            .await;

        let op = &report.stages[0].operations[0];
        assert!(op.error.as_deref().unwrap().contains("app"));
        assert_eq!(report.outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_build_output_flows_into_publish() {
        let executor = Arc::new(
            ScriptedExecutor::new().on("image", Scripted::Succeed("sha-1".to_string())),
        );
        let registry = Arc::new(crate::fakes::MemoryRegistry::new("registry.local"));
        let config = PipelineConfig::new("shop", 12).with_registry(crate::config::RegistryConfig {
            repository: "registry.local".to_string(),
            push: vec!["true".to_string()],
            timeout_secs: 0,
        });
        let stages = vec![Stage::new("release")
            .with_operation(Operation::command(
                "image",
                CommandSpec::new("docker", ["build"]).with_capture(OutputCapture::Artifact {
                    name: "app".to_string(),
                    digest_file: None,
                }),
            ))
            .with_operation(Operation::publish("push", "app"))];
        let collaborators = Collaborators::new(executor, Arc::new(StaticCredentialStore::new()))
            .with_registry(registry.clone());
        let report = PipelineExecutor::new(Pipeline::new(config, stages).unwrap(), collaborators)
            .run(AbortSignal::never())
            .await;

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].references(), vec!["app:12", "app:latest"]);
        assert!(registry.resolve("app", "12").is_some());
    }

    #[test]
    fn test_configured_hooks_include_notification() {
        let mut config =
            PipelineConfig::new("shop", 1).with_notification(NotificationConfig::default());
        config.hooks.push(crate::config::HookDefinition {
            name: "cleanup".to_string(),
            condition: HookCondition::Always,
            command: vec!["true".to_string()],
            timeout_secs: 5,
        });
        let hooks = configured_hooks(&config, Arc::new(ScriptedExecutor::new()));
        assert_eq!(hooks.len(), 2);
    }
}
