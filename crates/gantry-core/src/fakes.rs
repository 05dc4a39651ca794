//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `ScriptedExecutor`, `ScriptedAnalysisServer`, `MemoryRegistry`,
//! `RecordingTransport` and `RecordingHook`, which satisfy the trait
//! contracts without spawning processes or reaching the network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::abort::{AbortHandle, AbortSignal};
use crate::credentials::CredentialBinding;
use crate::error::{FailureKind, GantryError, Result};
use crate::gate::{AnalysisServer, CorrelationId, GateVerdict};
use crate::hooks::Hook;
use crate::notify::{DeliveryStatus, NotificationMessage, NotificationTransport};
use crate::report::PipelineReport;
use crate::runner::{
    last_line, ArtifactRef, CommandExecutor, Invocation, OperationResult, OperationStatus,
};
use crate::stage::OutputCapture;
use crate::versioner::{Artifact, ArtifactRegistry, PublishReceipt, TaggedArtifact};

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// What a scripted operation does when executed.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Exit 0 with `output`.
    Succeed(String),
    /// Exit non-zero with `output`.
    Fail { exit_code: i32, output: String },
    /// Report a timeout without waiting.
    TimeOut,
    /// Sleep, then succeed.
    Delay(Duration),
    /// Request an abort through `handle`, then behave like a running
    /// process that is interrupted by it.
    AbortRun(AbortHandle),
    /// Block until the run is aborted.
    Hang,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub operation: String,
    pub program: String,
    pub args: Vec<String>,
    /// Credential names bound for the call.
    pub credentials: Vec<String>,
    /// Whether every binding was usable while the call ran.
    pub credentials_valid: bool,
}

/// Command executor answering from a per-operation script.
///
/// Operations without a script entry succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, operation: impl Into<String>, behaviour: Scripted) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(operation.into(), behaviour);
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the executed operations, in call order.
    pub fn operations(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: Invocation<'_>) -> OperationResult {
        let start = Instant::now();
        self.calls.lock().unwrap().push(ScriptedCall {
            operation: invocation.operation.to_string(),
            program: invocation.command.program.clone(),
            args: invocation.command.args.clone(),
            credentials: invocation
                .credentials
                .iter()
                .map(|b| b.name().to_string())
                .collect(),
            credentials_valid: invocation.credentials.iter().all(|b| b.is_valid()),
        });

        let behaviour = self
            .scripts
            .lock()
            .unwrap()
            .get(invocation.operation)
            .cloned()
            .unwrap_or_else(|| Scripted::Succeed(String::new()));

        let output = match behaviour {
            Scripted::Succeed(output) => output,
            Scripted::Delay(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => String::new(),
                    _ = invocation.abort.aborted() => return aborted(invocation.operation, start),
                }
            }
            Scripted::Fail { exit_code, output } => {
                return OperationResult {
                    operation: invocation.operation.to_string(),
                    status: OperationStatus::Failed,
                    exit_code: Some(exit_code),
                    output,
                    artifact: None,
                    error: Some(format!("exited with code {exit_code}")),
                    failure_kind: Some(FailureKind::Operation),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Scripted::TimeOut => {
                let limit = invocation.timeout.unwrap_or(Duration::ZERO);
                return OperationResult::timed_out(invocation.operation, limit, start.elapsed());
            }
            Scripted::AbortRun(handle) => {
                handle.abort();
                invocation.abort.aborted().await;
                return aborted(invocation.operation, start);
            }
            Scripted::Hang => {
                invocation.abort.aborted().await;
                return aborted(invocation.operation, start);
            }
        };

        let mut result = OperationResult {
            exit_code: Some(0),
            ..OperationResult::succeeded(invocation.operation, start.elapsed())
        }
        .with_output(output);
        match &invocation.command.capture {
            Some(OutputCapture::Artifact { name, .. }) => {
                let identity = last_line(&result.output)
                    .unwrap_or(invocation.operation)
                    .to_string();
                result = result.with_artifact(ArtifactRef::Built {
                    artifact: Artifact::from_reference(name.clone(), &identity),
                });
            }
            Some(OutputCapture::Report { path }) => {
                result = result.with_artifact(ArtifactRef::Report { path: path.clone() });
            }
            None => {}
        }
        result
    }
}

fn aborted(operation: &str, start: Instant) -> OperationResult {
    OperationResult::from_error(operation, &GantryError::AbortRequested, start.elapsed())
}

// ---------------------------------------------------------------------------
// ScriptedAnalysisServer
// ---------------------------------------------------------------------------

/// Analysis server replaying a fixed sequence of verdict answers.
///
/// Each query pops the next entry; an exhausted script keeps answering
/// "pending".
#[derive(Debug, Default)]
pub struct ScriptedAnalysisServer {
    script: Mutex<VecDeque<Option<GateVerdict>>>,
    fail_first: u32,
    queries: Mutex<u32>,
    submitted: Mutex<Vec<(String, String)>>,
}

impl ScriptedAnalysisServer {
    pub fn new(script: Vec<Option<GateVerdict>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Make the first `n` queries fail with an error.
    pub fn failing_first_queries(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn queries(&self) -> u32 {
        *self.queries.lock().unwrap()
    }

    /// `(source_ref, project_key)` of every submission.
    pub fn submitted(&self) -> Vec<(String, String)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisServer for ScriptedAnalysisServer {
    async fn submit(
        &self,
        source_ref: &str,
        project_key: &str,
        _credentials: &[CredentialBinding],
        _abort: &AbortSignal,
    ) -> Result<CorrelationId> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((source_ref.to_string(), project_key.to_string()));
        Ok(CorrelationId(format!("task-{}", submitted.len())))
    }

    async fn query_verdict(
        &self,
        _correlation_id: &CorrelationId,
        _credentials: &[CredentialBinding],
        _abort: &AbortSignal,
    ) -> Result<Option<GateVerdict>> {
        let seen = {
            let mut queries = self.queries.lock().unwrap();
            let seen = *queries;
            *queries += 1;
            seen
        };
        if seen < self.fail_first {
            return Err(GantryError::OperationFailure {
                operation: "analysis-query".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.script.lock().unwrap().pop_front().flatten())
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// In-memory registry mapping `(name, tag)` to a content digest.
///
/// All tags of one publish are written under a single lock, so readers never
/// see `latest` ahead of the numeric tag.
#[derive(Debug)]
pub struct MemoryRegistry {
    repository: String,
    tags: Mutex<HashMap<(String, String), String>>,
    failing: bool,
}

impl MemoryRegistry {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tags: Mutex::new(HashMap::new()),
            failing: false,
        }
    }

    /// A registry that rejects every publish.
    pub fn rejecting(repository: impl Into<String>) -> Self {
        Self {
            failing: true,
            ..Self::new(repository)
        }
    }

    /// Digest currently behind `name:tag`.
    pub fn resolve(&self, name: &str, tag: &str) -> Option<String> {
        self.tags
            .lock()
            .unwrap()
            .get(&(name.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tags.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryRegistry {
    async fn publish(
        &self,
        artifact: &TaggedArtifact,
        _credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<PublishReceipt> {
        if abort.is_aborted() {
            return Err(GantryError::AbortRequested);
        }
        if self.failing {
            return Err(GantryError::OperationFailure {
                operation: format!("push {}", artifact.artifact.name),
                reason: "registry rejected upload".to_string(),
            });
        }
        let mut tags = self.tags.lock().unwrap();
        let mut references = Vec::with_capacity(artifact.tags.len());
        for tag in &artifact.tags {
            tags.insert(
                (artifact.artifact.name.clone(), tag.to_string()),
                artifact.artifact.content_digest.clone(),
            );
            references.push(format!(
                "{}/{}:{}",
                self.repository, artifact.artifact.name, tag
            ));
        }
        Ok(PublishReceipt {
            repository: self.repository.clone(),
            references,
            content_digest: artifact.artifact.content_digest.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Notification transport that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<NotificationMessage>>,
    reject: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that records messages but reports them as not accepted.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryStatus> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryStatus {
            accepted: !self.reject,
            detail: if self.reject {
                "relay refused message".to_string()
            } else {
                "recorded".to_string()
            },
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingHook
// ---------------------------------------------------------------------------

/// Shared call log for hooks created with [`RecordingHook::named`] and
/// [`RecordingHook::failing`].
#[derive(Debug, Clone, Default)]
pub struct RecordingHook {
    calls: Arc<Mutex<Vec<String>>>,
}

struct LoggedHook {
    name: String,
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(&self, name: &str) -> Arc<dyn Hook> {
        self.hook(name, false)
    }

    pub fn failing(&self, name: &str) -> Arc<dyn Hook> {
        self.hook(name, true)
    }

    fn hook(&self, name: &str, fail: bool) -> Arc<dyn Hook> {
        Arc::new(LoggedHook {
            name: name.to_string(),
            fail,
            calls: Arc::clone(&self.calls),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hook for LoggedHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _report: &PipelineReport) -> Result<()> {
        self.calls.lock().unwrap().push(self.name.clone());
        if self.fail {
            Err(GantryError::OperationFailure {
                operation: self.name.clone(),
                reason: "hook failed".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::CommandSpec;

    #[tokio::test]
    async fn test_scripted_executor_records_calls() {
        let executor = ScriptedExecutor::new().on(
            "unit",
            Scripted::Fail {
                exit_code: 2,
                output: "1 test failed".to_string(),
            },
        );
        let spec = CommandSpec::new("mvn", ["test"]);
        let abort = AbortSignal::never();
        let result = executor
            .execute(Invocation {
                operation: "unit",
                command: &spec,
                timeout: None,
                credentials: &[],
                abort: &abort,
            })
            .await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(executor.operations(), vec!["unit"]);
        assert_eq!(executor.calls()[0].program, "mvn");
    }

    #[tokio::test]
    async fn test_rejecting_registry() {
        let registry = MemoryRegistry::rejecting("r");
        let tagged = TaggedArtifact {
            artifact: Artifact::new("app", "sha256:aa"),
            tags: crate::versioner::TagScheme::default().tags(1),
        };
        assert!(registry
            .publish(&tagged, &[], &AbortSignal::never())
            .await
            .is_err());
        assert!(registry.is_empty());
    }
}
