//! Quality gate: submit an analysis and wait for its verdict.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::credentials::CredentialBinding;
use crate::error::{GantryError, Result};
use crate::runner::{last_line, CommandExecutor, Invocation, OperationStatus};
use crate::stage::CommandSpec;

/// Quality gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateVerdict {
    Ok,
    Warn,
    Error,
    /// No terminal verdict before the deadline.
    Timeout,
}

impl GateVerdict {
    /// Parse a verdict reported by an analysis server. Anything other than
    /// OK/WARN/ERROR (e.g. PENDING, IN_PROGRESS) means "not yet decided".
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "OK" | "PASSED" => Some(GateVerdict::Ok),
            "WARN" | "WARNING" => Some(GateVerdict::Warn),
            "ERROR" | "FAILED" => Some(GateVerdict::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateVerdict::Timeout)
    }
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateVerdict::Ok => "OK",
            GateVerdict::Warn => "WARN",
            GateVerdict::Error => "ERROR",
            GateVerdict::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// How a WARN verdict is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnPolicy {
    /// WARN fails the gate.
    #[default]
    FailClosed,
    /// WARN passes the gate.
    Pass,
}

impl WarnPolicy {
    /// Whether `verdict` lets the pipeline proceed.
    pub fn accepts(&self, verdict: GateVerdict) -> bool {
        match verdict {
            GateVerdict::Ok => true,
            GateVerdict::Warn => *self == WarnPolicy::Pass,
            GateVerdict::Error | GateVerdict::Timeout => false,
        }
    }
}

/// Identifier tying a verdict to the analysis that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verdict for one analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGateResult {
    pub correlation_id: CorrelationId,
    pub verdict: GateVerdict,
    /// Number of verdict queries issued.
    pub polls: u32,
    pub waited_ms: u64,
}

/// External static-analysis system.
#[async_trait]
pub trait AnalysisServer: Send + Sync {
    /// Trigger an analysis of `source_ref` for `project_key`.
    async fn submit(
        &self,
        source_ref: &str,
        project_key: &str,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<CorrelationId>;

    /// Current verdict, or `None` while the analysis is still pending.
    async fn query_verdict(
        &self,
        correlation_id: &CorrelationId,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<Option<GateVerdict>>;
}

/// Polls an [`AnalysisServer`] until a terminal verdict or the deadline.
#[derive(Debug, Clone)]
pub struct QualityGateWaiter {
    poll_interval: Duration,
}

impl Default for QualityGateWaiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl QualityGateWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Wait for the verdict of `correlation_id`.
    ///
    /// Query errors are logged and polling continues; the only ways out
    /// without a verdict are the deadline and `abort`, both of which yield
    /// [`GateVerdict::Timeout`]. Never retries past `deadline`. A query in
    /// flight when either fires is stopped through its signal, not dropped.
    pub async fn await_verdict(
        &self,
        server: &dyn AnalysisServer,
        correlation_id: &CorrelationId,
        deadline: Duration,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> QualityGateResult {
        let started = Instant::now();
        let poll_interval = self.poll_interval;

        let ((verdict, polls), _) = abort
            .bounded(Some(deadline), |stop| async move {
                let mut polls = 0u32;
                while !stop.is_aborted() {
                    polls += 1;
                    match server.query_verdict(correlation_id, credentials, &stop).await {
                        Ok(Some(verdict)) if verdict.is_terminal() => return (verdict, polls),
                        Ok(_) => debug!(correlation_id = %correlation_id, "verdict pending"),
                        Err(_) if stop.is_aborted() => break,
                        Err(e) => warn!(
                            correlation_id = %correlation_id,
                            error = %e,
                            "verdict query failed"
                        ),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = stop.aborted() => break,
                    }
                }
                (GateVerdict::Timeout, polls)
            })
            .await;

        QualityGateResult {
            correlation_id: correlation_id.clone(),
            verdict,
            polls,
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Analysis server driven by two external commands.
///
/// `submit` may use `{source_ref}` and `{project_key}`; its last non-empty
/// output line is the correlation id. `query` may use `{correlation_id}`; its
/// last non-empty output line is parsed with [`GateVerdict::parse`].
pub struct CommandAnalysisServer {
    executor: Arc<dyn CommandExecutor>,
    submit: CommandSpec,
    query: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandAnalysisServer {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        submit: CommandSpec,
        query: CommandSpec,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            submit,
            query,
            timeout,
        }
    }

    async fn run(
        &self,
        operation: &str,
        command: &CommandSpec,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<String> {
        let result = self
            .executor
            .execute(Invocation {
                operation,
                command,
                timeout: self.timeout,
                credentials,
                abort,
            })
            .await;
        if result.passed() {
            Ok(result.output)
        } else if result.status == OperationStatus::Aborted {
            Err(GantryError::AbortRequested)
        } else {
            Err(GantryError::OperationFailure {
                operation: operation.to_string(),
                reason: result.error.unwrap_or_else(|| "command failed".to_string()),
            })
        }
    }
}

#[async_trait]
impl AnalysisServer for CommandAnalysisServer {
    async fn submit(
        &self,
        source_ref: &str,
        project_key: &str,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<CorrelationId> {
        let command = self
            .submit
            .render(&[("source_ref", source_ref), ("project_key", project_key)]);
        let output = self
            .run("analysis-submit", &command, credentials, abort)
            .await?;
        last_line(&output)
            .map(|id| CorrelationId(id.to_string()))
            .ok_or_else(|| GantryError::OperationFailure {
                operation: "analysis-submit".to_string(),
                reason: "no correlation id in output".to_string(),
            })
    }

    async fn query_verdict(
        &self,
        correlation_id: &CorrelationId,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<Option<GateVerdict>> {
        let command = self
            .query
            .render(&[("correlation_id", correlation_id.as_str())]);
        let output = self
            .run("analysis-query", &command, credentials, abort)
            .await?;
        Ok(last_line(&output).and_then(GateVerdict::parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedAnalysisServer;
    use crate::runner::ProcessExecutor;

    fn id() -> CorrelationId {
        CorrelationId("task-1".to_string())
    }

    #[test]
    fn test_verdict_parse() {
        assert_eq!(GateVerdict::parse("ok"), Some(GateVerdict::Ok));
        assert_eq!(GateVerdict::parse(" WARN\n"), Some(GateVerdict::Warn));
        assert_eq!(GateVerdict::parse("ERROR"), Some(GateVerdict::Error));
        assert_eq!(GateVerdict::parse("IN_PROGRESS"), None);
        assert_eq!(GateVerdict::parse("TIMEOUT"), None);
    }

    #[test]
    fn test_warn_policy() {
        let strict = WarnPolicy::default();
        assert_eq!(strict, WarnPolicy::FailClosed);
        assert!(strict.accepts(GateVerdict::Ok));
        assert!(!strict.accepts(GateVerdict::Warn));
        assert!(!strict.accepts(GateVerdict::Error));
        assert!(!strict.accepts(GateVerdict::Timeout));

        let lenient = WarnPolicy::Pass;
        assert!(lenient.accepts(GateVerdict::Warn));
        assert!(!lenient.accepts(GateVerdict::Timeout));
    }

    #[tokio::test]
    async fn test_waiter_returns_first_terminal_verdict() {
        let server = ScriptedAnalysisServer::new(vec![None, None, Some(GateVerdict::Ok)]);
        let waiter = QualityGateWaiter::new(Duration::from_millis(1));
        let never = AbortSignal::never();
        let result = waiter
            .await_verdict(&server, &id(), Duration::from_secs(5), &[], &never)
            .await;
        assert_eq!(result.verdict, GateVerdict::Ok);
        assert_eq!(result.polls, 3);
        assert_eq!(result.correlation_id, id());
    }

    #[tokio::test]
    async fn test_waiter_times_out_without_verdict() {
        let server = ScriptedAnalysisServer::new(vec![]);
        let waiter = QualityGateWaiter::new(Duration::from_millis(5));
        let never = AbortSignal::never();
        let result = waiter
            .await_verdict(&server, &id(), Duration::from_millis(50), &[], &never)
            .await;
        assert_eq!(result.verdict, GateVerdict::Timeout);
        assert!(result.polls >= 1);
    }

    #[tokio::test]
    async fn test_waiter_survives_query_errors() {
        let server = ScriptedAnalysisServer::new(vec![None, Some(GateVerdict::Error)])
            .failing_first_queries(2);
        let waiter = QualityGateWaiter::new(Duration::from_millis(1));
        let never = AbortSignal::never();
        let result = waiter
            .await_verdict(&server, &id(), Duration::from_secs(5), &[], &never)
            .await;
        assert_eq!(result.verdict, GateVerdict::Error);
        assert_eq!(result.polls, 4);
    }

    #[tokio::test]
    async fn test_command_analysis_server() {
        let server = CommandAnalysisServer::new(
            Arc::new(ProcessExecutor::default()),
            CommandSpec::new(
                "sh",
                ["-c", "echo submitting {project_key}; echo task-{source_ref}"],
            ),
            CommandSpec::new("sh", ["-c", "echo checking {correlation_id}; echo OK"]),
            Some(Duration::from_secs(10)),
        );
        let never = AbortSignal::never();
        let id = server.submit("main", "shop", &[], &never).await.unwrap();
        assert_eq!(id.as_str(), "task-main");
        let verdict = server.query_verdict(&id, &[], &never).await.unwrap();
        assert_eq!(verdict, Some(GateVerdict::Ok));
    }

    #[tokio::test]
    async fn test_command_analysis_server_submit_failure() {
        let server = CommandAnalysisServer::new(
            Arc::new(ProcessExecutor::default()),
            CommandSpec::new("false", Vec::<String>::new()),
            CommandSpec::new("true", Vec::<String>::new()),
            None,
        );
        let err = server
            .submit("main", "shop", &[], &AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::OperationFailure { .. }));
    }

    #[tokio::test]
    async fn test_waiter_stops_polling_on_abort() {
        let (handle, signal) = crate::abort::abort_pair();
        let server = ScriptedAnalysisServer::new(vec![]);
        let waiter = QualityGateWaiter::new(Duration::from_millis(5));
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.abort();
        });
        let result = waiter
            .await_verdict(&server, &id(), Duration::from_secs(30), &[], &signal)
            .await;
        aborter.await.unwrap();
        assert_eq!(result.verdict, GateVerdict::Timeout);
        assert!(result.waited_ms < 30_000);
    }

    #[tokio::test]
    async fn test_command_analysis_server_reports_abort() {
        let (handle, signal) = crate::abort::abort_pair();
        handle.abort();
        let server = CommandAnalysisServer::new(
            Arc::new(ProcessExecutor::new(Duration::from_millis(200))),
            CommandSpec::new("sleep", ["5"]),
            CommandSpec::new("true", Vec::<String>::new()),
            None,
        );
        let err = server.submit("main", "shop", &[], &signal).await.unwrap_err();
        assert!(matches!(err, GantryError::AbortRequested));
    }
}
