//! Outcome notification.
//!
//! [`NotificationDispatcher`] is a [`Hook`] that renders a single
//! [`NotificationMessage`] from the final report and hands it to a
//! [`NotificationTransport`]. Delivery is best effort.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::abort::AbortSignal;
use crate::config::NotificationConfig;
use crate::error::{GantryError, Result};
use crate::hooks::Hook;
use crate::outcome::Outcome;
use crate::report::PipelineReport;
use crate::runner::{CommandExecutor, Invocation};
use crate::stage::CommandSpec;

/// Lines of failing output included in a message.
const OUTPUT_TAIL_LINES: usize = 30;

/// A rendered outcome message. Built once, after the outcome is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub subject: String,
    pub body: String,
    pub outcome: Outcome,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

impl NotificationMessage {
    pub fn render(report: &PipelineReport, config: &NotificationConfig) -> Self {
        let subject = format!(
            "{}{} #{}: {}",
            config.subject_prefix, report.pipeline, report.build_number, report.outcome
        );

        let mut body = String::new();
        let _ = writeln!(body, "Pipeline: {}", report.pipeline);
        let _ = writeln!(body, "Build:    #{}", report.build_number);
        let _ = writeln!(body, "Outcome:  {}", report.outcome);
        let _ = writeln!(body, "Run:      {}", report.run_id);
        let _ = writeln!(body, "Duration: {} ms", report.duration_ms);

        if let Some(gate) = &report.gate {
            let _ = writeln!(
                body,
                "Quality gate: {} ({})",
                gate.verdict, gate.correlation_id
            );
        }
        for artifact in &report.artifacts {
            let _ = writeln!(
                body,
                "Published: {} ({})",
                artifact.references().join(", "),
                artifact.artifact.content_digest
            );
        }

        body.push_str("\nStages:\n");
        for stage in &report.stages {
            let marker = if stage.best_effort { " (best effort)" } else { "" };
            let _ = writeln!(body, "  [{}] {}{}", stage.status, stage.name, marker);
        }

        if let Some(stage) = report.deciding_stage() {
            let _ = writeln!(body, "\nStopped at stage '{}'", stage.name);
            if let Some(reason) = &stage.failure {
                let _ = writeln!(body, "Reason: {reason}");
            }
            if let Some(op) = stage.failed_operation() {
                let tail = op.output_tail(OUTPUT_TAIL_LINES);
                if !tail.is_empty() {
                    let _ = writeln!(body, "\nOutput of '{}':\n{}", op.operation, tail);
                }
            }
        }

        let tolerated: Vec<&str> = report
            .tolerated_failures()
            .map(|s| s.name.as_str())
            .collect();
        if !tolerated.is_empty() {
            let _ = writeln!(body, "\nTolerated failures: {}", tolerated.join(", "));
        }

        Self {
            subject,
            body,
            outcome: report.outcome,
            sender: config.sender.clone(),
            recipients: config.recipients.clone(),
        }
    }
}

/// Acknowledgement from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub accepted: bool,
    pub detail: String,
}

/// Message transport (mail relay, chat webhook, ...).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryStatus>;
}

/// Writes the message to the log. Used when no transport is configured.
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryStatus> {
        info!(
            subject = %message.subject,
            recipients = %message.recipients.join(","),
            "notification\n{}",
            message.body
        );
        Ok(DeliveryStatus {
            accepted: true,
            detail: "logged".to_string(),
        })
    }
}

/// Hands the message to an external command (e.g. `sendmail -t`).
///
/// The body is written to stdin; arguments may use `{subject}`,
/// `{recipients}` and `{outcome}`.
pub struct CommandTransport {
    executor: Arc<dyn CommandExecutor>,
    command: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandTransport {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        command: CommandSpec,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            command,
            timeout,
        }
    }
}

#[async_trait]
impl NotificationTransport for CommandTransport {
    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryStatus> {
        let recipients = message.recipients.join(",");
        let outcome = message.outcome.to_string();
        let command = self
            .command
            .render(&[
                ("subject", message.subject.as_str()),
                ("recipients", recipients.as_str()),
                ("outcome", outcome.as_str()),
            ])
            .with_stdin(message.body.clone());
        let abort = AbortSignal::never();
        let result = self
            .executor
            .execute(Invocation {
                operation: "notify",
                command: &command,
                timeout: self.timeout,
                credentials: &[],
                abort: &abort,
            })
            .await;
        Ok(DeliveryStatus {
            accepted: result.passed(),
            detail: result
                .error
                .unwrap_or_else(|| format!("delivered via {}", command.program)),
        })
    }
}

/// Hook rendering and sending the outcome message.
pub struct NotificationDispatcher {
    config: NotificationConfig,
    transport: Arc<dyn NotificationTransport>,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig, transport: Arc<dyn NotificationTransport>) -> Self {
        Self { config, transport }
    }
}

#[async_trait]
impl Hook for NotificationDispatcher {
    fn name(&self) -> &str {
        "notification"
    }

    async fn run(&self, report: &PipelineReport) -> Result<()> {
        let message = NotificationMessage::render(report, &self.config);
        let status = self.transport.send(&message).await?;
        if status.accepted {
            info!(subject = %message.subject, "notification sent");
            Ok(())
        } else {
            Err(GantryError::OperationFailure {
                operation: "notification".to_string(),
                reason: status.detail,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingTransport;
    use crate::gate::{CorrelationId, GateVerdict, QualityGateResult};
    use crate::outcome::StageStatus;
    use crate::report::StageRecord;
    use crate::runner::{OperationResult, OperationStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> NotificationConfig {
        NotificationConfig {
            recipients: vec!["team@example.com".to_string()],
            sender: Some("ci@example.com".to_string()),
            subject_prefix: "[ci] ".to_string(),
            command: None,
        }
    }

    fn failed_report() -> PipelineReport {
        let mut failed_op = OperationResult::succeeded("gate", std::time::Duration::ZERO)
            .with_output("line 1\nquality gate ERROR");
        failed_op.status = OperationStatus::Failed;
        let gate_stage = StageRecord {
            status: StageStatus::Failure,
            operations: vec![failed_op],
            failure: Some("quality gate failed with verdict ERROR".to_string()),
            ..StageRecord::skipped("analyze", 1, false)
        };
        PipelineReport {
            run_id: Uuid::new_v4(),
            pipeline: "shop".to_string(),
            build_number: 42,
            outcome: Outcome::Failure,
            started_at: Utc::now(),
            duration_ms: 10,
            stages: vec![
                StageRecord {
                    status: StageStatus::Success,
                    ..StageRecord::skipped("test", 0, false)
                },
                gate_stage,
                StageRecord::skipped("build", 2, false),
            ],
            gate: Some(QualityGateResult {
                correlation_id: CorrelationId("task-9".to_string()),
                verdict: GateVerdict::Error,
                polls: 2,
                waited_ms: 5,
            }),
            artifacts: Vec::new(),
            hooks: Vec::new(),
        }
    }

    #[test]
    fn test_render_failure_message() {
        let message = NotificationMessage::render(&failed_report(), &config());
        assert_eq!(message.subject, "[ci] shop #42: FAILURE");
        assert!(message.body.contains("Quality gate: ERROR (task-9)"));
        assert!(message.body.contains("Stopped at stage 'analyze'"));
        assert!(message.body.contains("[SKIPPED] build"));
        assert!(message.body.contains("quality gate ERROR"));
        assert_eq!(message.recipients, vec!["team@example.com"]);
    }

    #[tokio::test]
    async fn test_dispatcher_sends_once() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = NotificationDispatcher::new(config(), transport.clone());
        dispatcher.run(&failed_report()).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_dispatcher_reports_transport_failure() {
        let transport = Arc::new(RecordingTransport::rejecting());
        let dispatcher = NotificationDispatcher::new(config(), transport);
        let err = dispatcher.run(&failed_report()).await.unwrap_err();
        assert!(err.to_string().contains("notification"));
    }

    #[tokio::test]
    async fn test_command_transport_pipes_body() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::new("sh", ["-c", "cat > mail.txt"]).with_working_dir(dir.path());
        let transport = CommandTransport::new(
            Arc::new(crate::runner::ProcessExecutor::default()),
            command,
            Some(Duration::from_secs(10)),
        );
        let message = NotificationMessage::render(&failed_report(), &config());
        let status = transport.send(&message).await.unwrap();
        assert!(status.accepted);
        let written = std::fs::read_to_string(dir.path().join("mail.txt")).unwrap();
        assert!(written.contains("Outcome:  FAILURE"));
    }
}
