//! Command execution with timeout enforcement and output capture.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::credentials::CredentialBinding;
use crate::error::{FailureKind, GantryError};
use crate::gate::QualityGateResult;
use crate::stage::{CommandSpec, OutputCapture};
use crate::versioner::{Artifact, PublishReceipt, TaggedArtifact};

/// Terminal status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    /// Non-zero exit or collaborator failure.
    Failed,
    /// Wall-clock limit reached; distinct from an ordinary failure.
    TimedOut,
    Aborted,
}

/// Structured output attached to an operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactRef {
    /// A report file written by the tool.
    Report { path: PathBuf },
    /// A built artifact, not yet tagged.
    Built { artifact: Artifact },
    /// A quality gate verdict.
    Gate { result: QualityGateResult },
    /// A tagged and published artifact.
    Published {
        artifact: TaggedArtifact,
        receipt: PublishReceipt,
    },
}

/// Result of one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// Operation name.
    pub operation: String,

    pub status: OperationStatus,

    /// Process exit code, when a process ran to completion.
    pub exit_code: Option<i32>,

    /// Combined stdout + stderr.
    pub output: String,

    pub artifact: Option<ArtifactRef>,

    /// Failure description (absent on success).
    pub error: Option<String>,

    pub failure_kind: Option<FailureKind>,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl OperationResult {
    /// Whether this operation passed.
    pub fn passed(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }

    pub fn succeeded(operation: impl Into<String>, duration: Duration) -> Self {
        Self {
            operation: operation.into(),
            status: OperationStatus::Succeeded,
            exit_code: None,
            output: String::new(),
            artifact: None,
            error: None,
            failure_kind: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Result for an operation that failed with `err` before or instead of
    /// producing a process result.
    pub fn from_error(operation: impl Into<String>, err: &GantryError, duration: Duration) -> Self {
        let kind = err.failure_kind();
        Self {
            operation: operation.into(),
            status: if kind == FailureKind::Abort {
                OperationStatus::Aborted
            } else {
                OperationStatus::Failed
            },
            exit_code: None,
            output: String::new(),
            artifact: None,
            error: Some(err.to_string()),
            failure_kind: Some(kind),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn timed_out(operation: impl Into<String>, limit: Duration, duration: Duration) -> Self {
        Self {
            operation: operation.into(),
            status: OperationStatus::TimedOut,
            exit_code: None,
            output: String::new(),
            artifact: None,
            error: Some(format!("timed out after {} seconds", limit.as_secs())),
            failure_kind: Some(FailureKind::Operation),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// The last `n` lines of output, for notifications.
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// One command invocation.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Operation name, for logs and the result.
    pub operation: &'a str,
    pub command: &'a CommandSpec,
    /// `None` means no limit.
    pub timeout: Option<Duration>,
    pub credentials: &'a [CredentialBinding],
    pub abort: &'a AbortSignal,
}

/// Runs external commands. The executor only relays status and output and
/// enforces time limits; side effects belong to the tool.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: Invocation<'_>) -> OperationResult;
}

/// Executes commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    /// Time allowed between graceful termination and a forced kill.
    grace_period: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

enum Completion {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut(Duration),
    Aborted,
}

impl ProcessExecutor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    fn build_command(&self, invocation: &Invocation<'_>) -> Result<Command, GantryError> {
        let spec = invocation.command;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for binding in invocation.credentials {
            if let Some(var) = binding.env_var() {
                binding.expose(|secret| {
                    cmd.env(var, secret);
                })?;
            }
        }
        Ok(cmd)
    }

    /// SIGTERM, then SIGKILL once the grace period has elapsed.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %e, "failed to send SIGTERM");
                }
                if tokio::time::timeout(self.grace_period, child.wait()).await.is_ok() {
                    return;
                }
                warn!(pid, "process ignored SIGTERM, killing");
            }
        }
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill child process");
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, invocation: Invocation<'_>) -> OperationResult {
        let start = Instant::now();
        let spec = invocation.command;

        let mut child = match self
            .build_command(&invocation)
            .and_then(|mut cmd| cmd.spawn().map_err(GantryError::from))
        {
            Ok(child) => child,
            Err(e) => {
                let err = GantryError::OperationFailure {
                    operation: invocation.operation.to_string(),
                    reason: format!("failed to start `{}`: {e}", spec.program),
                };
                return OperationResult::from_error(invocation.operation, &err, start.elapsed());
            }
        };
        debug!(operation = invocation.operation, command = %spec.display(), "spawned");

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "stdin closed early");
                }
            });
        }

        let combined = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(stdout, Arc::clone(&combined))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(stderr, Arc::clone(&combined))));
        }

        let completion = tokio::select! {
            status = child.wait() => Completion::Exited(status),
            limit = sleep_for(invocation.timeout) => Completion::TimedOut(limit),
            _ = invocation.abort.aborted() => Completion::Aborted,
        };

        if !matches!(completion, Completion::Exited(_)) {
            self.terminate(&mut child).await;
        }
        for reader in readers {
            // Grandchildren may keep the pipes open; do not wait on them forever.
            let _ = tokio::time::timeout(self.grace_period, reader).await;
        }

        let output = combined
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        let duration = start.elapsed();

        match completion {
            Completion::Exited(Ok(status)) => {
                let exit_code = status.code();
                if status.success() {
                    let result = OperationResult {
                        exit_code,
                        ..OperationResult::succeeded(invocation.operation, duration)
                    }
                    .with_output(output);
                    capture_output(result, spec)
                } else {
                    OperationResult {
                        operation: invocation.operation.to_string(),
                        status: OperationStatus::Failed,
                        exit_code,
                        output,
                        artifact: None,
                        error: Some(match exit_code {
                            Some(code) => format!("exited with code {code}"),
                            None => "terminated by signal".to_string(),
                        }),
                        failure_kind: Some(FailureKind::Operation),
                        duration_ms: duration.as_millis() as u64,
                    }
                }
            }
            Completion::Exited(Err(e)) => {
                let err = GantryError::Io(e);
                OperationResult::from_error(invocation.operation, &err, duration)
                    .with_output(output)
            }
            Completion::TimedOut(limit) => {
                OperationResult::timed_out(invocation.operation, limit, duration)
                    .with_output(output)
            }
            Completion::Aborted => {
                let err = GantryError::AbortRequested;
                OperationResult::from_error(invocation.operation, &err, duration)
                    .with_output(output)
            }
        }
    }
}

async fn sleep_for(limit: Option<Duration>) -> Duration {
    match limit {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

async fn collect_lines<R>(stream: R, sink: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let mut out = sink.lock().unwrap_or_else(|p| p.into_inner());
                out.push_str(&line);
                if !line.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
}

/// Attach the declared capture to a successful result, or fail it when the
/// declared output is missing.
fn capture_output(result: OperationResult, spec: &CommandSpec) -> OperationResult {
    let Some(capture) = &spec.capture else {
        return result;
    };
    let base = spec.working_dir.as_deref().unwrap_or_else(|| Path::new("."));

    match capture {
        OutputCapture::Report { path } => {
            let full = base.join(path);
            if full.is_file() {
                result.with_artifact(ArtifactRef::Report { path: path.clone() })
            } else {
                fail_capture(result, format!("report {} was not written", full.display()))
            }
        }
        OutputCapture::Artifact { name, digest_file } => {
            let artifact = match digest_file {
                Some(file) => std::fs::read(base.join(file))
                    .map(|bytes| Artifact::new(name.clone(), content_digest(&bytes)))
                    .map_err(|e| {
                        format!("cannot read artifact file {}: {e}", base.join(file).display())
                    }),
                None => last_line(&result.output)
                    .map(|line| Artifact::from_reference(name.clone(), line))
                    .ok_or_else(|| "command printed no artifact identity".to_string()),
            };
            match artifact {
                Ok(artifact) => result.with_artifact(ArtifactRef::Built { artifact }),
                Err(reason) => fail_capture(result, reason),
            }
        }
    }
}

fn fail_capture(mut result: OperationResult, reason: String) -> OperationResult {
    result.status = OperationStatus::Failed;
    result.error = Some(reason);
    result.failure_kind = Some(FailureKind::Operation);
    result
}

/// Last non-empty, trimmed line of `output`.
pub fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

/// `sha256:<hex>` content identity.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
