//! Post-execution hooks keyed by final outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::abort::AbortSignal;
use crate::error::{GantryError, Result};
use crate::obs::emit_hook_failed;
use crate::outcome::Outcome;
use crate::report::{HookRecord, PipelineReport};
use crate::runner::{CommandExecutor, Invocation};
use crate::stage::CommandSpec;

/// Outcome class a hook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCondition {
    Success,
    Failure,
    Always,
}

impl HookCondition {
    /// The outcome-specific condition for `outcome`. ABORTED has none; only
    /// ALWAYS hooks run for it.
    pub fn for_outcome(outcome: Outcome) -> Option<Self> {
        match outcome {
            Outcome::Success => Some(HookCondition::Success),
            Outcome::Failure => Some(HookCondition::Failure),
            _ => None,
        }
    }
}

/// Work run once after the stage sequence has concluded.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, report: &PipelineReport) -> Result<()>;
}

/// Dispatches hooks after a run. Hook failures are recorded and logged; they
/// never change the outcome.
#[derive(Clone, Default)]
pub struct HookRunner {
    hooks: Vec<(HookCondition, Arc<dyn Hook>)>,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, condition: HookCondition, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push((condition, hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the outcome-specific hooks, then the ALWAYS hooks, each group in
    /// registration order.
    pub async fn finalize(&self, report: &PipelineReport) -> Vec<HookRecord> {
        let mut records = Vec::new();
        let specific = HookCondition::for_outcome(report.outcome);

        let selected = self
            .hooks
            .iter()
            .filter(|(c, _)| Some(*c) == specific)
            .chain(self.hooks.iter().filter(|(c, _)| *c == HookCondition::Always));

        for (condition, hook) in selected {
            let result = hook.run(report).await;
            if let Err(e) = &result {
                emit_hook_failed(hook.name(), e);
            }
            records.push(HookRecord {
                hook: hook.name().to_string(),
                condition: *condition,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        records
    }
}

/// Hook that runs an external command, e.g. workspace cleanup.
///
/// The command may use `{pipeline}`, `{build_number}`, `{outcome}` and `{run_id}`.
pub struct CommandHook {
    name: String,
    command: CommandSpec,
    executor: Arc<dyn CommandExecutor>,
    timeout: Option<Duration>,
}

impl CommandHook {
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        executor: Arc<dyn CommandExecutor>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            executor,
            timeout,
        }
    }
}

#[async_trait]
impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, report: &PipelineReport) -> Result<()> {
        let build_number = report.build_number.to_string();
        let outcome = report.outcome.to_string();
        let run_id = report.run_id.to_string();
        let command = self.command.render(&[
            ("pipeline", report.pipeline.as_str()),
            ("build_number", build_number.as_str()),
            ("outcome", outcome.as_str()),
            ("run_id", run_id.as_str()),
        ]);
        let abort = AbortSignal::never();
        let result = self
            .executor
            .execute(Invocation {
                operation: &self.name,
                command: &command,
                timeout: self.timeout,
                credentials: &[],
                abort: &abort,
            })
            .await;
        if result.passed() {
            Ok(())
        } else {
            Err(GantryError::OperationFailure {
                operation: self.name.clone(),
                reason: result.error.unwrap_or_else(|| "hook failed".to_string()),
            })
        }
    }
}
