//! Gantry - staged build orchestration
//!
//! Runs a fixed sequence of stages (test, quality gate, scan, build, publish,
//! deploy), each made of operations backed by external tools:
//! - Halts at the first failing stage unless it is marked best-effort
//! - Waits on a static-analysis quality gate
//! - Scopes credentials to the operation that needs them
//! - Tags published artifacts with the build number and `latest`
//! - Runs outcome-dependent hooks and sends one notification per run

pub mod abort;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod hooks;
pub mod notify;
pub mod obs;
pub mod outcome;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod versioner;

// Re-export key types
pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use config::{ConfigError, PipelineConfig, PipelineDefinition};
pub use credentials::{CredentialScope, CredentialStore, EnvCredentialStore};
pub use error::{FailureKind, GantryError, Result};
pub use gate::{GateVerdict, QualityGateResult, WarnPolicy};
pub use hooks::{HookCondition, HookRunner};
pub use outcome::{Outcome, StageStatus};
pub use pipeline::{configured_hooks, Collaborators, Pipeline, PipelineExecutor};
pub use report::PipelineReport;
pub use runner::{CommandExecutor, OperationResult, OperationStatus, ProcessExecutor};
pub use stage::{CommandSpec, Operation, PostCondition, Stage};
pub use versioner::{TagScheme, VersionTag};
