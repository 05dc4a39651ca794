//! Typed pipeline configuration.
//!
//! A pipeline is described once, up front, by a [`PipelineDefinition`]
//! (usually loaded from TOML). Converting it into a [`Pipeline`] validates
//! every cross reference, so an undeclared credential or a publish of an
//! artifact nobody builds fails before the first stage runs.
//!
//! ```toml
//! [pipeline]
//! name = "shop"
//! credentials = ["nexus"]
//!
//! [[stages]]
//! name = "test"
//!
//! [[stages.operations]]
//! name = "unit-tests"
//! kind = "command"
//! program = "mvn"
//! args = ["test"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::WarnPolicy;
use crate::hooks::HookCondition;
use crate::pipeline::Pipeline;
use crate::stage::{OperationKind, OutputCapture, Stage};

/// Configuration errors. All of them surface before a run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("pipeline name must not be empty")]
    EmptyName,

    #[error("no build number: set pipeline.build_number or supply one at run start")]
    MissingBuildNumber,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' operation '{operation}' references undeclared credential '{name}'")]
    UndefinedCredential {
        stage: String,
        operation: String,
        name: String,
    },

    #[error("stage '{stage}' operation '{operation}' requires a [{section}] section")]
    MissingSection {
        stage: String,
        operation: String,
        section: &'static str,
    },

    #[error("stage '{stage}' publishes '{artifact}' but no earlier operation builds it")]
    UnknownArtifact { stage: String, artifact: String },

    #[error("stage '{stage}' operation '{operation}' has unknown field '{field}'")]
    UnknownField {
        stage: String,
        operation: String,
        field: String,
    },

    #[error("stage '{stage}': {reason}")]
    InvalidOperation { stage: String, reason: String },

    #[error("{0} command must not be empty")]
    EmptyCommand(String),
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    pub name: String,

    /// Usually supplied by the environment at run start instead.
    #[serde(default)]
    pub build_number: Option<u64>,

    /// Seconds a running command gets to exit after an abort before it is killed.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,

    /// Every credential name operations may request.
    #[serde(default)]
    pub credentials: BTreeSet<String>,
}

fn default_abort_grace_secs() -> u64 {
    10
}

/// `[analysis]` section: how to reach the static-analysis server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Submit command; may use `{source_ref}` and `{project_key}`.
    pub submit: Vec<String>,

    /// Verdict query command; may use `{correlation_id}`.
    pub query: Vec<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub warn_policy: WarnPolicy,

    /// Limit for each submit/query command invocation.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_command_timeout_secs() -> u64 {
    60
}

/// `[registry]` section: where artifacts are published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub repository: String,

    /// Push command, run once per tag.
    pub push: Vec<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

/// `[notification]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default)]
    pub sender: Option<String>,

    #[serde(default)]
    pub subject_prefix: String,

    /// Transport command receiving the body on stdin. Logged when absent.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// `[[hooks]]` entry: a command run after the stage sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HookDefinition {
    pub name: String,
    pub condition: HookCondition,
    pub command: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

/// Validated, immutable configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    pub build_number: u64,
    pub abort_grace: Duration,
    pub credentials: BTreeSet<String>,
    pub analysis: Option<AnalysisConfig>,
    pub registry: Option<RegistryConfig>,
    pub notification: Option<NotificationConfig>,
    pub hooks: Vec<HookDefinition>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, build_number: u64) -> Self {
        Self {
            name: name.into(),
            build_number,
            abort_grace: Duration::from_secs(default_abort_grace_secs()),
            credentials: BTreeSet::new(),
            analysis: None,
            registry: None,
            notification: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_credential(mut self, name: impl Into<String>) -> Self {
        self.credentials.insert(name.into());
        self
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_notification(mut self, notification: NotificationConfig) -> Self {
        self.notification = Some(notification);
        self
    }

    pub fn warn_policy(&self) -> WarnPolicy {
        self.analysis
            .as_ref()
            .map(|a| a.warn_policy)
            .unwrap_or_default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.analysis
                .as_ref()
                .map(|a| a.poll_interval_secs)
                .unwrap_or_else(default_poll_interval_secs),
        )
    }
}

/// Declarative pipeline description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub analysis: Option<AnalysisConfig>,

    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    #[serde(default)]
    pub notification: Option<NotificationConfig>,

    #[serde(default)]
    pub stages: Vec<Stage>,

    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
}

impl PipelineDefinition {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Build a validated pipeline. `build_number` overrides the file's value.
    pub fn into_pipeline(self, build_number: Option<u64>) -> Result<Pipeline, ConfigError> {
        let build_number = build_number
            .or(self.pipeline.build_number)
            .ok_or(ConfigError::MissingBuildNumber)?;
        let config = PipelineConfig {
            name: self.pipeline.name,
            build_number,
            abort_grace: Duration::from_secs(self.pipeline.abort_grace_secs),
            credentials: self.pipeline.credentials,
            analysis: self.analysis,
            registry: self.registry,
            notification: self.notification,
            hooks: self.hooks,
        };
        Pipeline::new(config, self.stages)
    }
}

/// Check every cross reference between `config` and `stages`.
pub fn validate(config: &PipelineConfig, stages: &[Stage]) -> Result<(), ConfigError> {
    if config.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if let Some(analysis) = &config.analysis {
        if analysis.submit.is_empty() || analysis.query.is_empty() {
            return Err(ConfigError::EmptyCommand("analysis".to_string()));
        }
    }
    if let Some(registry) = &config.registry {
        if registry.push.is_empty() {
            return Err(ConfigError::EmptyCommand("registry push".to_string()));
        }
    }
    if let Some(command) = config.notification.as_ref().and_then(|n| n.command.as_ref()) {
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand("notification".to_string()));
        }
    }
    for hook in &config.hooks {
        if hook.command.is_empty() {
            return Err(ConfigError::EmptyCommand(format!("hook '{}'", hook.name)));
        }
    }

    let mut names = HashSet::new();
    let mut built: HashSet<String> = HashSet::new();

    for stage in stages {
        if !names.insert(stage.name.as_str()) {
            return Err(ConfigError::DuplicateStage(stage.name.clone()));
        }

        let mut stage_built = HashSet::new();
        let body = stage.operations.iter().map(|op| (op, false));
        let post = stage.post.iter().map(|p| (&p.operation, true));

        for (op, is_post) in body.chain(post) {
            if op.name.trim().is_empty() {
                return Err(ConfigError::InvalidOperation {
                    stage: stage.name.clone(),
                    reason: "operation name must not be empty".to_string(),
                });
            }
            if let Some(field) = op.kind.unknown_keys().next() {
                return Err(ConfigError::UnknownField {
                    stage: stage.name.clone(),
                    operation: op.name.clone(),
                    field: field.to_string(),
                });
            }
            for requirement in &op.credentials {
                if !config.credentials.contains(&requirement.name) {
                    return Err(ConfigError::UndefinedCredential {
                        stage: stage.name.clone(),
                        operation: op.name.clone(),
                        name: requirement.name.clone(),
                    });
                }
            }
            match &op.kind {
                OperationKind::Command(command) => {
                    if command.program.trim().is_empty() {
                        return Err(ConfigError::InvalidOperation {
                            stage: stage.name.clone(),
                            reason: format!("operation '{}' has an empty program", op.name),
                        });
                    }
                    if let Some(OutputCapture::Artifact { name, .. }) = &command.capture {
                        stage_built.insert(name.clone());
                    }
                }
                OperationKind::QualityGate { .. } => {
                    if config.analysis.is_none() {
                        return Err(ConfigError::MissingSection {
                            stage: stage.name.clone(),
                            operation: op.name.clone(),
                            section: "analysis",
                        });
                    }
                }
                OperationKind::Publish { artifact, .. } => {
                    if config.registry.is_none() {
                        return Err(ConfigError::MissingSection {
                            stage: stage.name.clone(),
                            operation: op.name.clone(),
                            section: "registry",
                        });
                    }
                    // Parallel siblings give no ordering guarantee; post-actions
                    // run after the whole body.
                    let visible = built.contains(artifact)
                        || ((is_post || !stage.parallel) && stage_built.contains(artifact));
                    if !visible {
                        return Err(ConfigError::UnknownArtifact {
                            stage: stage.name.clone(),
                            artifact: artifact.clone(),
                        });
                    }
                }
            }
        }
        built.extend(stage_built);
    }
    Ok(())
}
