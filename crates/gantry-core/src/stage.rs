//! Stage and operation definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::outcome::StageStatus;
use crate::versioner::TagScheme;

/// An external command.
///
/// Arguments may contain `{placeholder}` tokens filled in by [`CommandSpec::render`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory (defaults to the current directory).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Data written to the child's stdin.
    #[serde(default)]
    pub stdin: Option<String>,

    /// What the command produces besides its output.
    #[serde(default)]
    pub capture: Option<OutputCapture>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            stdin: None,
            capture: None,
        }
    }

    /// Build from an argv vector (first element is the executable).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    pub fn with_capture(mut self, capture: OutputCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Substitute `{key}` tokens in the program, arguments, and stdin.
    pub fn render(&self, vars: &[(&str, &str)]) -> Self {
        let fill = |text: &str| {
            vars.iter().fold(text.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        };
        Self {
            program: fill(&self.program),
            args: self.args.iter().map(|a| fill(a)).collect(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            stdin: self.stdin.as_deref().map(fill),
            capture: self.capture.clone(),
        }
    }

    /// Human-readable command line for logs and reports.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output a command declares besides its captured text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputCapture {
    /// A report file written by the tool (e.g. a scan report).
    Report { path: PathBuf },

    /// A build artifact. Its content identity is the SHA-256 of `digest_file`
    /// when given. Otherwise the last non-empty output line is the artifact's
    /// reference, kept verbatim for the push command.
    Artifact {
        name: String,
        #[serde(default)]
        digest_file: Option<PathBuf>,
    },
}

/// A credential an operation needs, and how a command receives it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialRequirement {
    /// Logical credential name.
    pub name: String,

    /// Environment variable the secret is exposed through.
    #[serde(default)]
    pub env_var: Option<String>,
}

/// What an operation does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Run an external command.
    Command(CommandSpec),

    /// Submit an analysis and wait for its quality gate verdict.
    QualityGate {
        source_ref: String,
        project_key: String,
        /// Keys no field claimed. Rejected by validation.
        #[serde(flatten)]
        extra: BTreeMap<String, toml::Value>,
    },

    /// Tag a previously built artifact and push every tag.
    Publish {
        artifact: String,
        #[serde(default)]
        scheme: TagScheme,
        #[serde(flatten)]
        extra: BTreeMap<String, toml::Value>,
    },
}

impl OperationKind {
    /// Keys of the definition that no field recognised. A command rejects
    /// them while parsing; the other kinds collect them here because they
    /// are flattened into [`Operation`].
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        let extra = match self {
            OperationKind::Command(_) => None,
            OperationKind::QualityGate { extra, .. } | OperationKind::Publish { extra, .. } => {
                Some(extra)
            }
        };
        extra.into_iter().flat_map(|e| e.keys().map(String::as_str))
    }
}

/// An atomic unit of external work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub name: String,

    #[serde(flatten)]
    pub kind: OperationKind,

    /// Wall-clock limit in seconds (0 = no limit).
    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default)]
    pub credentials: Vec<CredentialRequirement>,
}

impl Operation {
    pub fn new(name: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout_secs: 0,
            credentials: Vec::new(),
        }
    }

    pub fn command(name: impl Into<String>, command: CommandSpec) -> Self {
        Self::new(name, OperationKind::Command(command))
    }

    pub fn quality_gate(
        name: impl Into<String>,
        source_ref: impl Into<String>,
        project_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            OperationKind::QualityGate {
                source_ref: source_ref.into(),
                project_key: project_key.into(),
                extra: BTreeMap::new(),
            },
        )
    }

    pub fn publish(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::new(
            name,
            OperationKind::Publish {
                artifact: artifact.into(),
                scheme: TagScheme::default(),
                extra: BTreeMap::new(),
            },
        )
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Require credential `name`, exposed to commands as `env_var`.
    pub fn with_credential(mut self, name: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.credentials.push(CredentialRequirement {
            name: name.into(),
            env_var: Some(env_var.into()),
        });
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Condition under which a stage post-action runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostCondition {
    Always,
    Success,
    Failure,
}

impl PostCondition {
    pub fn matches(&self, status: StageStatus) -> bool {
        match self {
            PostCondition::Always => true,
            PostCondition::Success => status == StageStatus::Success,
            PostCondition::Failure => status == StageStatus::Failure,
        }
    }
}

/// Work run after a stage body, e.g. publishing a report or cleaning up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostAction {
    pub condition: PostCondition,

    #[serde(flatten)]
    pub operation: Operation,
}

/// A named step of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub name: String,

    #[serde(default)]
    pub operations: Vec<Operation>,

    #[serde(default)]
    pub post: Vec<PostAction>,

    /// Failure is recorded but does not halt the pipeline.
    #[serde(default)]
    pub best_effort: bool,

    /// Run the operations concurrently; the stage passes only if all pass.
    #[serde(default)]
    pub parallel: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            post: Vec::new(),
            best_effort: false,
            parallel: false,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_post(mut self, condition: PostCondition, operation: Operation) -> Self {
        self.post.push(PostAction {
            condition,
            operation,
        });
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Every operation of the stage, body first then post-actions.
    pub fn all_operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .chain(self.post.iter().map(|p| &p.operation))
    }
}
