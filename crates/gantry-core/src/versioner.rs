//! Artifact versioning and publishing.
//!
//! A build produces an [`Artifact`] (name + content identity). Before
//! publishing, [`ArtifactVersioner::tag`] assigns version tags: by default the
//! run's numeric build identifier and `latest`. Numeric tags are recorded in a
//! [`VersionLedger`] shared by every run of a pipeline lineage and can never be
//! claimed by a second run; `latest` is the only tag that moves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::credentials::CredentialBinding;
use crate::error::{GantryError, Result};
use crate::runner::{content_digest, CommandExecutor, Invocation};
use crate::stage::CommandSpec;

/// Output of a build operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    /// Content identity, e.g. `sha256:<hex>`.
    pub content_digest: String,
    /// Reference the build tool printed for its output (an image id, a file
    /// path), handed back to the push command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content_digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_digest: content_digest.into(),
            source: None,
        }
    }

    /// Artifact identified by the reference a build tool printed.
    ///
    /// A reference that already is a `sha256:` digest is the content identity
    /// as is; anything else is hashed.
    pub fn from_reference(name: impl Into<String>, reference: &str) -> Self {
        let digest = if is_sha256_digest(reference) {
            reference.to_string()
        } else {
            content_digest(reference.as_bytes())
        };
        Self {
            source: Some(reference.to_string()),
            ..Self::new(name, digest)
        }
    }

    /// What the push command receives as `{source}`.
    pub fn source_ref(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.content_digest)
    }
}

fn is_sha256_digest(text: &str) -> bool {
    text.strip_prefix("sha256:")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A version tag.
///
/// Ordering places numeric tags before `latest`, which is also the publish
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VersionTag {
    Build(u64),
    Latest,
}

impl VersionTag {
    pub fn is_reassignable(&self) -> bool {
        matches!(self, VersionTag::Latest)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionTag::Build(n) => write!(f, "{n}"),
            VersionTag::Latest => f.write_str("latest"),
        }
    }
}

impl From<VersionTag> for String {
    fn from(tag: VersionTag) -> Self {
        tag.to_string()
    }
}

impl TryFrom<String> for VersionTag {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value == "latest" {
            return Ok(VersionTag::Latest);
        }
        value
            .parse::<u64>()
            .map(VersionTag::Build)
            .map_err(|_| format!("invalid version tag '{value}'"))
    }
}

/// Which tags a build receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagScheme {
    /// The numeric build identifier and `latest`.
    #[default]
    BuildAndLatest,
    /// The numeric build identifier only.
    BuildOnly,
}

impl TagScheme {
    pub fn tags(&self, build_number: u64) -> BTreeSet<VersionTag> {
        let mut tags = BTreeSet::from([VersionTag::Build(build_number)]);
        if *self == TagScheme::BuildAndLatest {
            tags.insert(VersionTag::Latest);
        }
        tags
    }
}

/// An artifact with its assigned tags. Immutable: retagging yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedArtifact {
    pub artifact: Artifact,
    pub tags: BTreeSet<VersionTag>,
}

impl TaggedArtifact {
    /// `name:tag` references, numeric tags first.
    pub fn references(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.artifact.name, tag))
            .collect()
    }

    /// A new reference to the same content under `tags`.
    pub fn retag(&self, tags: BTreeSet<VersionTag>) -> TaggedArtifact {
        TaggedArtifact {
            artifact: self.artifact.clone(),
            tags,
        }
    }
}

/// Record of numeric tags claimed within one pipeline lineage.
#[derive(Debug)]
pub struct VersionLedger {
    lineage: String,
    claimed: Mutex<HashMap<(String, u64), Uuid>>,
}

impl VersionLedger {
    pub fn new(lineage: impl Into<String>) -> Self {
        Self {
            lineage: lineage.into(),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    pub fn lineage(&self) -> &str {
        &self.lineage
    }

    /// Claim `build_number` for `artifact` on behalf of `run_id`.
    /// Claiming again from the same run is a no-op.
    pub fn claim(&self, artifact: &str, build_number: u64, run_id: Uuid) -> Result<()> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        match claimed.get(&(artifact.to_string(), build_number)) {
            Some(owner) if *owner != run_id => Err(GantryError::TagReused {
                artifact: artifact.to_string(),
                build_number,
                run_id: *owner,
            }),
            Some(_) => Ok(()),
            None => {
                claimed.insert((artifact.to_string(), build_number), run_id);
                Ok(())
            }
        }
    }
}

/// Assigns tags to artifacts of one run.
#[derive(Debug, Clone)]
pub struct ArtifactVersioner {
    build_number: u64,
    run_id: Uuid,
    ledger: Arc<VersionLedger>,
}

impl ArtifactVersioner {
    pub fn new(build_number: u64, run_id: Uuid, ledger: Arc<VersionLedger>) -> Self {
        Self {
            build_number,
            run_id,
            ledger,
        }
    }

    pub fn build_number(&self) -> u64 {
        self.build_number
    }

    pub fn tag(&self, artifact: &Artifact, scheme: TagScheme) -> Result<TaggedArtifact> {
        self.ledger
            .claim(&artifact.name, self.build_number, self.run_id)?;
        Ok(TaggedArtifact {
            artifact: artifact.clone(),
            tags: scheme.tags(self.build_number),
        })
    }
}

/// Acknowledgement from a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub repository: String,
    pub references: Vec<String>,
    pub content_digest: String,
}

/// Package repository or container registry.
///
/// Implementations must make a publish appear atomic to consumers: once
/// `latest` resolves to new content, the numeric tag of the same run must
/// already resolve to it too.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn publish(
        &self,
        artifact: &TaggedArtifact,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<PublishReceipt>;
}

/// Registry reached through an external push command, run once per tag.
///
/// The command may use `{repository}`, `{name}`, `{tag}`, `{reference}`,
/// `{digest}` and `{source}` (the reference the build printed, or the digest
/// when it printed none). Numeric tags are pushed before `latest`, so a failure leaves
/// `latest` untouched.
pub struct CommandRegistry {
    executor: Arc<dyn CommandExecutor>,
    repository: String,
    push: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandRegistry {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        repository: impl Into<String>,
        push: CommandSpec,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            repository: repository.into(),
            push,
            timeout,
        }
    }
}

#[async_trait]
impl ArtifactRegistry for CommandRegistry {
    async fn publish(
        &self,
        artifact: &TaggedArtifact,
        credentials: &[CredentialBinding],
        abort: &AbortSignal,
    ) -> Result<PublishReceipt> {
        let mut references = Vec::with_capacity(artifact.tags.len());
        for tag in &artifact.tags {
            let tag = tag.to_string();
            let reference = format!("{}/{}:{}", self.repository, artifact.artifact.name, tag);
            let command = self.push.render(&[
                ("repository", self.repository.as_str()),
                ("name", artifact.artifact.name.as_str()),
                ("tag", tag.as_str()),
                ("reference", reference.as_str()),
                ("digest", artifact.artifact.content_digest.as_str()),
                ("source", artifact.artifact.source_ref()),
            ]);
            let result = self
                .executor
                .execute(Invocation {
                    operation: "registry-push",
                    command: &command,
                    timeout: self.timeout,
                    credentials,
                    abort,
                })
                .await;
            if abort.is_aborted() {
                return Err(GantryError::AbortRequested);
            }
            if !result.passed() {
                return Err(GantryError::OperationFailure {
                    operation: format!("push {reference}"),
                    reason: result.error.unwrap_or_else(|| "push failed".to_string()),
                });
            }
            info!(reference = %reference, "pushed");
            references.push(reference);
        }
        Ok(PublishReceipt {
            repository: self.repository.clone(),
            references,
            content_digest: artifact.artifact.content_digest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryRegistry;
    use crate::runner::ProcessExecutor;

    fn versioner(build: u64, ledger: &Arc<VersionLedger>) -> ArtifactVersioner {
        ArtifactVersioner::new(build, Uuid::new_v4(), Arc::clone(ledger))
    }

    #[test]
    fn test_default_scheme_tags() {
        let ledger = Arc::new(VersionLedger::new("shop"));
        let tagged = versioner(42, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let tags: Vec<String> = tagged.tags.iter().map(|t| t.to_string()).collect();
        assert_eq!(tags, vec!["42", "latest"]);
        assert_eq!(tagged.references(), vec!["app:42", "app:latest"]);
    }

    #[test]
    fn test_build_only_scheme() {
        let tags = TagScheme::BuildOnly.tags(7);
        assert_eq!(tags.len(), 1);
        assert!(tags.contains(&VersionTag::Build(7)));
    }

    #[test]
    fn test_numeric_tag_never_reused_across_runs() {
        let ledger = Arc::new(VersionLedger::new("shop"));
        let first = versioner(42, &ledger);
        let second = versioner(42, &ledger);
        first
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let err = second
            .tag(&Artifact::new("app", "sha256:bb"), TagScheme::default())
            .unwrap_err();
        assert!(matches!(err, GantryError::TagReused { build_number: 42, .. }));
    }

    #[test]
    fn test_same_run_may_retag() {
        let ledger = Arc::new(VersionLedger::new("shop"));
        let v = versioner(3, &ledger);
        let artifact = Artifact::new("app", "sha256:aa");
        v.tag(&artifact, TagScheme::default()).unwrap();
        v.tag(&artifact, TagScheme::BuildOnly).unwrap();
    }

    #[test]
    fn test_latest_is_reassignable() {
        let ledger = Arc::new(VersionLedger::new("shop"));
        let a = versioner(1, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let b = versioner(2, &ledger)
            .tag(&Artifact::new("app", "sha256:bb"), TagScheme::default())
            .unwrap();
        assert!(a.tags.contains(&VersionTag::Latest));
        assert!(b.tags.contains(&VersionTag::Latest));
        assert!(VersionTag::Latest.is_reassignable());
        assert!(!VersionTag::Build(1).is_reassignable());
    }

    #[test]
    fn test_retag_creates_new_reference() {
        let ledger = Arc::new(VersionLedger::new("shop"));
        let tagged = versioner(5, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let retagged = tagged.retag(BTreeSet::from([VersionTag::Build(5)]));
        assert_eq!(tagged.tags.len(), 2);
        assert_eq!(retagged.tags.len(), 1);
        assert_eq!(retagged.artifact, tagged.artifact);
    }

    #[test]
    fn test_version_tag_serde() {
        let json = serde_json::to_string(&VersionTag::Build(42)).unwrap();
        assert_eq!(json, "\"42\"");
        let tag: VersionTag = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(tag, VersionTag::Latest);
        assert!(serde_json::from_str::<VersionTag>("\"nightly\"").is_err());
    }

    #[tokio::test]
    async fn test_memory_registry_publishes_all_tags_together() {
        let registry = MemoryRegistry::new("registry.local/shop");
        let ledger = Arc::new(VersionLedger::new("shop"));
        let first = versioner(1, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let second = versioner(2, &ledger)
            .tag(&Artifact::new("app", "sha256:bb"), TagScheme::default())
            .unwrap();
        let abort = AbortSignal::never();
        registry.publish(&first, &[], &abort).await.unwrap();
        registry.publish(&second, &[], &abort).await.unwrap();

        assert_eq!(registry.resolve("app", "latest").as_deref(), Some("sha256:bb"));
        assert_eq!(registry.resolve("app", "2").as_deref(), Some("sha256:bb"));
        assert_eq!(registry.resolve("app", "1").as_deref(), Some("sha256:aa"));
    }

    #[tokio::test]
    async fn test_command_registry_pushes_numeric_before_latest() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pushes.log");
        let push = CommandSpec::new(
            "sh",
            ["-c", "echo {reference} >> pushes.log"],
        )
        .with_working_dir(dir.path());
        let registry = CommandRegistry::new(
            Arc::new(ProcessExecutor::default()),
            "registry.local/shop",
            push,
            Some(Duration::from_secs(10)),
        );
        let ledger = Arc::new(VersionLedger::new("shop"));
        let tagged = versioner(42, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let receipt = registry
            .publish(&tagged, &[], &AbortSignal::never())
            .await
            .unwrap();

        let pushed = std::fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = pushed.lines().collect();
        assert_eq!(
            lines,
            vec!["registry.local/shop/app:42", "registry.local/shop/app:latest"]
        );
        assert_eq!(receipt.references.len(), 2);
    }

    #[test]
    fn test_artifact_from_reference() {
        let image = Artifact::from_reference("app", "sha256:abc123");
        assert_eq!(image.content_digest, "sha256:abc123");
        assert_eq!(image.source_ref(), "sha256:abc123");

        let jar = Artifact::from_reference("app", "target/app-1.0.jar");
        assert_eq!(jar.content_digest, content_digest(b"target/app-1.0.jar"));
        assert_eq!(jar.source_ref(), "target/app-1.0.jar");

        assert!(!is_sha256_digest("sha256:"));
        assert!(!is_sha256_digest("sha256:xyz"));
    }

    #[tokio::test]
    async fn test_command_registry_pushes_built_source() {
        let dir = tempfile::tempdir().unwrap();
        let push = CommandSpec::new(
            "sh",
            ["-c", "echo {source} {reference} {digest} >> pushes.log"],
        )
        .with_working_dir(dir.path());
        let registry = CommandRegistry::new(
            Arc::new(ProcessExecutor::default()),
            "registry.local/shop",
            push,
            Some(Duration::from_secs(10)),
        );
        let ledger = Arc::new(VersionLedger::new("shop"));
        let tagged = versioner(5, &ledger)
            .tag(&Artifact::from_reference("app", "sha256:abc123"), TagScheme::BuildOnly)
            .unwrap();
        registry
            .publish(&tagged, &[], &AbortSignal::never())
            .await
            .unwrap();

        let pushed = std::fs::read_to_string(dir.path().join("pushes.log")).unwrap();
        assert_eq!(
            pushed.trim(),
            "sha256:abc123 registry.local/shop/app:5 sha256:abc123"
        );
    }

    #[tokio::test]
    async fn test_command_registry_failure_leaves_latest_unpushed() {
        let registry = CommandRegistry::new(
            Arc::new(ProcessExecutor::default()),
            "registry.local/shop",
            CommandSpec::new("false", Vec::<String>::new()),
            None,
        );
        let ledger = Arc::new(VersionLedger::new("shop"));
        let tagged = versioner(9, &ledger)
            .tag(&Artifact::new("app", "sha256:aa"), TagScheme::default())
            .unwrap();
        let err = registry
            .publish(&tagged, &[], &AbortSignal::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("app:9"));
    }
}
