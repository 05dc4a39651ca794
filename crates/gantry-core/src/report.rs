//! Run report: the diagnostic trail of one pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::Result;
use crate::gate::QualityGateResult;
use crate::hooks::HookCondition;
use crate::outcome::{Outcome, StageStatus};
use crate::runner::OperationResult;
use crate::stage::PostCondition;
use crate::versioner::TaggedArtifact;

/// Result of a stage post-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostActionRecord {
    pub condition: PostCondition,
    pub result: OperationResult,
}

/// What happened to one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    /// Zero-based position in the pipeline.
    pub position: usize,
    pub status: StageStatus,
    pub best_effort: bool,
    pub operations: Vec<OperationResult>,
    pub post_actions: Vec<PostActionRecord>,
    /// Why the stage failed or was interrupted.
    pub failure: Option<String>,
    pub duration_ms: u64,
}

impl StageRecord {
    pub fn skipped(name: impl Into<String>, position: usize, best_effort: bool) -> Self {
        Self {
            name: name.into(),
            position,
            status: StageStatus::Skipped,
            best_effort,
            operations: Vec::new(),
            post_actions: Vec::new(),
            failure: None,
            duration_ms: 0,
        }
    }

    /// The operation that decided a failed stage's status.
    pub fn failed_operation(&self) -> Option<&OperationResult> {
        self.operations.iter().find(|op| !op.passed())
    }
}

/// Result of a post-execution hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRecord {
    pub hook: String,
    pub condition: HookCondition,
    pub success: bool,
    pub error: Option<String>,
}

/// Full record of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub build_number: u64,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<StageRecord>,
    /// Latest quality gate verdict of the run, if a gate was evaluated.
    pub gate: Option<QualityGateResult>,
    /// Artifacts published during the run.
    pub artifacts: Vec<TaggedArtifact>,
    pub hooks: Vec<HookRecord>,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The stage that decided the outcome: first non-best-effort failure, or
    /// the stage interrupted by an abort.
    pub fn deciding_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|s| {
            s.status == StageStatus::Aborted || (s.status == StageStatus::Failure && !s.best_effort)
        })
    }

    /// Failures that were tolerated because the stage was best-effort.
    pub fn tolerated_failures(&self) -> impl Iterator<Item = &StageRecord> {
        self.stages
            .iter()
            .filter(|s| s.best_effort && s.status == StageStatus::Failure)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::OperationStatus;
    use std::time::Duration;

    fn stage(name: &str, position: usize, status: StageStatus, best_effort: bool) -> StageRecord {
        StageRecord {
            status,
            ..StageRecord::skipped(name, position, best_effort)
        }
    }

    fn report(stages: Vec<StageRecord>) -> PipelineReport {
        PipelineReport {
            run_id: Uuid::new_v4(),
            pipeline: "shop".to_string(),
            build_number: 42,
            outcome: Outcome::Failure,
            started_at: Utc::now(),
            duration_ms: 300,
            stages,
            gate: None,
            artifacts: Vec::new(),
            hooks: Vec::new(),
        }
    }

    #[test]
    fn test_report_counts() {
        let r = report(vec![
            stage("test", 0, StageStatus::Success, false),
            stage("scan", 1, StageStatus::Failure, true),
            stage("build", 2, StageStatus::Failure, false),
            stage("deploy", 3, StageStatus::Skipped, false),
        ]);
        assert_eq!(r.count(StageStatus::Success), 1);
        assert_eq!(r.count(StageStatus::Failure), 2);
        assert_eq!(r.count(StageStatus::Skipped), 1);
        assert_eq!(r.deciding_stage().unwrap().name, "build");
        assert_eq!(r.tolerated_failures().count(), 1);
    }

    #[test]
    fn test_failed_operation() {
        let mut s = stage("test", 0, StageStatus::Failure, false);
        s.operations
            .push(OperationResult::succeeded("compile", Duration::ZERO));
        let mut failed = OperationResult::succeeded("unit", Duration::ZERO);
        failed.status = OperationStatus::Failed;
        s.operations.push(failed);
        assert_eq!(s.failed_operation().unwrap().operation, "unit");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let r = report(vec![stage("test", 0, StageStatus::Success, false)]);
        r.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"outcome\": \"FAILURE\""));
        let back: PipelineReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.run_id, r.run_id);
    }
}
