//! Pipeline outcome and stage status.
//!
//! The outcome of a run lives in a [`RunState`] owned by the executor for that
//! run; there is no process-wide state, so concurrent runs cannot interfere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall pipeline outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
}

impl Outcome {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Failure | Outcome::Aborted)
    }

    /// Whether the run has been halted (no further stage body may execute).
    pub fn is_halted(&self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Aborted)
    }

    fn can_transition_to(self, next: Outcome) -> bool {
        matches!(
            (self, next),
            (Outcome::Pending, Outcome::Running)
                | (Outcome::Pending, Outcome::Aborted)
                | (Outcome::Running, Outcome::Success)
                | (Outcome::Running, Outcome::Failure)
                | (Outcome::Running, Outcome::Aborted)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pending => "PENDING",
            Outcome::Running => "RUNNING",
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Terminal status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failure,
    Skipped,
    /// The stage was interrupted by an abort request.
    Aborted,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Success => "SUCCESS",
            StageStatus::Failure => "FAILURE",
            StageStatus::Skipped => "SKIPPED",
            StageStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Monotonic outcome cell for one pipeline run.
#[derive(Debug)]
pub struct RunState {
    outcome: Outcome,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            outcome: Outcome::Pending,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Apply a transition. Returns `false` (and leaves the state untouched)
    /// when the transition would move backwards or out of a terminal state.
    pub(crate) fn transition(&mut self, next: Outcome) -> bool {
        if self.outcome.can_transition_to(next) {
            self.outcome = next;
            true
        } else {
            false
        }
    }
}
