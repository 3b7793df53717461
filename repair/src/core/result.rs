//! Agent and run results, and the operator-facing outcome of a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::history::Trajectory;
use crate::core::types::{AgentId, SessionStatus};

/// Artifact keys every [`AgentResult`] may carry.
pub mod artifact {
    pub const EXIT_STATUS: &str = "exit_status";
    pub const SUBMISSION: &str = "submission";
    pub const MODEL_CALLS: &str = "model_calls";
    pub const TOTAL_COST: &str = "total_cost";
    pub const STEPS: &str = "steps";
    pub const ERROR: &str = "error";
}

/// Outcome of one agent session, produced once at termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    pub status: SessionStatus,
    /// Substantial thoughts, in the order they were produced.
    pub evidence: Vec<String>,
    pub artifacts: BTreeMap<String, String>,
    /// Fraction of executed sandbox commands that exited 0.
    pub score: f64,
    pub trajectory: Trajectory,
}

impl AgentResult {
    /// Payload of the terminal action, if the session produced one.
    pub fn submission(&self) -> Option<&str> {
        self.artifacts
            .get(artifact::SUBMISSION)
            .map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Success
    }
}

/// Aggregate result of one coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub request_id: String,
    pub per_agent: BTreeMap<AgentId, AgentResult>,
    pub final_patch: Option<String>,
    pub validated: bool,
}

impl RunResult {
    pub fn outcome(&self) -> RunOutcome {
        match (&self.final_patch, self.validated) {
            (Some(_), true) => RunOutcome::Validated,
            (Some(_), false) => RunOutcome::Unvalidated,
            (None, _) => RunOutcome::NoPatch,
        }
    }
}

/// What the run produced, as reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A patch was produced by a successfully terminated final spoke.
    Validated,
    /// A patch exists but the final spoke did not terminate successfully.
    Unvalidated,
    /// The final spoke produced no patch.
    NoPatch,
}

impl RunOutcome {
    pub fn describe(self) -> &'static str {
        match self {
            RunOutcome::Validated => "patch produced and validated",
            RunOutcome::Unvalidated => "patch produced but could not be validated",
            RunOutcome::NoPatch => "no patch produced",
        }
    }
}
