//! Shared deterministic types for the repair core.
//!
//! These types define stable contracts between the engine, the coordinator and
//! their collaborators. They hold no I/O handles and serialize deterministically.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one agent session (`<request_id>_<spoke name>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of a spoke dispatched for `request_id`.
    pub fn for_spoke(request_id: &str, spoke_name: &str) -> Self {
        Self(format!("{request_id}_{spoke_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Specialization of a spoke.
///
/// The role fixes the default capability set (allowed commands, templates and
/// ceilings). External configuration is parsed into this closed set at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reads, searches and reproduces; never finalizes a patch.
    Investigator,
    /// Edits the repository and is the only role allowed to submit a patch.
    Implementer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Investigator => "investigator",
            Role::Implementer => "implementer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message role of a step record (and of the prompt message it rebuilds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Terminal state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A terminal action executed successfully.
    Success,
    /// Cumulative model cost reached the session's cost ceiling.
    CostExceeded,
    /// The session executed its maximum number of steps.
    StepExceeded,
    /// The model kept producing unparseable output past the retry ceiling.
    ParseExhausted,
    /// The model transport failed past the retry ceiling.
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Success => "success",
            SessionStatus::CostExceeded => "cost_exceeded",
            SessionStatus::StepExceeded => "step_exceeded",
            SessionStatus::ParseExhausted => "parse_exhausted",
            SessionStatus::Error => "error",
        }
    }

    /// Operator-facing explanation; every status maps to a distinct message.
    pub fn describe(self) -> &'static str {
        match self {
            SessionStatus::Success => "agent completed with a terminal action",
            SessionStatus::CostExceeded => "agent stopped: model cost ceiling reached",
            SessionStatus::StepExceeded => "agent stopped: step ceiling reached",
            SessionStatus::ParseExhausted => {
                "agent stopped: model output could not be parsed after repeated corrections"
            }
            SessionStatus::Error => "agent stopped: model transport failed after retries",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured command produced by the action parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Arbitrary shell command run in the sandbox.
    Shell { command: String },
    /// Finalize: collect the repository diff as the session's patch.
    Submit,
    /// End an analysis session, carrying its closing message.
    Exit { message: String },
}

/// Command word of the `submit` terminal action.
pub const SUBMIT_COMMAND: &str = "submit";
/// Command word of the `exit` terminal action.
pub const EXIT_COMMAND: &str = "exit";

/// Whether `name` can be used as a single path component: non-empty `[A-Za-z0-9_-]`.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Submit | Action::Exit { .. })
    }

    /// Text form as it would appear in a model response.
    pub fn render(&self) -> String {
        match self {
            Action::Shell { command } => command.clone(),
            Action::Submit => SUBMIT_COMMAND.to_string(),
            Action::Exit { message } if message.is_empty() => EXIT_COMMAND.to_string(),
            Action::Exit { message } => format!("{EXIT_COMMAND} {message}"),
        }
    }
}

/// Token accounting reported by the model transport for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost of the call in the model's billing unit (USD by convention).
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_names_are_single_path_components() {
        assert!(is_safe_name("r1_investigator-2"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../x"));
        assert!(!is_safe_name("a/b"));
    }

    #[test]
    fn spoke_ids_join_request_and_name() {
        let id = AgentId::for_spoke("a1b2c3", "investigator");
        assert_eq!(id.as_str(), "a1b2c3_investigator");
    }

    #[test]
    fn statuses_serialize_as_snake_case() {
        let json = serde_json::to_string(&SessionStatus::ParseExhausted).expect("json");
        assert_eq!(json, "\"parse_exhausted\"");
    }

    #[test]
    fn status_messages_are_distinct() {
        let all = [
            SessionStatus::Success,
            SessionStatus::CostExceeded,
            SessionStatus::StepExceeded,
            SessionStatus::ParseExhausted,
            SessionStatus::Error,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.describe(), b.describe());
            }
        }
    }

    #[test]
    fn exit_action_renders_message() {
        let action = Action::Exit {
            message: "done".to_string(),
        };
        assert_eq!(action.render(), "exit done");
        assert!(action.is_terminal());
        assert!(
            !Action::Shell {
                command: "ls".to_string()
            }
            .is_terminal()
        );
    }
}
