//! Append-only step log shared by every session of a run.
//!
//! The log is one ordered store, but all access goes through agent-scoped views:
//! a [`Partition`] can only append records stamped with its own agent id and only
//! reads those records back. [`History::view`] copies one agent's records into an
//! immutable [`Trajectory`]. No API mutates or removes an appended record.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Action, AgentId, StepRole};

/// One immutable entry of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub agent_id: AgentId,
    pub role: StepRole,
    pub thought: Option<String>,
    pub action: Option<Action>,
    pub observation: Option<String>,
    /// Exit code of the sandbox command behind `observation`, when one ran.
    pub exit_code: Option<i32>,
    /// Raw message text: the model response for assistant/tool records, the
    /// rendered prompt for system/user records.
    pub response_raw: String,
    pub timestamp: DateTime<Utc>,
}

/// Record content before the partition stamps identity and time onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub role: StepRole,
    pub thought: Option<String>,
    pub action: Option<Action>,
    pub observation: Option<String>,
    pub exit_code: Option<i32>,
    pub response_raw: String,
}

impl NewRecord {
    pub fn system(text: impl Into<String>) -> Self {
        Self::message(StepRole::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::message(StepRole::User, text.into())
    }

    /// A completed propose/execute step.
    pub fn step(
        thought: Option<String>,
        action: Action,
        observation: String,
        exit_code: Option<i32>,
        response_raw: String,
    ) -> Self {
        Self {
            role: StepRole::Assistant,
            thought,
            action: Some(action),
            observation: Some(observation),
            exit_code,
            response_raw,
        }
    }

    /// Corrective record for output that could not be turned into an action.
    pub fn correction(response_raw: String, reason: String) -> Self {
        Self {
            role: StepRole::Tool,
            thought: None,
            action: None,
            observation: Some(reason),
            exit_code: None,
            response_raw,
        }
    }

    fn message(role: StepRole, text: String) -> Self {
        Self {
            role,
            thought: None,
            action: None,
            observation: None,
            exit_code: None,
            response_raw: text,
        }
    }
}

/// Shared, logically partitioned step log.
#[derive(Debug, Default)]
pub struct History {
    records: RwLock<Vec<StepRecord>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer/reader scoped to one agent.
    pub fn partition(&self, agent_id: AgentId) -> Partition<'_> {
        Partition {
            history: self,
            agent_id,
        }
    }

    /// Copy of every record produced by `agent_id`, in creation order.
    pub fn view(&self, agent_id: &AgentId) -> Trajectory {
        Trajectory {
            agent_id: agent_id.clone(),
            steps: self.filtered(agent_id),
        }
    }

    /// Total number of records across all partitions.
    pub fn len(&self) -> usize {
        self.read(|records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agent ids in order of their first record.
    pub fn agents(&self) -> Vec<AgentId> {
        self.read(|records| {
            let mut seen: Vec<AgentId> = Vec::new();
            for record in records {
                if !seen.contains(&record.agent_id) {
                    seen.push(record.agent_id.clone());
                }
            }
            seen
        })
    }

    fn filtered(&self, agent_id: &AgentId) -> Vec<StepRecord> {
        self.read(|records| {
            records
                .iter()
                .filter(|record| &record.agent_id == agent_id)
                .cloned()
                .collect()
        })
    }

    fn count_for(&self, agent_id: &AgentId) -> usize {
        self.read(|records| {
            records
                .iter()
                .filter(|record| &record.agent_id == agent_id)
                .count()
        })
    }

    fn push(&self, record: StepRecord) {
        // Records are never mutated after the push, so a poisoned lock still guards
        // a consistent prefix of the log.
        let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
        guard.push(record);
    }

    fn read<T>(&self, f: impl FnOnce(&[StepRecord]) -> T) -> T {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

/// Agent-scoped access to the [`History`].
#[derive(Debug)]
pub struct Partition<'h> {
    history: &'h History,
    agent_id: AgentId,
}

impl Partition<'_> {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Append a record owned by this partition's agent.
    pub fn append(&self, record: NewRecord) -> StepRecord {
        let stamped = StepRecord {
            agent_id: self.agent_id.clone(),
            role: record.role,
            thought: record.thought,
            action: record.action,
            observation: record.observation,
            exit_code: record.exit_code,
            response_raw: record.response_raw,
            timestamp: Utc::now(),
        };
        self.history.push(stamped.clone());
        stamped
    }

    /// This agent's records, in creation order.
    pub fn records(&self) -> Vec<StepRecord> {
        self.history.filtered(&self.agent_id)
    }

    pub fn len(&self) -> usize {
        self.history.count_for(&self.agent_id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable copy of one agent's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub agent_id: AgentId,
    pub steps: Vec<StepRecord>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Records produced by the model (completed steps and corrections).
    pub fn model_turns(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|step| matches!(step.role, StepRole::Assistant | StepRole::Tool))
    }
}
