//! Agent sessions: one role, one history partition, one way to reach the sandbox.

use std::sync::Arc;

use thiserror::Error;

use crate::core::history::{History, Partition};
use crate::core::types::AgentId;
use crate::io::config::RoleProfile;
use crate::io::sandbox::{EnvironmentBinding, EnvironmentRef, SharedEnvironment};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("session {agent_id} has neither an owned nor an injected environment")]
    NoEnvironment { agent_id: AgentId },
}

/// State a step engine runs under. Created per dispatch and dropped once its
/// result is extracted; the history partition outlives it.
#[derive(Debug)]
pub struct AgentSession<'h, 'env> {
    agent_id: AgentId,
    role_name: String,
    profile: RoleProfile,
    environment: Option<EnvironmentBinding<'env>>,
    partition: Partition<'h>,
}

impl<'h, 'env> AgentSession<'h, 'env> {
    pub fn new(
        history: &'h History,
        agent_id: AgentId,
        role_name: impl Into<String>,
        profile: RoleProfile,
        environment: Option<EnvironmentBinding<'env>>,
    ) -> Self {
        Self {
            partition: history.partition(agent_id.clone()),
            agent_id,
            role_name: role_name.into(),
            profile,
            environment,
        }
    }

    /// Session sharing an environment the coordinator already bootstrapped.
    pub fn injected(
        history: &'h History,
        agent_id: AgentId,
        role_name: impl Into<String>,
        profile: RoleProfile,
        environment: EnvironmentRef<'env>,
    ) -> Self {
        Self::new(
            history,
            agent_id,
            role_name,
            profile,
            Some(EnvironmentBinding::Injected(environment)),
        )
    }

    /// Single-agent session that bootstraps and later stops its own environment.
    pub fn owned(
        history: &'h History,
        agent_id: AgentId,
        role_name: impl Into<String>,
        profile: RoleProfile,
        environment: Arc<SharedEnvironment>,
    ) -> Self {
        Self::new(
            history,
            agent_id,
            role_name,
            profile,
            Some(EnvironmentBinding::Owned(environment)),
        )
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn profile(&self) -> &RoleProfile {
        &self.profile
    }

    pub fn owns_environment(&self) -> bool {
        self.environment
            .as_ref()
            .is_some_and(EnvironmentBinding::owns_environment)
    }

    pub fn environment(&self) -> Result<&EnvironmentBinding<'env>, SetupError> {
        self.environment
            .as_ref()
            .ok_or_else(|| SetupError::NoEnvironment {
                agent_id: self.agent_id.clone(),
            })
    }

    pub fn partition(&self) -> &Partition<'h> {
        &self.partition
    }
}
