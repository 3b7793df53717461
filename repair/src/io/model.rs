//! Model client abstraction.
//!
//! The [`ModelClient`] trait decouples the step engine from the actual model
//! transport. [`CommandModel`] talks to any program that speaks a small JSON protocol
//! on stdin/stdout; tests use scripted clients that return predetermined responses.

use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::tools::{FunctionCall, ToolSchema};
use crate::core::types::{StepRole, TokenUsage};
use crate::io::process::run_bounded;

/// Exit code a model program uses to signal throttling (`EX_TEMPFAIL`).
pub const RATE_LIMIT_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: StepRole,
    pub content: String,
}

impl Message {
    pub fn new(role: StepRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Model parameters forwarded verbatim to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub name: String,
    pub temperature: f64,
    pub max_output_tokens: Option<u32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            temperature: 0.0,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    /// Tool schema for function-calling transports; empty for text strategies.
    pub tools: ToolSchema,
    pub params: ModelParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub action: Option<FunctionCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(raw_text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            raw_text: raw_text.into(),
            action: None,
            usage,
        }
    }
}

/// Transport failures. Both variants are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl ModelError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimit { retry_after, .. } => *retry_after,
            ModelError::Transport(_) => None,
        }
    }
}

/// Abstraction over model transports.
pub trait ModelClient {
    fn query(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

impl<M: ModelClient + ?Sized> ModelClient for &M {
    fn query(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        (**self).query(request)
    }
}

/// Model client that spawns a program per query.
///
/// The request is written to the program's stdin as JSON; the program must print a
/// single JSON [`ModelResponse`] on stdout. Exit code 75 means "rate limited"; any
/// other non-zero exit, a timeout or unparseable output is a transport error.
#[derive(Debug, Clone)]
pub struct CommandModel {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandModel {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(10 * 60),
            output_limit_bytes: 4_000_000,
        }
    }
}

impl ModelClient for CommandModel {
    #[instrument(skip_all, fields(program = %self.program, messages = request.messages.len()))]
    fn query(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ModelError::Transport(format!("serialize request: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_bounded(cmd, Some(&payload), self.timeout, self.output_limit_bytes)
            .map_err(|e| ModelError::Transport(format!("{e:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model program timed out");
            return Err(ModelError::Transport(format!(
                "model program timed out after {:?}",
                self.timeout
            )));
        }
        let code = output.exit_code();
        if code == RATE_LIMIT_EXIT_CODE {
            return Err(ModelError::RateLimit {
                message: output.stderr_text().trim().to_string(),
                retry_after: None,
            });
        }
        if code != 0 {
            return Err(ModelError::Transport(format!(
                "model program exited with {code}: {}",
                output.stderr_text().trim()
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(ModelError::Transport(format!(
                "model response exceeded {} bytes",
                self.output_limit_bytes
            )));
        }

        let response: ModelResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| ModelError::Transport(format!("parse model response: {e}")))?;
        debug!(
            cost = response.usage.cost,
            has_action = response.action.is_some(),
            "model responded"
        );
        Ok(response)
    }
}
