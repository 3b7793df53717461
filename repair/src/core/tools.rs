//! Tool schema advertised to the model.
//!
//! The schema is derived from a role's [`CommandPolicy`]: a `bash` tool when any
//! shell command is permitted, plus one tool per permitted terminal command.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::policy::{ANY_SHELL, CommandPolicy, is_terminal_word};
use crate::core::types::{EXIT_COMMAND, SUBMIT_COMMAND};

/// Name of the tool carrying arbitrary shell commands.
pub const BASH_TOOL: &str = "bash";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the call arguments.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolSchema {
    tools: Vec<ToolSpec>,
}

impl ToolSchema {
    pub fn for_policy(policy: &CommandPolicy) -> Self {
        let mut tools = Vec::new();
        if policy.allows_shell() {
            tools.push(ToolSpec {
                name: BASH_TOOL.to_string(),
                description: bash_description(policy),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "minLength": 1}
                    },
                    "required": ["command"],
                    "additionalProperties": false
                }),
            });
        }
        if policy.allows_terminal(SUBMIT_COMMAND) {
            tools.push(ToolSpec {
                name: SUBMIT_COMMAND.to_string(),
                description: "Finalize the work and submit the current repository diff as the patch."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": false
                }),
            });
        }
        if policy.allows_terminal(EXIT_COMMAND) {
            tools.push(ToolSpec {
                name: EXIT_COMMAND.to_string(),
                description: "End the session and hand over the closing analysis.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"}
                    },
                    "additionalProperties": false
                }),
            });
        }
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name.as_str()).collect()
    }
}

/// Structured call returned by a function-calling model transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

fn bash_description(policy: &CommandPolicy) -> String {
    let listed: Vec<&str> = policy
        .allowed()
        .filter(|word| *word != ANY_SHELL && !is_terminal_word(word))
        .collect();
    if policy.allowed().any(|word| word == ANY_SHELL) || listed.is_empty() {
        "Run a shell command in the repository sandbox.".to_string()
    } else {
        format!(
            "Run a shell command in the repository sandbox. Permitted commands: {}.",
            listed.join(", ")
        )
    }
}
