//! Action parsing strategies.
//!
//! Every strategy turns one model output into exactly one [`ParsedAction`] or a
//! [`ParseFailure`]. Parsers are pure: the same output, policy and schema always give
//! the same answer. Policy is enforced here, before anything reaches the sandbox.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::policy::{CommandPolicy, command_words, is_terminal_word};
use crate::core::tools::{BASH_TOOL, FunctionCall, ToolSchema};
use crate::core::types::{Action, EXIT_COMMAND, SUBMIT_COMMAND};

/// Why an output could not become an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    /// The output was malformed for the active strategy.
    #[error("malformed output: {reason}")]
    Syntax { reason: String },
    /// The output was well formed but names a command the role may not run.
    #[error("command not permitted: '{command}'")]
    PolicyViolation { command: String },
}

impl ParseFailure {
    fn syntax(reason: impl Into<String>) -> Self {
        ParseFailure::Syntax {
            reason: reason.into(),
        }
    }
}

/// Successfully parsed model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub thought: Option<String>,
    pub action: Action,
}

/// Raw material handed to a parser.
#[derive(Debug, Clone, Copy)]
pub struct ModelOutput<'a> {
    pub raw_text: &'a str,
    pub function_call: Option<&'a FunctionCall>,
}

/// Role context a parser checks against.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub policy: &'a CommandPolicy,
    pub tools: &'a ToolSchema,
}

pub trait ActionParser {
    fn parse(
        &self,
        output: &ModelOutput<'_>,
        context: &ParseContext<'_>,
    ) -> Result<ParsedAction, ParseFailure>;
}

/// Strategy selector used in role configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    FunctionCall,
    #[default]
    ThoughtAction,
    ActionOnly,
}

impl ParserKind {
    pub fn parser(self) -> &'static dyn ActionParser {
        match self {
            ParserKind::FunctionCall => &FunctionCallParser,
            ParserKind::ThoughtAction => &ThoughtActionParser,
            ParserKind::ActionOnly => &ActionOnlyParser,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParserKind::FunctionCall => "function_call",
            ParserKind::ThoughtAction => "thought_action",
            ParserKind::ActionOnly => "action_only",
        }
    }

    /// Whether the model transport should be asked for structured tool calls.
    pub fn wants_tool_calls(self) -> bool {
        self == ParserKind::FunctionCall
    }
}

/// Maps a structured tool call from the transport.
#[derive(Debug, Clone, Copy)]
pub struct FunctionCallParser;

impl ActionParser for FunctionCallParser {
    fn parse(
        &self,
        output: &ModelOutput<'_>,
        context: &ParseContext<'_>,
    ) -> Result<ParsedAction, ParseFailure> {
        let call = output
            .function_call
            .ok_or_else(|| ParseFailure::syntax("response contained no tool call"))?;

        let action = match call.name.as_str() {
            BASH_TOOL => {
                let command = call
                    .arguments
                    .get("command")
                    .and_then(|value| value.as_str())
                    .map(str::trim)
                    .unwrap_or_default();
                if command.is_empty() {
                    return Err(ParseFailure::syntax(
                        "bash tool call requires a non-empty 'command' argument",
                    ));
                }
                action_from_text(command)?
            }
            SUBMIT_COMMAND => Action::Submit,
            EXIT_COMMAND => Action::Exit {
                message: call
                    .arguments
                    .get("message")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            },
            other => {
                return Err(ParseFailure::syntax(format!(
                    "unknown tool '{other}' (available: {})",
                    context.tools.names().join(", ")
                )));
            }
        };

        if let Some(tool) = context.tools.get(&call.name) {
            validate_arguments(&call.name, &tool.parameters, &call.arguments)?;
        }
        check_policy(context.policy, &action)?;

        Ok(ParsedAction {
            thought: non_empty(output.raw_text),
            action,
        })
    }
}

/// Extracts a single fenced action block from free text.
#[derive(Debug, Clone, Copy)]
pub struct ThoughtActionParser;

static ACTION_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n(.*?)```").expect("action block regex"));

impl ActionParser for ThoughtActionParser {
    fn parse(
        &self,
        output: &ModelOutput<'_>,
        context: &ParseContext<'_>,
    ) -> Result<ParsedAction, ParseFailure> {
        let text = output.raw_text;
        let blocks: Vec<_> = ACTION_BLOCK_RE.captures_iter(text).collect();
        let block = match blocks.as_slice() {
            [] => {
                return Err(ParseFailure::syntax(
                    "no action block found; put exactly one command inside a ``` fenced block",
                ));
            }
            [only] => only,
            many => {
                return Err(ParseFailure::syntax(format!(
                    "found {} action blocks; issue exactly one command per response",
                    many.len()
                )));
            }
        };

        let (Some(whole), Some(inner)) = (block.get(0), block.get(1)) else {
            return Err(ParseFailure::syntax("action block could not be read"));
        };
        let command = inner.as_str().trim();
        if command.is_empty() {
            return Err(ParseFailure::syntax("action block is empty"));
        }
        let action = action_from_text(command)?;
        check_policy(context.policy, &action)?;

        let thought = format!("{}\n{}", &text[..whole.start()], &text[whole.end()..]);
        Ok(ParsedAction {
            thought: non_empty(&thought),
            action,
        })
    }
}

/// Treats the whole output as the action.
#[derive(Debug, Clone, Copy)]
pub struct ActionOnlyParser;

impl ActionParser for ActionOnlyParser {
    fn parse(
        &self,
        output: &ModelOutput<'_>,
        context: &ParseContext<'_>,
    ) -> Result<ParsedAction, ParseFailure> {
        let command = output.raw_text.trim();
        if command.is_empty() {
            return Err(ParseFailure::syntax("empty output"));
        }
        let action = action_from_text(command)?;
        check_policy(context.policy, &action)?;
        Ok(ParsedAction {
            thought: None,
            action,
        })
    }
}

/// Interpret command text, recognizing terminal commands.
///
/// Everything after a leading `exit` is its message, verbatim. A terminal word in
/// any later segment of a shell line is rejected as malformed.
pub fn action_from_text(text: &str) -> Result<Action, ParseFailure> {
    let text = text.trim();
    let first = text.split_whitespace().next().unwrap_or_default();
    match first {
        SUBMIT_COMMAND if text == SUBMIT_COMMAND => Ok(Action::Submit),
        SUBMIT_COMMAND => Err(ParseFailure::syntax(
            "'submit' takes no arguments and must be issued on its own",
        )),
        EXIT_COMMAND => Ok(Action::Exit {
            message: text[EXIT_COMMAND.len()..].trim().to_string(),
        }),
        _ => {
            let words = command_words(text);
            if words.len() > 1 && words.iter().any(|word| is_terminal_word(word)) {
                return Err(ParseFailure::syntax(
                    "terminal commands ('submit', 'exit') must be issued on their own",
                ));
            }
            Ok(Action::Shell {
                command: text.to_string(),
            })
        }
    }
}

fn check_policy(policy: &CommandPolicy, action: &Action) -> Result<(), ParseFailure> {
    policy
        .check(action)
        .map_err(|command| ParseFailure::PolicyViolation { command })
}

fn validate_arguments(
    tool: &str,
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), ParseFailure> {
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| ParseFailure::syntax(format!("tool '{tool}' has an invalid schema: {err}")))?;
    let messages: Vec<String> = validator
        .iter_errors(arguments)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(ParseFailure::syntax(format!(
        "arguments for '{tool}' do not match its schema: {}",
        messages.join("; ")
    )))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
