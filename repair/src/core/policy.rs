//! Per-role command policy.
//!
//! A policy is the set of command words a role may issue. `*` admits any
//! non-terminal shell command; terminal commands (`submit`, `exit`) must always be
//! listed explicitly.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{Action, EXIT_COMMAND, Role, SUBMIT_COMMAND};

/// Wildcard entry admitting any non-terminal shell command.
pub const ANY_SHELL: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandPolicy {
    allowed: BTreeSet<String>,
}

impl CommandPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Default capability set of a role.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Investigator => Self::new([ANY_SHELL, EXIT_COMMAND]),
            Role::Implementer => Self::new([ANY_SHELL, SUBMIT_COMMAND]),
        }
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Whether any shell command at all can pass this policy.
    pub fn allows_shell(&self) -> bool {
        self.allowed
            .iter()
            .any(|word| word != SUBMIT_COMMAND && word != EXIT_COMMAND)
    }

    pub fn allows_terminal(&self, word: &str) -> bool {
        self.allowed.contains(word)
    }

    /// Check an action, returning the first command word that is not permitted.
    pub fn check(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::Submit => self.require_listed(SUBMIT_COMMAND),
            Action::Exit { .. } => self.require_listed(EXIT_COMMAND),
            Action::Shell { command } => {
                for word in command_words(command) {
                    if !self.allows_word(&word) {
                        return Err(word);
                    }
                }
                Ok(())
            }
        }
    }

    fn require_listed(&self, word: &str) -> Result<(), String> {
        if self.allowed.contains(word) {
            Ok(())
        } else {
            Err(word.to_string())
        }
    }

    fn allows_word(&self, word: &str) -> bool {
        if is_terminal_word(word) {
            return self.allowed.contains(word);
        }
        self.allowed.contains(ANY_SHELL) || self.allowed.contains(word)
    }
}

pub fn is_terminal_word(word: &str) -> bool {
    word == SUBMIT_COMMAND || word == EXIT_COMMAND
}

/// Leading command word of every segment of a shell command line.
///
/// Segments are separated by `&&`, `||`, `;`, `|`, `&` and newlines outside quotes.
/// Leading `NAME=value` assignments are skipped.
pub fn command_words(command: &str) -> Vec<String> {
    segments(command)
        .iter()
        .filter_map(|segment| {
            segment
                .split_whitespace()
                .find(|token| !is_assignment(token))
                .map(|token| token.trim_start_matches(['(', '{']).to_string())
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Split a command line at control operators, leaving quoted text intact.
fn segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut prev = ' ';
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
                prev = c;
                continue;
            }
            (Some(open), _) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            // `2>&1` and `&>` are redirections, not separators.
            (None, '&') if prev == '>' || prev == '<' || chars.peek() == Some(&'>') => {}
            (None, ';' | '|' | '&' | '\n') => {
                segments.push(std::mem::take(&mut current));
                prev = c;
                continue;
            }
            (None, _) => {}
        }
        current.push(c);
        prev = c;
    }
    segments.push(current);
    segments
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(command: &str) -> Action {
        Action::Shell {
            command: command.to_string(),
        }
    }

    #[test]
    fn splits_compound_commands() {
        let words = command_words("cd src && FOO=1 grep -rn x . | head; python repro.py\nls");
        assert_eq!(words, vec!["cd", "grep", "head", "python", "ls"]);
    }

    #[test]
    fn quoted_operators_do_not_split() {
        let words = command_words("grep -E 'a|b;c' f.py && echo \"x && y\" 2>&1 | sort &> log");
        assert_eq!(words, vec!["grep", "echo", "sort"]);

        let policy = CommandPolicy::new(["grep"]);
        assert!(policy.check(&shell("grep -E 'a|b' f")).is_ok());
    }

    #[test]
    fn investigator_cannot_submit() {
        let policy = CommandPolicy::for_role(Role::Investigator);
        assert_eq!(policy.check(&Action::Submit), Err("submit".to_string()));
        assert!(
            policy
                .check(&Action::Exit {
                    message: String::new()
                })
                .is_ok()
        );
        assert!(policy.check(&shell("grep -rn foo .")).is_ok());
    }

    #[test]
    fn implementer_can_submit_but_not_exit() {
        let policy = CommandPolicy::for_role(Role::Implementer);
        assert!(policy.check(&Action::Submit).is_ok());
        assert!(
            policy
                .check(&Action::Exit {
                    message: "bye".to_string()
                })
                .is_err()
        );
    }

    #[test]
    fn explicit_list_rejects_unlisted_segment() {
        let policy = CommandPolicy::new(["cat", "grep"]);
        assert!(policy.check(&shell("cat a.py | grep def")).is_ok());
        assert_eq!(
            policy.check(&shell("cat a.py && rm -rf /")),
            Err("rm".to_string())
        );
        assert!(policy.allows_shell());
    }

    #[test]
    fn wildcard_does_not_admit_terminal_words() {
        let policy = CommandPolicy::new([ANY_SHELL]);
        assert_eq!(policy.check(&shell("submit")), Err("submit".to_string()));
        assert!(!policy.allows_terminal("exit"));
    }

    #[test]
    fn terminal_only_policy_has_no_shell() {
        let policy = CommandPolicy::new([SUBMIT_COMMAND]);
        assert!(!policy.allows_shell());
    }
}
