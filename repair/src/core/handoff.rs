//! Deterministic findings extraction from a finished spoke.
//!
//! A [`HandoffDocument`] is the only information one spoke passes to the next. It is
//! built from the spoke's [`AgentResult`] with fixed keyword heuristics and always has
//! the same six sections; a section with no findings renders as `(none found)` and
//! marks the whole document incomplete. Extraction never fails.

use serde::{Deserialize, Serialize};

use crate::core::result::AgentResult;
use crate::core::types::{AgentId, SessionStatus};

const RULE: &str = "============================================================";
const NONE_FOUND: &str = "(none found)";

const MAX_FILES: usize = 5;
const MAX_CAUSES: usize = 3;
const MAX_ERRORS: usize = 3;
const MAX_REPRODUCTION: usize = 2;
const FINAL_THOUGHTS: usize = 3;

const ERROR_EXCERPT_CHARS: usize = 500;
const REPRO_ACTION_CHARS: usize = 150;
const REPRO_OUTPUT_CHARS: usize = 300;

/// Thoughts at least this long count as substantial.
pub const SUBSTANTIAL_THOUGHT_CHARS: usize = 21;

const FILE_HINTS: [&str; 6] = ["file:", "in file", ".py", ".js", ".java", ".go"];
const CAUSE_HINTS: [&str; 5] = ["root cause", "because", "issue is", "bug is", "problem is"];
const ERROR_HINTS: [&str; 4] = ["error", "exception", "traceback", "failed"];
const ERROR_OUTPUT_HINTS: [&str; 3] = ["error:", "traceback", "exception:"];
const REPRO_HINT: &str = "reproduce";

/// The six fixed sections, in rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffSection {
    ProblemLocation,
    RootCause,
    Errors,
    Reproduction,
    FinalAnalysis,
    ExitStatus,
}

impl HandoffSection {
    pub const ALL: [HandoffSection; 6] = [
        HandoffSection::ProblemLocation,
        HandoffSection::RootCause,
        HandoffSection::Errors,
        HandoffSection::Reproduction,
        HandoffSection::FinalAnalysis,
        HandoffSection::ExitStatus,
    ];

    pub fn heading(self) -> &'static str {
        match self {
            HandoffSection::ProblemLocation => "1. PROBLEM LOCATION",
            HandoffSection::RootCause => "2. ROOT CAUSE",
            HandoffSection::Errors => "3. ERRORS OBSERVED",
            HandoffSection::Reproduction => "4. REPRODUCTION EVIDENCE",
            HandoffSection::FinalAnalysis => "5. FINAL ANALYSIS",
            HandoffSection::ExitStatus => "6. EXIT STATUS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffDocument {
    pub spoke: String,
    pub agent_id: AgentId,
    pub status: SessionStatus,
    pub problem_location: Vec<String>,
    pub root_cause: Vec<String>,
    pub errors: Vec<String>,
    pub reproduction: Vec<String>,
    pub final_analysis: Vec<String>,
    pub exit_status: String,
}

impl HandoffDocument {
    /// Extract findings from a terminated spoke.
    pub fn extract(spoke: &str, result: &AgentResult) -> Self {
        let mut files = Vec::new();
        let mut causes = Vec::new();
        let mut errors = Vec::new();
        let mut reproduction = Vec::new();

        for step in &result.trajectory.steps {
            if let Some(thought) = step.thought.as_deref().map(str::trim)
                && !thought.is_empty()
            {
                let lower = thought.to_lowercase();
                if contains_any(&lower, &FILE_HINTS) {
                    files.push(thought.to_string());
                }
                if contains_any(&lower, &CAUSE_HINTS) {
                    causes.push(thought.to_string());
                }
                if contains_any(&lower, &ERROR_HINTS) {
                    errors.push(thought.to_string());
                }
            }

            if let Some(action) = &step.action {
                let rendered = action.render();
                if rendered.to_lowercase().contains(REPRO_HINT) {
                    reproduction.push(format!(
                        "Ran: {}",
                        excerpt(rendered.trim(), REPRO_ACTION_CHARS)
                    ));
                }
            }

            // Corrections carry parser feedback, not sandbox output.
            if step.action.is_some()
                && let Some(observation) = step.observation.as_deref().map(str::trim)
                && !observation.is_empty()
            {
                let lower = observation.to_lowercase();
                if contains_any(&lower, &ERROR_OUTPUT_HINTS) {
                    errors.push(excerpt(observation, ERROR_EXCERPT_CHARS));
                }
                if lower.contains(REPRO_HINT) {
                    reproduction.push(excerpt(observation, REPRO_OUTPUT_CHARS));
                }
            }
        }

        let mut final_analysis: Vec<String> = result
            .trajectory
            .steps
            .iter()
            .rev()
            .filter_map(|step| step.thought.as_deref().map(str::trim))
            .filter(|thought| is_substantial(thought))
            .take(FINAL_THOUGHTS)
            .map(str::to_string)
            .collect();
        final_analysis.reverse();
        if let Some(submission) = result.submission().map(str::trim)
            && !submission.is_empty()
        {
            final_analysis.insert(0, format!("Submission:\n{submission}"));
        }

        Self {
            spoke: spoke.to_string(),
            agent_id: result.agent_id.clone(),
            status: result.status,
            problem_location: capped_unique(files, MAX_FILES),
            root_cause: capped_unique(causes, MAX_CAUSES),
            errors: capped_unique(errors, MAX_ERRORS),
            reproduction: capped_unique(reproduction, MAX_REPRODUCTION),
            final_analysis,
            exit_status: result.status.as_str().to_string(),
        }
    }

    pub fn entries(&self, section: HandoffSection) -> Vec<&str> {
        match section {
            HandoffSection::ProblemLocation => as_strs(&self.problem_location),
            HandoffSection::RootCause => as_strs(&self.root_cause),
            HandoffSection::Errors => as_strs(&self.errors),
            HandoffSection::Reproduction => as_strs(&self.reproduction),
            HandoffSection::FinalAnalysis => as_strs(&self.final_analysis),
            HandoffSection::ExitStatus if self.exit_status.is_empty() => Vec::new(),
            HandoffSection::ExitStatus => vec![self.exit_status.as_str()],
        }
    }

    /// Sections with no findings.
    pub fn empty_sections(&self) -> Vec<HandoffSection> {
        HandoffSection::ALL
            .into_iter()
            .filter(|section| self.entries(*section).is_empty())
            .collect()
    }

    /// True when any section is empty or the spoke did not terminate successfully.
    pub fn is_incomplete(&self) -> bool {
        self.status != SessionStatus::Success || !self.empty_sections().is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = vec![
            RULE.to_string(),
            format!("HANDOFF FROM {} ({})", self.spoke.to_uppercase(), self.agent_id),
            RULE.to_string(),
        ];
        if self.is_incomplete() {
            out.push(self.incomplete_banner());
        }
        out.push(String::new());

        for section in HandoffSection::ALL {
            let entries = self.entries(section);
            if section == HandoffSection::ExitStatus {
                let value = entries.first().copied().unwrap_or(NONE_FOUND);
                out.push(format!("{}: {value}", section.heading()));
                out.push(String::new());
                continue;
            }
            out.push(format!("{}:", section.heading()));
            if entries.is_empty() {
                out.push(format!("   {NONE_FOUND}"));
            }
            for entry in entries {
                let prefix = if section == HandoffSection::ProblemLocation {
                    "   - "
                } else {
                    "   "
                };
                out.push(format!("{prefix}{}", indent_continuation(entry)));
            }
            out.push(String::new());
        }
        out.push(RULE.to_string());
        out.join("\n")
    }

    fn incomplete_banner(&self) -> String {
        let missing: Vec<&str> = self
            .empty_sections()
            .into_iter()
            .map(HandoffSection::heading)
            .collect();
        let mut reasons = Vec::new();
        if self.status != SessionStatus::Success {
            reasons.push(format!("spoke ended with status '{}'", self.status));
        }
        if !missing.is_empty() {
            reasons.push(format!("no findings for {}", missing.join(", ")));
        }
        format!("[INCOMPLETE: {}]", reasons.join("; "))
    }
}

pub fn is_substantial(thought: &str) -> bool {
    thought.trim().chars().count() >= SUBSTANTIAL_THOUGHT_CHARS
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn capped_unique(items: Vec<String>, cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if out.len() == cap {
            break;
        }
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn indent_continuation(entry: &str) -> String {
    entry.replace('\n', "\n   ")
}

fn as_strs(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}
