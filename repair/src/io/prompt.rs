//! Prompt rendering for agent sessions.
//!
//! Every prompt a session sends is rendered from one of five minijinja templates.
//! The instance prompt is split into marked sections and trimmed to a byte budget,
//! dropping context files before truncating anything required.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::request::RepairRequest;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const INSTANCE_TEMPLATE: &str = include_str!("prompts/instance.md");
const NEXT_STEP_TEMPLATE: &str = include_str!("prompts/next_step.md");
const FORMAT_ERROR_TEMPLATE: &str = include_str!("prompts/format_error.md");
const POLICY_VIOLATION_TEMPLATE: &str = include_str!("prompts/policy_violation.md");

/// Template sources for one role. Missing entries fall back to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSet {
    pub system: String,
    pub instance: String,
    pub next_step: String,
    pub format_error: String,
    pub policy_violation: String,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            system: SYSTEM_TEMPLATE.to_string(),
            instance: INSTANCE_TEMPLATE.to_string(),
            next_step: NEXT_STEP_TEMPLATE.to_string(),
            format_error: FORMAT_ERROR_TEMPLATE.to_string(),
            policy_violation: POLICY_VIOLATION_TEMPLATE.to_string(),
        }
    }
}

impl TemplateSet {
    fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("system", self.system.as_str()),
            ("instance", self.instance.as_str()),
            ("next_step", self.next_step.as_str()),
            ("format_error", self.format_error.as_str()),
            ("policy_violation", self.policy_violation.as_str()),
        ]
    }

    /// Check that every template parses.
    pub fn validate(&self) -> Result<()> {
        let env = Environment::new();
        for (name, source) in self.entries() {
            if source.trim().is_empty() {
                return Err(anyhow!("template '{name}' must not be empty"));
            }
            env.template_from_str(source)
                .with_context(|| format!("parse template '{name}'"))?;
        }
        Ok(())
    }
}

/// Values the system template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct SystemContext<'a> {
    pub role: &'a str,
    pub agent_id: &'a str,
    pub commands: Vec<&'a str>,
    pub tools: Vec<&'a str>,
    pub parser: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ContextFile<'a> {
    name: &'a str,
    content: &'a str,
}

/// Renders a role's templates.
#[derive(Debug)]
pub struct PromptRenderer<'t> {
    templates: &'t TemplateSet,
    env: Environment<'static>,
    budget_bytes: usize,
}

impl<'t> PromptRenderer<'t> {
    pub fn new(templates: &'t TemplateSet, budget_bytes: usize) -> Self {
        Self {
            templates,
            env: Environment::new(),
            budget_bytes,
        }
    }

    pub fn system(&self, ctx: &SystemContext<'_>) -> Result<String> {
        self.render("system", &self.templates.system, ctx)
    }

    /// Task prompt for `request`, within the byte budget.
    ///
    /// Context files whose content already appears verbatim in the problem text are
    /// not repeated.
    pub fn instance(&self, request: &RepairRequest) -> Result<String> {
        let problem_text = request.problem_text();
        let files: Vec<ContextFile<'_>> = request
            .context_files()
            .iter()
            .filter(|(_, content)| !problem_text.contains(content.trim()))
            .map(|(name, content)| ContextFile {
                name,
                content: content.trim(),
            })
            .collect();
        let rendered = self.render(
            "instance",
            &self.templates.instance,
            context! {
                repository => request.repository_ref(),
                problem_text => problem_text.trim(),
                context_files => files,
            },
        )?;

        let mut sections = parse_sections(&rendered);
        if sections.is_empty() {
            return Ok(rendered.trim().to_string());
        }
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }

    pub fn next_step(&self, observation: &str, exit_code: Option<i32>) -> Result<String> {
        self.render(
            "next_step",
            &self.templates.next_step,
            context! { observation => observation, exit_code => exit_code },
        )
    }

    pub fn format_error(&self, reason: &str) -> Result<String> {
        self.render(
            "format_error",
            &self.templates.format_error,
            context! { reason => reason },
        )
    }

    pub fn policy_violation(&self, command: &str, role: &str, allowed: &[&str]) -> Result<String> {
        self.render(
            "policy_violation",
            &self.templates.policy_violation,
            context! { command => command, role => role, allowed => allowed },
        )
    }

    fn render<S: Serialize>(&self, name: &str, source: &str, ctx: S) -> Result<String> {
        let rendered = self
            .env
            .render_str(source, ctx)
            .with_context(|| format!("render template '{name}'"))?;
        Ok(rendered.trim().to_string())
    }
}

/// Cut `text` to at most `limit` bytes, appending a notice with the dropped size.
pub fn truncate_observation(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Parse sections from rendered output using `<!-- section:KEY required|droppable -->`
/// markers. Text before the first marker is discarded.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections (context files first, later ones before earlier ones)
/// until the budget fits, then truncate the largest remaining section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    let mut drop_order: Vec<String> = sections
        .iter()
        .rev()
        .filter(|s| !s.required && s.key.starts_with("context"))
        .map(|s| s.key.clone())
        .collect();
    drop_order.extend(
        sections
            .iter()
            .rev()
            .filter(|s| !s.required && !s.key.starts_with("context"))
            .map(|s| s.key.clone()),
    );

    for key in drop_order {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let Some(largest) = sections
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.content.len())
        .map(|(idx, _)| idx)
    else {
        return;
    };
    let other_len = total_len(sections) - sections[largest].content.len();
    let section = &mut sections[largest];
    let allowed = budget.saturating_sub(other_len);
    if section.content.len() > allowed {
        let before_len = section.content.len();
        let mut cut = allowed.saturating_sub(12);
        while !section.content.is_char_boundary(cut) {
            cut -= 1;
        }
        section.content.truncate(cut);
        section.content.push_str("\n[truncated]");
        debug!(
            section = section.key,
            before_len,
            after_len = section.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
