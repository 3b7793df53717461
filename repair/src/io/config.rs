//! Role profiles and run plans loaded from TOML.
//!
//! External configuration is parsed here, once, into the closed [`RoleProfile`] type;
//! nothing past this boundary reads raw configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::{Backoff, Ceilings};
use crate::core::parser::ParserKind;
use crate::core::policy::CommandPolicy;
use crate::core::tools::ToolSchema;
use crate::core::types::{Role, is_safe_name};
use crate::io::model::ModelParams;
use crate::io::prompt::TemplateSet;
use crate::io::sandbox::ToolBundle;

pub const DEFAULT_SUBMIT_COMMAND: &str = "git add -A && git diff --cached";

/// Role configuration file (TOML).
///
/// Every field is optional; missing fields take the role's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoleConfig {
    /// If set, must match the role the file is loaded for.
    pub role: Option<Role>,
    pub parser: ParserKind,
    pub model: ModelParams,
    pub limits: Limits,
    pub commands: CommandsConfig,
    pub tools: Vec<ToolBundle>,
    /// Variables injected into the sandbox at bootstrap.
    pub env: BTreeMap<String, String>,
    pub templates: TemplateSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Cumulative model cost at which the session stops.
    pub cost_ceiling: f64,
    /// Executed steps at which the session stops.
    pub step_ceiling: u32,
    /// Consecutive unparseable responses tolerated.
    pub parse_retry_ceiling: u32,
    /// Attempts per model call, including the first.
    pub model_attempts: u32,
    /// Initial retry backoff; doubles per retry.
    pub backoff_ms: u64,
    pub command_timeout_secs: u64,
    /// Observations longer than this are truncated before reaching the model.
    pub observation_limit_bytes: usize,
    /// Byte budget for the task prompt.
    pub prompt_budget_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cost_ceiling: 3.0,
            step_ceiling: 100,
            parse_retry_ceiling: 3,
            model_attempts: 4,
            backoff_ms: 1_000,
            command_timeout_secs: 120,
            observation_limit_bytes: 20_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    /// Allowed command words; the role's default set when absent.
    pub allowed: Option<Vec<String>>,
    /// Shell command whose stdout becomes the patch on `submit`.
    pub submit_command: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            allowed: None,
            submit_command: DEFAULT_SUBMIT_COMMAND.to_string(),
        }
    }
}

impl RoleConfig {
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if !limits.cost_ceiling.is_finite() || limits.cost_ceiling < 0.0 {
            bail!("limits.cost_ceiling must be a finite number >= 0");
        }
        if limits.step_ceiling == 0 {
            bail!("limits.step_ceiling must be > 0");
        }
        if limits.model_attempts == 0 {
            bail!("limits.model_attempts must be > 0");
        }
        if limits.command_timeout_secs == 0 {
            bail!("limits.command_timeout_secs must be > 0");
        }
        if limits.observation_limit_bytes == 0 {
            bail!("limits.observation_limit_bytes must be > 0");
        }
        if limits.prompt_budget_bytes == 0 {
            bail!("limits.prompt_budget_bytes must be > 0");
        }
        if let Some(allowed) = &self.commands.allowed
            && (allowed.is_empty() || allowed.iter().any(|word| word.trim().is_empty()))
        {
            bail!("commands.allowed must be a non-empty list of non-empty words");
        }
        if self.commands.submit_command.trim().is_empty() {
            bail!("commands.submit_command must not be empty");
        }
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                bail!("tools entries need a name");
            }
        }
        self.templates.validate()?;
        Ok(())
    }

    /// Resolve into the profile for `role`.
    pub fn into_profile(self, role: Role) -> Result<RoleProfile> {
        self.validate()?;
        if let Some(declared) = self.role
            && declared != role
        {
            bail!("config declares role '{declared}' but is used for role '{role}'");
        }
        let policy = match self.commands.allowed {
            Some(words) => CommandPolicy::new(words.into_iter().map(|w| w.trim().to_string())),
            None => CommandPolicy::for_role(role),
        };
        let tool_schema = ToolSchema::for_policy(&policy);
        let limits = self.limits;
        Ok(RoleProfile {
            role,
            parser: self.parser,
            model: self.model,
            policy,
            tool_schema,
            ceilings: Ceilings {
                cost: limits.cost_ceiling,
                steps: limits.step_ceiling,
                parse_retries: limits.parse_retry_ceiling,
            },
            backoff: Backoff::new(limits.model_attempts, Duration::from_millis(limits.backoff_ms)),
            command_timeout: Duration::from_secs(limits.command_timeout_secs),
            observation_limit_bytes: limits.observation_limit_bytes,
            prompt_budget_bytes: limits.prompt_budget_bytes,
            submit_command: self.commands.submit_command,
            tools: self.tools,
            env: self.env,
            templates: self.templates,
        })
    }
}

/// Everything a session needs to know about its role, resolved and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleProfile {
    pub role: Role,
    pub parser: ParserKind,
    pub model: ModelParams,
    pub policy: CommandPolicy,
    pub tool_schema: ToolSchema,
    pub ceilings: Ceilings,
    pub backoff: Backoff,
    pub command_timeout: Duration,
    pub observation_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
    pub submit_command: String,
    pub tools: Vec<ToolBundle>,
    pub env: BTreeMap<String, String>,
    pub templates: TemplateSet,
}

impl RoleProfile {
    /// Built-in profile for `role`.
    pub fn for_role(role: Role) -> Result<Self> {
        RoleConfig::default().into_profile(role)
    }
}

/// Load a role config from a TOML file.
///
/// If `path` is `None`, returns the role's defaults.
pub fn load_role_profile(path: Option<&Path>, role: Role) -> Result<RoleProfile> {
    let Some(path) = path else {
        return RoleProfile::for_role(role);
    };
    debug!(path = %path.display(), %role, "loading role config");
    load_role_config(path)?
        .into_profile(role)
        .with_context(|| format!("validate {}", path.display()))
}

/// Parse a role config file without resolving it.
pub fn load_role_config(path: &Path) -> Result<RoleConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// One spoke of a run: a unique name and its resolved profile.
#[derive(Debug, Clone, PartialEq)]
pub struct SpokeSpec {
    pub name: String,
    pub profile: RoleProfile,
}

impl SpokeSpec {
    pub fn new(name: impl Into<String>, profile: RoleProfile) -> Self {
        Self {
            name: name.into(),
            profile,
        }
    }
}

/// Ordered spokes of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub spokes: Vec<SpokeSpec>,
    pub output_dir: Option<PathBuf>,
}

impl RunPlan {
    /// Investigator followed by implementer.
    pub fn two_spoke(investigator: RoleProfile, implementer: RoleProfile) -> Self {
        Self {
            spokes: vec![
                SpokeSpec::new("investigator", investigator),
                SpokeSpec::new("implementer", implementer),
            ],
            output_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let last = self
            .spokes
            .last()
            .ok_or_else(|| anyhow!("run plan must contain at least one spoke"))?;
        let mut seen = BTreeSet::new();
        for spoke in &self.spokes {
            if !is_safe_name(&spoke.name) {
                bail!(
                    "spoke name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                    spoke.name
                );
            }
            if !seen.insert(spoke.name.as_str()) {
                bail!("duplicate spoke name '{}'", spoke.name);
            }
        }
        if last.profile.role != Role::Implementer {
            bail!(
                "the final spoke '{}' must have role 'implementer' to produce a patch",
                last.name
            );
        }
        Ok(())
    }

    /// Union of all spokes' tool bundles, first occurrence of each name wins.
    pub fn tool_union(&self) -> Vec<ToolBundle> {
        let mut names = BTreeSet::new();
        self.spokes
            .iter()
            .flat_map(|spoke| spoke.profile.tools.iter())
            .filter(|tool| names.insert(tool.name.clone()))
            .cloned()
            .collect()
    }

    /// Union of all spokes' sandbox variables; later spokes override earlier ones.
    pub fn variable_union(&self) -> BTreeMap<String, String> {
        self.spokes
            .iter()
            .flat_map(|spoke| spoke.profile.env.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default)]
    output_dir: Option<PathBuf>,
    spokes: Vec<PlanSpoke>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanSpoke {
    name: String,
    role: Role,
    #[serde(default)]
    config: Option<PathBuf>,
}

/// Load a run plan. Spoke config paths are relative to the plan file.
pub fn load_plan(path: &Path) -> Result<RunPlan> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: PlanFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let spokes = file
        .spokes
        .into_iter()
        .map(|spoke| {
            let config = spoke.config.map(|p| base.join(p));
            let profile = load_role_profile(config.as_deref(), spoke.role)
                .with_context(|| format!("load config for spoke '{}'", spoke.name))?;
            Ok(SpokeSpec::new(spoke.name, profile))
        })
        .collect::<Result<Vec<_>>>()?;

    let plan = RunPlan {
        spokes,
        output_dir: file.output_dir.map(|dir| base.join(dir)),
    };
    plan.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(plan)
}
