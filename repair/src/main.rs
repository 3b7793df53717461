//! Star-topology repair agent runner.
//!
//! `repair run` bootstraps one sandbox over a repository checkout, dispatches the
//! configured spokes (by default an investigator and an implementer) against it, and
//! writes trajectories, handoffs and a run summary under the output directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use repair::coordinator::{Coordinator, CoordinatorEvent};
use repair::core::request::RepairRequest;
use repair::core::result::RunOutcome;
use repair::core::types::{Role, is_safe_name};
use repair::exit_codes;
use repair::io::config::{RunPlan, load_plan, load_role_config, load_role_profile};
use repair::io::local_env::LocalShellEnvironment;
use repair::io::model::CommandModel;
use repair::io::sandbox::SharedEnvironment;
use repair::io::trajectory_store::{render_summary, write_run};
use repair::logging;

const DEFAULT_OUTPUT_DIR: &str = "trajectories";

#[derive(Parser)]
#[command(
    name = "repair",
    version,
    about = "Star-topology repair agent runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Investigate and fix an issue in a repository checkout.
    Run(RunArgs),
    /// Parse and validate a role config file.
    CheckConfig {
        path: PathBuf,
        /// Role to resolve the config for; defaults to the role the file declares.
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("issue")
        .required(true)
        .args(["issue_text", "issue_file"])
))]
struct RunArgs {
    /// Repository checkout the sandbox runs in.
    #[arg(long)]
    repo: PathBuf,
    /// Issue text, inline.
    #[arg(long, visible_alias = "issue")]
    issue_text: Option<String>,
    /// File containing the issue text.
    #[arg(long)]
    issue_file: Option<PathBuf>,
    #[arg(long, conflicts_with = "plan")]
    investigator_config: Option<PathBuf>,
    #[arg(long, conflicts_with = "plan")]
    implementer_config: Option<PathBuf>,
    /// Run plan listing the spokes in dispatch order.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Where run artifacts are written [default: plan's output_dir, else `trajectories`].
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Request id; derived from the issue text when omitted.
    #[arg(long)]
    request_id: Option<String>,
    /// Program that answers model queries (JSON on stdin, JSON on stdout).
    #[arg(long)]
    model_command: String,
    /// Argument passed to the model program; repeatable.
    #[arg(long = "model-arg", allow_hyphen_values = true)]
    model_args: Vec<String>,
    /// Per-query timeout for the model program.
    #[arg(long)]
    model_timeout_secs: Option<u64>,
    /// Wall-clock limit for the whole run; the sandbox is torn down when it expires.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Investigator,
    Implementer,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Investigator => Role::Investigator,
            RoleArg::Implementer => Role::Implementer,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::CheckConfig { path, role } => cmd_check_config(&path, role),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let problem_text = match (&args.issue_text, &args.issue_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => bail!("one of --issue-text or --issue-file is required"),
    };
    if let Some(id) = &args.request_id
        && !is_safe_name(id)
    {
        bail!("--request-id '{id}' must be non-empty and use only [A-Za-z0-9_-]");
    }
    let plan = build_plan(&args)?;
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| plan.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    let mut request = RepairRequest::new(
        args.request_id.clone(),
        args.repo.display().to_string(),
        problem_text,
    );
    if let Some(path) = &args.issue_file {
        request = request.with_metadata("issue_file", path.display().to_string());
    }

    let mut model = CommandModel::new(args.model_command.clone(), args.model_args.clone());
    if let Some(secs) = args.model_timeout_secs {
        model.timeout = Duration::from_secs(secs);
    }

    let env = SharedEnvironment::new(LocalShellEnvironment::new(&args.repo));
    let coordinator = Coordinator::new(env, plan)?;
    info!(request_id = %request.id(), repo = %args.repo.display(), "starting run");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    if let Some(secs) = args.timeout_secs {
        let handle = coordinator.teardown_handle();
        let limit = Duration::from_secs(secs);
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(limit) {
                warn!(timeout_secs = limit.as_secs(), "run timed out; tearing down sandbox");
                if let Err(err) = handle.stop() {
                    warn!(err = %err, "teardown after timeout failed");
                }
            }
        });
    }

    let outcome = coordinator.run(&model, &request, print_event);
    drop(done_tx);
    let report = outcome.context("run coordinator")?;

    let paths = write_run(&output_dir, &report.record())?;
    print!("{}", render_summary(&report.record()));
    println!("artifacts: {}", paths.dir.display());

    if let Some(last) = report.spokes.last()
        && let Some(agent) = report.agent(last)
        && !agent.succeeded()
    {
        eprintln!(
            "final spoke '{last}' terminated with {}: {}",
            agent.status,
            agent.status.describe()
        );
    }

    Ok(match report.result.outcome() {
        RunOutcome::Validated => exit_codes::OK,
        RunOutcome::Unvalidated => exit_codes::UNVALIDATED,
        RunOutcome::NoPatch => exit_codes::NO_PATCH,
    })
}

fn build_plan(args: &RunArgs) -> Result<RunPlan> {
    if let Some(path) = &args.plan {
        return load_plan(path);
    }
    let investigator = load_role_profile(args.investigator_config.as_deref(), Role::Investigator)
        .context("load investigator config")?;
    let implementer = load_role_profile(args.implementer_config.as_deref(), Role::Implementer)
        .context("load implementer config")?;
    Ok(RunPlan::two_spoke(investigator, implementer))
}

fn print_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Bootstrapped { tools, variables } => {
            eprintln!("sandbox ready ({tools} tools, {variables} variables)");
        }
        CoordinatorEvent::SpokeStarted { spoke, agent_id, .. } => {
            eprintln!("[{spoke}] started as {agent_id}");
        }
        CoordinatorEvent::SpokeFinished {
            spoke,
            status,
            model_turns,
        } => {
            eprintln!("[{spoke}] {status} after {model_turns} turns");
        }
        CoordinatorEvent::HandoffExtracted { spoke, incomplete } => {
            if *incomplete {
                eprintln!("[{spoke}] handoff incomplete");
            }
        }
    }
}

fn cmd_check_config(path: &Path, role: Option<RoleArg>) -> Result<i32> {
    let config = load_role_config(path)?;
    let role = role
        .map(Role::from)
        .or(config.role)
        .with_context(|| format!("{} declares no role; pass --role", path.display()))?;
    let profile = config
        .into_profile(role)
        .with_context(|| format!("validate {}", path.display()))?;
    let allowed: Vec<&str> = profile.policy.allowed().collect();
    println!(
        "{}: ok (role {}, parser {}, commands {})",
        path.display(),
        profile.role,
        profile.parser.as_str(),
        allowed.join(", ")
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_inline_issue() {
        let cli = Cli::parse_from([
            "repair",
            "run",
            "--repo",
            "/tmp/repo",
            "--issue-text",
            "crash on start",
            "--model-command",
            "model.sh",
            "--model-arg",
            "--fast",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.issue_text.as_deref(), Some("crash on start"));
        assert_eq!(args.model_args, vec!["--fast".to_string()]);
        assert!(args.output_dir.is_none());
    }

    #[test]
    fn run_requires_an_issue() {
        let err = Cli::try_parse_from([
            "repair",
            "run",
            "--repo",
            ".",
            "--model-command",
            "m",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn issue_sources_are_exclusive() {
        let err = Cli::try_parse_from([
            "repair",
            "run",
            "--repo",
            ".",
            "--issue-text",
            "a",
            "--issue-file",
            "b.md",
            "--model-command",
            "m",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn parse_check_config_role() {
        let cli = Cli::parse_from(["repair", "check-config", "inv.toml", "--role", "investigator"]);
        assert!(matches!(
            cli.command,
            Command::CheckConfig {
                role: Some(RoleArg::Investigator),
                ..
            }
        ));
    }

    #[test]
    fn check_config_accepts_declared_role() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("implementer.toml");
        fs::write(&path, "role = \"implementer\"\n[limits]\nstep_ceiling = 10\n").expect("write");
        assert_eq!(cmd_check_config(&path, None).expect("valid"), exit_codes::OK);

        let bare = temp.path().join("bare.toml");
        fs::write(&bare, "").expect("write");
        assert!(cmd_check_config(&bare, None).is_err());
    }
}
