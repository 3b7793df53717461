//! Sandbox backend that runs commands with `sh -c` in a local checkout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::io::process::run_bounded;
use crate::io::sandbox::{CommandResult, EnvError, SandboxEnvironment, ToolBundle};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct LocalShellEnvironment {
    root: PathBuf,
    variables: Mutex<BTreeMap<String, String>>,
    started: AtomicBool,
    stopped: AtomicBool,
    output_limit_bytes: usize,
    install_timeout: Duration,
}

impl LocalShellEnvironment {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            variables: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.root);
        let variables = self
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        cmd.envs(variables);

        let output = run_bounded(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|e| EnvError::Execution(format!("{e:#}")))?;
        Ok(CommandResult {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
        })
    }

    fn ensure_running(&self) -> Result<(), EnvError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EnvError::Stopped);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(EnvError::Execution("sandbox was not started".to_string()));
        }
        Ok(())
    }
}

impl SandboxEnvironment for LocalShellEnvironment {
    #[instrument(skip_all, fields(root = %self.root.display()))]
    fn start(&self) -> Result<(), EnvError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EnvError::Stopped);
        }
        if !self.root.is_dir() {
            return Err(EnvError::Deployment(format!(
                "repository directory {} does not exist",
                self.root.display()
            )));
        }
        self.started.store(true, Ordering::SeqCst);
        info!("local sandbox started");
        Ok(())
    }

    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        self.ensure_running()?;
        self.run(command, timeout)
    }

    #[instrument(skip_all, fields(tools = tools.len()))]
    fn install_tools(&self, tools: &[ToolBundle]) -> Result<(), EnvError> {
        self.ensure_running()?;
        for tool in tools {
            for step in &tool.install {
                debug!(tool = %tool.name, step, "installing tool");
                let result =
                    self.run(step, self.install_timeout)
                        .map_err(|e| EnvError::Install {
                            tool: tool.name.clone(),
                            reason: e.to_string(),
                        })?;
                if !result.success() {
                    warn!(tool = %tool.name, exit_code = result.exit_code, "tool install failed");
                    return Err(EnvError::Install {
                        tool: tool.name.clone(),
                        reason: format!(
                            "'{step}' exited with {}: {}",
                            result.exit_code,
                            result.stderr.trim()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn set_variables(&self, variables: &BTreeMap<String, String>) -> Result<(), EnvError> {
        let mut current = self
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        current.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn stop(&self) -> Result<(), EnvError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
