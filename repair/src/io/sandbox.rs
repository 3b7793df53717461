//! Sandbox environment contract and the single-writer wrapper around it.
//!
//! A backend implements [`SandboxEnvironment`]. The coordinator wraps exactly one
//! backend in a [`SharedEnvironment`], which serializes command execution, guarantees
//! bootstrap happens at most once and makes teardown idempotent. Sessions never see
//! the wrapper's owner operations: an injected session holds an [`EnvironmentRef`],
//! whose only capability is `execute`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Output of one sandbox command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Text fed back to the model.
    pub fn observation(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if self.timed_out {
            out.push_str("\n[command timed out]");
        }
        if out.trim().is_empty() {
            return format!("(no output, exit code {})", self.exit_code);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("sandbox deployment failed: {0}")]
    Deployment(String),
    #[error("installing tool '{tool}' failed: {reason}")]
    Install { tool: String, reason: String },
    #[error("sandbox execution failed: {0}")]
    Execution(String),
    #[error("sandbox has been stopped")]
    Stopped,
    #[error("sandbox is already bootstrapped")]
    AlreadyBootstrapped,
}

/// Named set of commands that installs one tool into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBundle {
    pub name: String,
    #[serde(default)]
    pub install: Vec<String>,
}

/// Command-execution backend with an explicit lifecycle.
///
/// Implementations need not be safe for concurrent `execute` calls; the
/// [`SharedEnvironment`] wrapper serializes them. `stop` may be called from any
/// thread at any time and must be idempotent.
pub trait SandboxEnvironment: Send + Sync {
    fn start(&self) -> Result<(), EnvError>;
    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError>;
    fn install_tools(&self, tools: &[ToolBundle]) -> Result<(), EnvError>;
    fn set_variables(&self, variables: &BTreeMap<String, String>) -> Result<(), EnvError>;
    fn stop(&self) -> Result<(), EnvError>;
}

impl<T: SandboxEnvironment + ?Sized> SandboxEnvironment for Arc<T> {
    fn start(&self) -> Result<(), EnvError> {
        (**self).start()
    }

    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        (**self).execute(command, timeout)
    }

    fn install_tools(&self, tools: &[ToolBundle]) -> Result<(), EnvError> {
        (**self).install_tools(tools)
    }

    fn set_variables(&self, variables: &BTreeMap<String, String>) -> Result<(), EnvError> {
        (**self).set_variables(variables)
    }

    fn stop(&self) -> Result<(), EnvError> {
        (**self).stop()
    }
}

/// Single-writer wrapper owned by whoever bootstraps the sandbox.
pub struct SharedEnvironment {
    backend: Box<dyn SandboxEnvironment>,
    exec_lock: Mutex<()>,
    bootstrapped: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for SharedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEnvironment")
            .field("bootstrapped", &self.is_bootstrapped())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl SharedEnvironment {
    pub fn new(backend: impl SandboxEnvironment + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            exec_lock: Mutex::new(()),
            bootstrapped: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// One-time initialization: start, install tools, inject variables.
    ///
    /// Only the environment's owner reaches this; a second call fails with
    /// [`EnvError::AlreadyBootstrapped`] without touching the backend.
    #[instrument(skip_all, fields(tools = tools.len(), variables = variables.len()))]
    pub(crate) fn bootstrap(
        &self,
        tools: &[ToolBundle],
        variables: &BTreeMap<String, String>,
    ) -> Result<(), EnvError> {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            warn!("bootstrap requested twice");
            return Err(EnvError::AlreadyBootstrapped);
        }
        if self.is_stopped() {
            return Err(EnvError::Stopped);
        }
        let _guard = self.lock();
        self.backend.start()?;
        self.backend.install_tools(tools)?;
        if !variables.is_empty() {
            self.backend.set_variables(variables)?;
        }
        info!("sandbox bootstrapped");
        Ok(())
    }

    /// Run one command, waiting for any in-flight command to finish first.
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        if self.is_stopped() {
            return Err(EnvError::Stopped);
        }
        let _guard = self.lock();
        if self.is_stopped() {
            return Err(EnvError::Stopped);
        }
        debug!(command, "sandbox execute");
        self.backend.execute(command, timeout)
    }

    /// Tear the sandbox down. Later calls are no-ops.
    ///
    /// Does not wait for the execution lock, so it is safe to call while a command is
    /// running on another thread.
    pub fn stop(&self) -> Result<(), EnvError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("sandbox already stopped");
            return Ok(());
        }
        info!("stopping sandbox");
        self.backend.stop()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Non-owning, execute-only handle for an injected session.
    pub fn injected(&self) -> EnvironmentRef<'_> {
        EnvironmentRef { env: self }
    }

    pub fn teardown_handle(self: &Arc<Self>) -> TeardownHandle {
        TeardownHandle(Arc::clone(self))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The lock guards no data, so a poisoned lock is still usable.
        self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Borrowed view of a [`SharedEnvironment`] that can only execute commands.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentRef<'env> {
    env: &'env SharedEnvironment,
}

impl EnvironmentRef<'_> {
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        self.env.execute(command, timeout)
    }

    pub fn is_stopped(&self) -> bool {
        self.env.is_stopped()
    }
}

/// How a session reaches its sandbox.
#[derive(Debug)]
pub enum EnvironmentBinding<'env> {
    /// The session bootstraps the environment and stops it when it terminates.
    Owned(Arc<SharedEnvironment>),
    /// Already initialized by the coordinator; execute only.
    Injected(EnvironmentRef<'env>),
}

impl EnvironmentBinding<'_> {
    pub fn owns_environment(&self) -> bool {
        matches!(self, EnvironmentBinding::Owned(_))
    }

    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, EnvError> {
        match self {
            EnvironmentBinding::Owned(env) => env.execute(command, timeout),
            EnvironmentBinding::Injected(env) => env.execute(command, timeout),
        }
    }

    /// Whether the sandbox has been torn down, by its owner or a supervisor.
    pub fn is_stopped(&self) -> bool {
        match self {
            EnvironmentBinding::Owned(env) => env.is_stopped(),
            EnvironmentBinding::Injected(env) => env.is_stopped(),
        }
    }
}

/// Cloneable teardown capability for supervisors outside the engine.
#[derive(Debug, Clone)]
pub struct TeardownHandle(Arc<SharedEnvironment>);

impl TeardownHandle {
    pub fn stop(&self) -> Result<(), EnvError> {
        self.0.stop()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        installs: AtomicUsize,
        stops: AtomicUsize,
        executes: AtomicUsize,
    }

    impl SandboxEnvironment for Counting {
        fn start(&self) -> Result<(), EnvError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandResult, EnvError> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            Ok(CommandResult {
                stdout: command.to_string(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            })
        }

        fn install_tools(&self, _tools: &[ToolBundle]) -> Result<(), EnvError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_variables(&self, _variables: &BTreeMap<String, String>) -> Result<(), EnvError> {
            Ok(())
        }

        fn stop(&self) -> Result<(), EnvError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bundle() -> Vec<ToolBundle> {
        vec![ToolBundle {
            name: "search".to_string(),
            install: vec!["true".to_string()],
        }]
    }

    #[test]
    fn bootstrap_runs_once() {
        let backend = Arc::new(Counting::default());
        let env = SharedEnvironment::new(Arc::clone(&backend));
        env.bootstrap(&bundle(), &BTreeMap::new()).expect("bootstrap");
        assert_eq!(
            env.bootstrap(&bundle(), &BTreeMap::new()),
            Err(EnvError::AlreadyBootstrapped)
        );
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bootstrap_installs_even_an_empty_tool_set() {
        let backend = Arc::new(Counting::default());
        let env = SharedEnvironment::new(Arc::clone(&backend));
        env.bootstrap(&[], &BTreeMap::new()).expect("bootstrap");
        assert_eq!(backend.installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent_and_blocks_execution() {
        let backend = Arc::new(Counting::default());
        let env = Arc::new(SharedEnvironment::new(Arc::clone(&backend)));
        let handle = env.teardown_handle();

        env.stop().expect("first stop");
        handle.stop().expect("second stop");
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            env.injected().execute("ls", Duration::from_secs(1)),
            Err(EnvError::Stopped)
        );
        assert_eq!(backend.executes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn injected_binding_does_not_own() {
        let env = SharedEnvironment::new(Counting::default());
        let binding = EnvironmentBinding::Injected(env.injected());
        assert!(!binding.owns_environment());
        let result = binding
            .execute("echo hi", Duration::from_secs(1))
            .expect("execute");
        assert_eq!(result.stdout, "echo hi");
    }

    #[test]
    fn observation_merges_streams() {
        let result = CommandResult {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit_code: 1,
            timed_out: false,
        };
        assert_eq!(result.observation(), "out\nerr");
        let silent = CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        };
        assert_eq!(silent.observation(), "(no output, exit code 0)");
    }
}
