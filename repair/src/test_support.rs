//! Test-only doubles for the model transport and the sandbox.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::core::budget::Backoff;
use crate::core::request::RepairRequest;
use crate::core::types::{Role, TokenUsage};
use crate::io::config::RoleProfile;
use crate::io::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::io::sandbox::{CommandResult, EnvError, SandboxEnvironment, ToolBundle};

/// Model output in the thought/action format: prose followed by one fenced command.
pub fn fenced(thought: &str, command: &str) -> String {
    format!("{thought}\n\n```bash\n{command}\n```\n")
}

/// Built-in profile for `role` with retries that never sleep.
pub fn fast_profile(role: Role) -> RoleProfile {
    let mut profile = RoleProfile::for_role(role).expect("built-in profile");
    profile.backoff = Backoff::new(profile.backoff.attempts, Duration::ZERO);
    profile.command_timeout = Duration::from_secs(5);
    profile
}

pub fn request(id: &str, problem_text: &str) -> RepairRequest {
    RepairRequest::new(Some(id.to_string()), "/repo", problem_text)
}

/// Empty directory standing in for a checked-out repository.
pub fn temp_repo() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}

/// Model client that replays a fixed script and records every request.
///
/// Once the script runs out the last entry is repeated.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    last: Mutex<Option<Result<ModelResponse, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ModelResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Free-text responses with zero cost.
    pub fn texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|text| Ok(ModelResponse::text(text, TokenUsage::default())))
                .collect(),
        )
    }

    /// Responses that each cost `cost`.
    pub fn costed<I, S>(texts: I, cost: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
            cost,
        };
        Self::new(
            texts
                .into_iter()
                .map(|text| Ok(ModelResponse::text(text, usage)))
                .collect(),
        )
    }

    /// The same response forever.
    pub fn repeating_text(text: &str) -> Self {
        Self::texts([text])
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ModelClient for ScriptedModel {
    fn query(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let mut last = self.last.lock().expect("last lock");
        match self.script.lock().expect("script lock").pop_front() {
            Some(next) => {
                *last = Some(next.clone());
                next
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ModelError::Transport("script is empty".to_string()))),
        }
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    responses: Mutex<BTreeMap<String, CommandResult>>,
    failures: Mutex<BTreeMap<String, EnvError>>,
    executed: Mutex<Vec<String>>,
    installed: Mutex<Vec<ToolBundle>>,
    variables: Mutex<BTreeMap<String, String>>,
    starts: AtomicUsize,
    installs: AtomicUsize,
    stops: AtomicUsize,
}

/// Sandbox double that records every lifecycle call.
///
/// Commands without a scripted response succeed with empty output. Clones share state,
/// so a test can keep one handle while the coordinator owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSandbox {
    state: Arc<SandboxState>,
}

impl RecordingSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, stdout: &str, exit_code: i32) {
        self.state.responses.lock().expect("responses lock").insert(
            command.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
                timed_out: false,
            },
        );
    }

    /// Make `command` fail at the environment level instead of returning output.
    pub fn fail_on(&self, command: &str, error: EnvError) {
        self.state
            .failures
            .lock()
            .expect("failures lock")
            .insert(command.to_string(), error);
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().expect("executed lock").clone()
    }

    pub fn installed(&self) -> Vec<ToolBundle> {
        self.state.installed.lock().expect("installed lock").clone()
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        self.state.variables.lock().expect("variables lock").clone()
    }

    pub fn start_calls(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> usize {
        self.state.installs.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

impl SandboxEnvironment for RecordingSandbox {
    fn start(&self) -> Result<(), EnvError> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandResult, EnvError> {
        self.state
            .executed
            .lock()
            .expect("executed lock")
            .push(command.to_string());
        if let Some(error) = self.state.failures.lock().expect("failures lock").get(command) {
            return Err(error.clone());
        }
        Ok(self
            .state
            .responses
            .lock()
            .expect("responses lock")
            .get(command)
            .cloned()
            .unwrap_or(CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            }))
    }

    fn install_tools(&self, tools: &[ToolBundle]) -> Result<(), EnvError> {
        self.state.installs.fetch_add(1, Ordering::SeqCst);
        self.state
            .installed
            .lock()
            .expect("installed lock")
            .extend_from_slice(tools);
        Ok(())
    }

    fn set_variables(&self, variables: &BTreeMap<String, String>) -> Result<(), EnvError> {
        self.state
            .variables
            .lock()
            .expect("variables lock")
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn stop(&self) -> Result<(), EnvError> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
