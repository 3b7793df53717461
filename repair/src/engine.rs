//! The agent step engine.
//!
//! One session runs as an explicit state machine:
//!
//! ```text
//! SETUP -> QUERY_MODEL <-> PARSE -> EXECUTE -> RECORD -> CHECK_TERMINATION
//!              ^                                                |
//!              +------------------------------------------------+-> TERMINATED
//! ```
//!
//! Engine-local failures (unparseable output, policy violations, transport errors
//! after retries, exhausted budgets) end in a [`SessionStatus`]. Only environment
//! faults, a missing environment and template errors come back as `Err`.

use std::collections::BTreeMap;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{CostTracker, ParseRetries};
use crate::core::handoff::is_substantial;
use crate::core::history::{NewRecord, StepRecord, Trajectory};
use crate::core::parser::{ModelOutput, ParseContext, ParseFailure, ParsedAction};
use crate::core::request::RepairRequest;
use crate::core::result::{AgentResult, artifact};
use crate::core::tools::ToolSchema;
use crate::core::types::{Action, SessionStatus, StepRole};
use crate::io::model::{Message, ModelClient, ModelRequest, ModelResponse};
use crate::io::prompt::{PromptRenderer, SystemContext, truncate_observation};
use crate::io::sandbox::{EnvError, EnvironmentBinding};
use crate::session::AgentSession;

/// Named states of the step engine.
#[derive(Debug)]
pub enum EngineState {
    Setup,
    QueryModel,
    Parse(ModelResponse),
    Execute {
        parsed: ParsedAction,
        response_raw: String,
    },
    Record {
        parsed: ParsedAction,
        response_raw: String,
        outcome: ExecOutcome,
    },
    CheckTermination,
    Terminated(SessionStatus),
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Setup => "setup",
            EngineState::QueryModel => "query_model",
            EngineState::Parse(_) => "parse",
            EngineState::Execute { .. } => "execute",
            EngineState::Record { .. } => "record",
            EngineState::CheckTermination => "check_termination",
            EngineState::Terminated(_) => "terminated",
        }
    }
}

/// What executing one action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub observation: String,
    pub exit_code: Option<i32>,
    /// Payload of a terminal action that completed successfully.
    pub terminal_payload: Option<String>,
}

/// Run one session to termination.
#[instrument(skip_all, fields(agent_id = %session.agent_id(), role = %session.profile().role))]
pub fn run_session<M: ModelClient>(
    session: &AgentSession<'_, '_>,
    model: &M,
    request: &RepairRequest,
) -> Result<AgentResult> {
    let mut engine = StepEngine::new(session, model, request);
    let outcome = engine.drive();

    if let Ok(EnvironmentBinding::Owned(env)) = session.environment()
        && let Err(err) = env.stop()
    {
        warn!(err = %err, "failed to stop owned environment");
    }

    let status = outcome?;
    info!(%status, steps = engine.steps, cost = engine.cost.total_cost(), "session terminated");
    Ok(engine.into_result(status))
}

struct StepEngine<'a, 'h, 'env, M> {
    session: &'a AgentSession<'h, 'env>,
    model: &'a M,
    request: &'a RepairRequest,
    renderer: PromptRenderer<'a>,
    cost: CostTracker,
    parse_retries: ParseRetries,
    steps: u32,
    commands_run: u32,
    commands_ok: u32,
    terminal_payload: Option<String>,
    submission: Option<String>,
    last_error: Option<String>,
}

impl<'a, 'h, 'env, M: ModelClient> StepEngine<'a, 'h, 'env, M> {
    fn new(session: &'a AgentSession<'h, 'env>, model: &'a M, request: &'a RepairRequest) -> Self {
        let profile = session.profile();
        Self {
            session,
            model,
            request,
            renderer: PromptRenderer::new(&profile.templates, profile.prompt_budget_bytes),
            cost: CostTracker::new(),
            parse_retries: ParseRetries::default(),
            steps: 0,
            commands_run: 0,
            commands_ok: 0,
            terminal_payload: None,
            submission: None,
            last_error: None,
        }
    }

    fn drive(&mut self) -> Result<SessionStatus> {
        let mut state = EngineState::Setup;
        loop {
            debug!(state = state.name(), "engine transition");
            state = match state {
                EngineState::Terminated(status) => return Ok(status),
                EngineState::Setup => self.setup()?,
                EngineState::QueryModel => self.query_model()?,
                EngineState::Parse(response) => self.parse(response)?,
                EngineState::Execute {
                    parsed,
                    response_raw,
                } => self.execute(parsed, response_raw)?,
                EngineState::Record {
                    parsed,
                    response_raw,
                    outcome,
                } => self.record(parsed, response_raw, outcome),
                EngineState::CheckTermination => self.check_termination()?,
            };
        }
    }

    fn setup(&mut self) -> Result<EngineState> {
        let profile = self.session.profile();
        match self.session.environment()? {
            EnvironmentBinding::Owned(env) => {
                info!("bootstrapping owned environment");
                env.bootstrap(&profile.tools, &profile.env)
                    .context("bootstrap owned environment")?;
            }
            EnvironmentBinding::Injected(_) => {
                debug!("environment injected; skipping bootstrap");
            }
        }
        Ok(EngineState::QueryModel)
    }

    fn query_model(&mut self) -> Result<EngineState> {
        self.ensure_running()?;
        let partition = self.session.partition();
        if partition.is_empty() {
            partition.append(NewRecord::system(self.system_prompt()?));
            partition.append(NewRecord::user(self.renderer.instance(self.request)?));
        }

        let profile = self.session.profile();
        let request = ModelRequest {
            messages: self.messages(&partition.records())?,
            tools: if profile.parser.wants_tool_calls() {
                profile.tool_schema.clone()
            } else {
                ToolSchema::default()
            },
            params: profile.model.clone(),
        };

        let backoff = profile.backoff;
        let mut attempt = 0;
        let response = loop {
            match self.model.query(&request) {
                Ok(response) => break response,
                Err(err) => {
                    attempt += 1;
                    if attempt >= backoff.attempts {
                        warn!(err = %err, attempts = attempt, "model retries exhausted");
                        self.last_error = Some(err.to_string());
                        return Ok(EngineState::Terminated(SessionStatus::Error));
                    }
                    let delay = backoff.delay(attempt - 1, err.retry_after());
                    warn!(
                        err = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "model call failed, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        };

        self.cost.record(&response.usage);
        debug!(
            call = self.cost.calls(),
            total_cost = self.cost.total_cost(),
            "model call accounted"
        );
        self.ensure_running()?;
        if self.cost.exceeded(profile.ceilings.cost) {
            warn!(
                total_cost = self.cost.total_cost(),
                ceiling = profile.ceilings.cost,
                "cost ceiling reached; response not executed"
            );
            partition.append(NewRecord::correction(
                response_raw(&response),
                "cost ceiling reached; response not executed".to_string(),
            ));
            return Ok(EngineState::Terminated(SessionStatus::CostExceeded));
        }
        Ok(EngineState::Parse(response))
    }

    fn parse(&mut self, response: ModelResponse) -> Result<EngineState> {
        let profile = self.session.profile();
        let raw = response_raw(&response);
        let output = ModelOutput {
            raw_text: &response.raw_text,
            function_call: response.action.as_ref(),
        };
        let context = ParseContext {
            policy: &profile.policy,
            tools: &profile.tool_schema,
        };

        match profile.parser.parser().parse(&output, &context) {
            Ok(parsed) => {
                self.parse_retries.reset();
                Ok(EngineState::Execute {
                    parsed,
                    response_raw: raw,
                })
            }
            Err(failure) => {
                let feedback = match &failure {
                    ParseFailure::Syntax { reason } => self.renderer.format_error(reason)?,
                    ParseFailure::PolicyViolation { command } => {
                        let allowed: Vec<&str> = profile.policy.allowed().collect();
                        self.renderer
                            .policy_violation(command, profile.role.as_str(), &allowed)?
                    }
                };
                warn!(
                    failure = %failure,
                    consecutive = self.parse_retries.consecutive() + 1,
                    "model output rejected"
                );
                self.session
                    .partition()
                    .append(NewRecord::correction(raw, feedback));
                if self.parse_retries.fail(profile.ceilings.parse_retries) {
                    return Ok(EngineState::Terminated(SessionStatus::ParseExhausted));
                }
                Ok(EngineState::QueryModel)
            }
        }
    }

    fn execute(&mut self, parsed: ParsedAction, response_raw: String) -> Result<EngineState> {
        let session = self.session;
        let profile = session.profile();
        let env = session.environment()?;
        let outcome = match &parsed.action {
            Action::Shell { command } => {
                let result = env
                    .execute(command, profile.command_timeout)
                    .with_context(|| format!("execute '{command}'"))?;
                self.count_command(result.success());
                ExecOutcome {
                    observation: truncate_observation(
                        &result.observation(),
                        profile.observation_limit_bytes,
                    ),
                    exit_code: Some(result.exit_code),
                    terminal_payload: None,
                }
            }
            Action::Submit => {
                let result = env
                    .execute(&profile.submit_command, profile.command_timeout)
                    .context("execute submit command")?;
                self.count_command(result.success());
                if result.success() {
                    info!(bytes = result.stdout.len(), "submission collected");
                    ExecOutcome {
                        observation: format!(
                            "Submission recorded ({} bytes).",
                            result.stdout.trim().len()
                        ),
                        exit_code: Some(result.exit_code),
                        terminal_payload: Some(result.stdout),
                    }
                } else {
                    warn!(exit_code = result.exit_code, "submit command failed");
                    ExecOutcome {
                        observation: truncate_observation(
                            &format!("Submission failed.\n{}", result.observation()),
                            profile.observation_limit_bytes,
                        ),
                        exit_code: Some(result.exit_code),
                        terminal_payload: None,
                    }
                }
            }
            Action::Exit { message } => ExecOutcome {
                observation: "Session ended.".to_string(),
                exit_code: None,
                terminal_payload: Some(message.clone()),
            },
        };
        Ok(EngineState::Record {
            parsed,
            response_raw,
            outcome,
        })
    }

    fn record(
        &mut self,
        parsed: ParsedAction,
        response_raw: String,
        outcome: ExecOutcome,
    ) -> EngineState {
        let ExecOutcome {
            observation,
            exit_code,
            terminal_payload,
        } = outcome;
        self.session.partition().append(NewRecord::step(
            parsed.thought,
            parsed.action,
            observation,
            exit_code,
            response_raw,
        ));
        self.steps += 1;
        if terminal_payload.is_some() {
            self.terminal_payload = terminal_payload;
        }
        EngineState::CheckTermination
    }

    fn check_termination(&mut self) -> Result<EngineState> {
        self.ensure_running()?;
        let ceilings = self.session.profile().ceilings;
        if let Some(payload) = self.terminal_payload.take() {
            self.submission = Some(payload);
            return Ok(EngineState::Terminated(SessionStatus::Success));
        }
        if self.cost.exceeded(ceilings.cost) {
            return Ok(EngineState::Terminated(SessionStatus::CostExceeded));
        }
        if self.steps >= ceilings.steps {
            return Ok(EngineState::Terminated(SessionStatus::StepExceeded));
        }
        Ok(EngineState::QueryModel)
    }

    /// Abort once the sandbox has been torn down, whatever state the engine is in.
    fn ensure_running(&self) -> Result<()> {
        if self.session.environment()?.is_stopped() {
            warn!(
                model_calls = self.cost.calls(),
                total_cost = self.cost.total_cost(),
                "sandbox torn down; aborting session"
            );
            return Err(EnvError::Stopped).context("sandbox torn down during session");
        }
        Ok(())
    }

    fn count_command(&mut self, success: bool) {
        self.commands_run += 1;
        if success {
            self.commands_ok += 1;
        }
    }

    fn system_prompt(&self) -> Result<String> {
        let profile = self.session.profile();
        self.renderer.system(&SystemContext {
            role: profile.role.as_str(),
            agent_id: self.session.agent_id().as_str(),
            commands: profile.policy.allowed().collect(),
            tools: profile.tool_schema.names(),
            parser: profile.parser.as_str(),
        })
    }

    /// Message sequence rebuilt from this agent's partition only.
    fn messages(&self, records: &[StepRecord]) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(records.len() * 2);
        for record in records {
            match record.role {
                StepRole::System | StepRole::User => {
                    messages.push(Message::new(record.role, record.response_raw.clone()));
                }
                StepRole::Assistant => {
                    messages.push(Message::new(
                        StepRole::Assistant,
                        record.response_raw.clone(),
                    ));
                    if let Some(observation) = &record.observation {
                        messages.push(Message::new(
                            StepRole::User,
                            self.renderer.next_step(observation, record.exit_code)?,
                        ));
                    }
                }
                StepRole::Tool => {
                    messages.push(Message::new(
                        StepRole::Assistant,
                        record.response_raw.clone(),
                    ));
                    if let Some(feedback) = &record.observation {
                        messages.push(Message::new(StepRole::User, feedback.clone()));
                    }
                }
            }
        }
        Ok(messages)
    }

    fn into_result(self, status: SessionStatus) -> AgentResult {
        let trajectory = Trajectory {
            agent_id: self.session.agent_id().clone(),
            steps: self.session.partition().records(),
        };
        let evidence = trajectory
            .steps
            .iter()
            .filter_map(|step| step.thought.as_deref().map(str::trim))
            .filter(|thought| is_substantial(thought))
            .map(str::to_string)
            .collect();

        let mut artifacts = BTreeMap::new();
        artifacts.insert(artifact::EXIT_STATUS.to_string(), status.as_str().to_string());
        artifacts.insert(artifact::MODEL_CALLS.to_string(), self.cost.calls().to_string());
        artifacts.insert(
            artifact::TOTAL_COST.to_string(),
            format!("{:.6}", self.cost.total_cost()),
        );
        artifacts.insert(artifact::STEPS.to_string(), self.steps.to_string());
        if let Some(submission) = self.submission {
            artifacts.insert(artifact::SUBMISSION.to_string(), submission);
        }
        if let Some(error) = self.last_error {
            artifacts.insert(artifact::ERROR.to_string(), error);
        }

        let score = if self.commands_run == 0 {
            0.0
        } else {
            f64::from(self.commands_ok) / f64::from(self.commands_run)
        };

        AgentResult {
            agent_id: self.session.agent_id().clone(),
            status,
            evidence,
            artifacts,
            score,
            trajectory,
        }
    }
}

/// Raw response text as recorded in history, including any structured call.
fn response_raw(response: &ModelResponse) -> String {
    match &response.action {
        Some(call) => {
            let call_json = serde_json::to_string(call).unwrap_or_else(|_| call.name.clone());
            format!("{}\n[tool call] {call_json}", response.raw_text)
                .trim()
                .to_string()
        }
        None => response.raw_text.clone(),
    }
}
