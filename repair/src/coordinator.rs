//! Star-topology hub: one shared sandbox, spokes dispatched in plan order.
//!
//! Spokes never see each other's history. The only thing that flows forward is the
//! rendered [`HandoffDocument`] of every earlier spoke, baked into a derived request.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::handoff::HandoffDocument;
use crate::core::history::History;
use crate::core::request::RepairRequest;
use crate::core::result::{AgentResult, RunResult};
use crate::core::types::{AgentId, SessionStatus};
use crate::engine::run_session;
use crate::io::config::{RunPlan, SpokeSpec};
use crate::io::model::ModelClient;
use crate::io::sandbox::{EnvError, SharedEnvironment, TeardownHandle};
use crate::io::trajectory_store::RunRecord;
use crate::session::AgentSession;

/// Progress reported to the caller while a run is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Bootstrapped {
        tools: usize,
        variables: usize,
    },
    SpokeStarted {
        spoke: String,
        agent_id: AgentId,
        /// Records already in the spoke's partition when it was dispatched.
        partition_len: usize,
    },
    SpokeFinished {
        spoke: String,
        status: SessionStatus,
        model_turns: usize,
    },
    HandoffExtracted {
        spoke: String,
        incomplete: bool,
    },
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: RunResult,
    /// Spoke names in dispatch order.
    pub spokes: Vec<String>,
    pub handoffs: Vec<HandoffDocument>,
    /// Requests each spoke was dispatched with, keyed by spoke name.
    pub requests: BTreeMap<String, RepairRequest>,
}

impl RunReport {
    pub fn agent(&self, spoke: &str) -> Option<&AgentResult> {
        self.result
            .per_agent
            .get(&AgentId::for_spoke(&self.result.request_id, spoke))
    }

    /// Borrowed view for the trajectory store.
    pub fn record(&self) -> RunRecord<'_> {
        let spokes = self
            .spokes
            .iter()
            .filter_map(|spoke| self.agent(spoke).map(|agent| (spoke.as_str(), agent)))
            .collect();
        RunRecord {
            result: &self.result,
            spokes,
            handoffs: &self.handoffs,
        }
    }
}

/// Sole owner of the shared sandbox for one run.
#[derive(Debug)]
pub struct Coordinator {
    env: Arc<SharedEnvironment>,
    plan: RunPlan,
}

impl Coordinator {
    pub fn new(env: SharedEnvironment, plan: RunPlan) -> Result<Self> {
        plan.validate().context("validate run plan")?;
        Ok(Self {
            env: Arc::new(env),
            plan,
        })
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Stop capability for a supervisor running outside the engine.
    pub fn teardown_handle(&self) -> TeardownHandle {
        self.env.teardown_handle()
    }

    /// Bootstrap once, dispatch every spoke in order, then tear the sandbox down.
    ///
    /// Environment faults abort the run; anything a spoke can recover from ends up in
    /// its status instead.
    #[instrument(skip_all, fields(request_id = %request.id(), spokes = self.plan.spokes.len()))]
    pub fn run<M: ModelClient, F: FnMut(&CoordinatorEvent)>(
        &self,
        model: &M,
        request: &RepairRequest,
        mut on_event: F,
    ) -> Result<RunReport> {
        let outcome = self.dispatch_all(model, request, &mut on_event);
        if let Err(err) = self.env.stop() {
            warn!(err = %err, "failed to stop sandbox");
        }
        outcome
    }

    fn dispatch_all<M: ModelClient>(
        &self,
        model: &M,
        request: &RepairRequest,
        on_event: &mut dyn FnMut(&CoordinatorEvent),
    ) -> Result<RunReport> {
        let tools = self.plan.tool_union();
        let variables = self.plan.variable_union();
        self.env
            .bootstrap(&tools, &variables)
            .context("bootstrap shared sandbox")?;
        info!(tools = tools.len(), "shared sandbox ready");
        on_event(&CoordinatorEvent::Bootstrapped {
            tools: tools.len(),
            variables: variables.len(),
        });

        let history = History::new();
        let mut results: Vec<(String, AgentResult)> = Vec::new();
        let mut handoffs: Vec<HandoffDocument> = Vec::new();
        let mut requests = BTreeMap::new();

        for spoke in &self.plan.spokes {
            if self.env.is_stopped() {
                warn!(spoke = %spoke.name, "sandbox torn down; not dispatching");
                return Err(EnvError::Stopped)
                    .with_context(|| format!("dispatch spoke '{}'", spoke.name));
            }
            let spoke_request = if handoffs.is_empty() {
                request.clone()
            } else {
                augment(request, &handoffs)
            };
            let result = self.dispatch(spoke, &history, model, &spoke_request, on_event)?;

            let handoff = HandoffDocument::extract(&spoke.name, &result);
            if handoff.is_incomplete() {
                warn!(
                    spoke = %spoke.name,
                    empty = handoff.empty_sections().len(),
                    "handoff incomplete"
                );
            }
            on_event(&CoordinatorEvent::HandoffExtracted {
                spoke: spoke.name.clone(),
                incomplete: handoff.is_incomplete(),
            });

            requests.insert(spoke.name.clone(), spoke_request);
            handoffs.push(handoff);
            results.push((spoke.name.clone(), result));
        }

        let (final_patch, validated) = self.synthesize_patch(&results);
        let spokes = results.iter().map(|(name, _)| name.clone()).collect();
        let per_agent = results
            .into_iter()
            .map(|(_, agent)| (agent.agent_id.clone(), agent))
            .collect();
        let result = RunResult {
            request_id: request.id().to_string(),
            per_agent,
            final_patch,
            validated,
        };
        info!(outcome = result.outcome().describe(), "run finished");
        Ok(RunReport {
            result,
            spokes,
            handoffs,
            requests,
        })
    }

    #[instrument(skip_all, fields(spoke = %spoke.name, role = %spoke.profile.role))]
    fn dispatch<M: ModelClient>(
        &self,
        spoke: &SpokeSpec,
        history: &History,
        model: &M,
        request: &RepairRequest,
        on_event: &mut dyn FnMut(&CoordinatorEvent),
    ) -> Result<AgentResult> {
        let session = AgentSession::injected(
            history,
            AgentId::for_spoke(request.id(), &spoke.name),
            spoke.name.clone(),
            spoke.profile.clone(),
            self.env.injected(),
        );
        info!(agent_id = %session.agent_id(), "dispatching spoke");
        on_event(&CoordinatorEvent::SpokeStarted {
            spoke: spoke.name.clone(),
            agent_id: session.agent_id().clone(),
            partition_len: session.partition().len(),
        });

        let result = run_session(&session, model, request)
            .with_context(|| format!("run spoke '{}'", spoke.name))?;
        on_event(&CoordinatorEvent::SpokeFinished {
            spoke: spoke.name.clone(),
            status: result.status,
            model_turns: result.trajectory.model_turns().count(),
        });
        Ok(result)
    }

    /// Patch of the final spoke.
    ///
    /// A successful submission is validated. Otherwise the final spoke's submit command
    /// is run once more to collect any work left in the tree, which is reported but
    /// never validated.
    fn synthesize_patch(&self, results: &[(String, AgentResult)]) -> (Option<String>, bool) {
        let Some((name, last)) = results.last() else {
            return (None, false);
        };
        if let Some(patch) = last.submission().filter(|p| !p.trim().is_empty()) {
            return (Some(patch.to_string()), last.succeeded());
        }
        if last.succeeded() {
            return (None, false);
        }
        let Some(spoke) = self.plan.spokes.iter().find(|s| &s.name == name) else {
            return (None, false);
        };
        match self
            .env
            .execute(&spoke.profile.submit_command, spoke.profile.command_timeout)
        {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                warn!(spoke = %name, status = %last.status, "collected unvalidated patch");
                (Some(output.stdout), false)
            }
            Ok(_) => (None, false),
            Err(err) => {
                warn!(err = %err, "could not collect patch after failed spoke");
                (None, false)
            }
        }
    }
}

/// Derived request for a spoke that follows `handoffs`.
pub fn augment(request: &RepairRequest, handoffs: &[HandoffDocument]) -> RepairRequest {
    let rendered: Vec<(String, String)> = handoffs
        .iter()
        .map(|handoff| (format!("handoff/{}.md", handoff.spoke), handoff.render()))
        .collect();
    request.augmented(augmented_problem_text(request, handoffs, &rendered), rendered)
}

fn augmented_problem_text(
    request: &RepairRequest,
    handoffs: &[HandoffDocument],
    rendered: &[(String, String)],
) -> String {
    let mut out = String::new();
    let degraded: Vec<&HandoffDocument> = handoffs
        .iter()
        .filter(|handoff| handoff.status != SessionStatus::Success)
        .collect();
    if !degraded.is_empty() {
        let _ = writeln!(
            out,
            "WARNING: earlier analysis did not finish cleanly ({}). Treat the findings below as partial and verify them yourself.",
            degraded
                .iter()
                .map(|h| format!("{}: {}", h.spoke, h.status.describe()))
                .collect::<Vec<_>>()
                .join("; ")
        );
        out.push('\n');
    }

    out.push_str("TASK\n");
    out.push_str("Fix the issue below. Earlier analysis of the repository is included.\n\n");
    out.push_str("ISSUE\n");
    out.push_str(request.problem_text().trim());
    out.push_str("\n\n");
    for (handoff, (_, body)) in handoffs.iter().zip(rendered) {
        let _ = writeln!(out, "FINDINGS FROM {}", handoff.spoke.to_uppercase());
        out.push_str(body.trim());
        out.push_str("\n\n");
    }
    out.push_str("INSTRUCTIONS\n");
    out.push_str(
        "1. Confirm the reported location and root cause before editing.\n\
         2. Make the smallest change that resolves the issue.\n\
         3. Re-run the reproduction to check the fix.\n\
         4. Submit when the change is complete.",
    );
    out
}
