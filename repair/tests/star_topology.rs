//! End-to-end coordinator tests over scripted model and sandbox doubles.
//!
//! Each test drives `Coordinator::run` through a full plan and checks what crossed
//! (or did not cross) the boundaries between spokes.

use std::collections::BTreeMap;

use repair::coordinator::{Coordinator, CoordinatorEvent};
use repair::core::history::StepRecord;
use repair::core::policy::CommandPolicy;
use repair::core::result::RunOutcome;
use repair::core::tools::ToolSchema;
use repair::core::types::{AgentId, Role, SessionStatus, StepRole};
use repair::io::config::{RunPlan, SpokeSpec};
use repair::io::local_env::LocalShellEnvironment;
use repair::io::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use repair::io::sandbox::{EnvError, SharedEnvironment, TeardownHandle, ToolBundle};
use repair::io::trajectory_store::write_run;
use repair::test_support::{
    RecordingSandbox, ScriptedModel, fast_profile, fenced, request, temp_repo, write_file,
};

const SUBMIT: &str = "git add -A && git diff --cached";

fn two_spoke() -> RunPlan {
    RunPlan::two_spoke(
        fast_profile(Role::Investigator),
        fast_profile(Role::Implementer),
    )
}

fn agent_ids(steps: &[StepRecord]) -> Vec<&AgentId> {
    steps.iter().map(|step| &step.agent_id).collect()
}

/// Investigator locates the bug in `main.py`; the implementer only learns it through
/// the augmented request and starts from an empty partition.
#[test]
fn findings_flow_only_through_augmented_request() {
    let sandbox = RecordingSandbox::new();
    sandbox.respond(
        "python main.py",
        "Traceback (most recent call last):\nAttributeError: '_helper' is protected\n",
        1,
    );
    sandbox.respond(SUBMIT, "diff --git a/main.py b/main.py\n", 0);
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let model = ScriptedModel::texts([
        fenced("Let me reproduce the failure first.", "python main.py"),
        fenced(
            "The bug is in main.py: the root cause is direct access to protected method _helper.",
            "exit main.py: direct access to protected method _helper from run()",
        ),
        fenced("Switch run() to the public helper.", "sed -i 's/_helper/helper/' main.py"),
        fenced("The change is complete.", "submit"),
    ]);
    let mut events = Vec::new();

    let report = coordinator
        .run(&model, &request("r1", "run() crashes"), |event| {
            events.push(event.clone());
        })
        .expect("run");

    let implementer_start = events
        .iter()
        .find_map(|event| match event {
            CoordinatorEvent::SpokeStarted {
                spoke,
                partition_len,
                ..
            } if spoke == "implementer" => Some(*partition_len),
            _ => None,
        })
        .expect("implementer started");
    assert_eq!(implementer_start, 0);

    let augmented = &report.requests["implementer"];
    assert!(
        augmented
            .problem_text()
            .contains("direct access to protected method")
    );
    assert!(augmented.problem_text().contains("main.py"));
    assert!(augmented.context_files().contains_key("handoff/investigator.md"));
    assert_eq!(report.requests["investigator"].problem_text(), "run() crashes");

    let requests = model.requests();
    assert_eq!(requests.len(), 4);
    let implementer_first = &requests[2];
    assert_eq!(implementer_first.messages.len(), 2);
    assert!(
        implementer_first.messages[1]
            .content
            .contains("direct access to protected method")
    );
    assert!(
        implementer_first
            .messages
            .iter()
            .all(|m| !m.content.contains("```bash\npython main.py"))
    );

    let handoff = &report.handoffs[0];
    assert!(
        handoff
            .problem_location
            .iter()
            .any(|entry| entry.contains("main.py"))
    );
    assert!(!handoff.root_cause.is_empty());
    assert!(!handoff.errors.is_empty());

    assert_eq!(
        report.result.final_patch.as_deref(),
        Some("diff --git a/main.py b/main.py\n")
    );
    assert!(report.result.validated);
    assert_eq!(report.result.outcome(), RunOutcome::Validated);
}

#[test]
fn default_plan_installs_tools_exactly_once() {
    let sandbox = RecordingSandbox::new();
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let model = ScriptedModel::texts([
        fenced("Nothing to see.", "exit nothing found"),
        fenced("Submitting as is.", "submit"),
    ]);

    coordinator
        .run(&model, &request("r0", "default plan"), |_| {})
        .expect("run");

    assert_eq!(sandbox.start_calls(), 1);
    assert_eq!(sandbox.install_calls(), 1);
    assert!(sandbox.installed().is_empty());
}

#[test]
fn partitions_are_isolated_and_bootstrap_runs_once() {
    let sandbox = RecordingSandbox::new();
    let mut investigator = fast_profile(Role::Investigator);
    investigator.tools = vec![ToolBundle {
        name: "search".to_string(),
        install: vec!["install-search".to_string()],
    }];
    investigator.env = BTreeMap::from([("PAGER".to_string(), "cat".to_string())]);
    let mut implementer = fast_profile(Role::Implementer);
    implementer.tools = vec![
        ToolBundle {
            name: "search".to_string(),
            install: vec!["install-search".to_string()],
        },
        ToolBundle {
            name: "edit".to_string(),
            install: vec!["install-edit".to_string()],
        },
    ];
    let coordinator = Coordinator::new(
        SharedEnvironment::new(sandbox.clone()),
        RunPlan::two_spoke(investigator, implementer),
    )
    .expect("plan");
    let model = ScriptedModel::texts([
        fenced("Looking around the tree.", "ls"),
        fenced("Nothing more to learn here.", "exit done"),
        fenced("Editing the file now.", "touch fixed"),
        fenced("Submitting.", "submit"),
    ]);

    let report = coordinator
        .run(&model, &request("r2", "something is broken"), |_| {})
        .expect("run");

    assert_eq!(sandbox.start_calls(), 1);
    assert_eq!(sandbox.install_calls(), 1);
    let installed: Vec<String> = sandbox.installed().into_iter().map(|t| t.name).collect();
    assert_eq!(installed, vec!["search".to_string(), "edit".to_string()]);
    assert_eq!(sandbox.variables().get("PAGER").map(String::as_str), Some("cat"));

    let investigator_id = AgentId::for_spoke("r2", "investigator");
    let implementer_id = AgentId::for_spoke("r2", "implementer");
    let investigator = &report.result.per_agent[&investigator_id];
    let implementer = &report.result.per_agent[&implementer_id];
    assert!(!investigator.trajectory.is_empty());
    assert!(!implementer.trajectory.is_empty());
    assert!(
        agent_ids(&investigator.trajectory.steps)
            .into_iter()
            .all(|id| id == &investigator_id)
    );
    assert!(
        agent_ids(&implementer.trajectory.steps)
            .into_iter()
            .all(|id| id == &implementer_id)
    );
}

/// An implementer configured with the investigator's command policy cannot submit.
#[test]
fn submit_under_investigator_policy_is_rejected() {
    let sandbox = RecordingSandbox::new();
    let mut implementer = fast_profile(Role::Implementer);
    implementer.policy = CommandPolicy::for_role(Role::Investigator);
    implementer.tool_schema = ToolSchema::for_policy(&implementer.policy);
    implementer.submit_command = "collect-diff".to_string();
    implementer.ceilings.steps = 1;
    let coordinator = Coordinator::new(
        SharedEnvironment::new(sandbox.clone()),
        RunPlan::two_spoke(fast_profile(Role::Investigator), implementer),
    )
    .expect("plan");
    let model = ScriptedModel::texts([
        fenced("Nothing to investigate.", "exit nothing"),
        fenced("Submitting right away.", "submit"),
        fenced("Listing files instead.", "ls"),
    ]);

    let report = coordinator
        .run(&model, &request("r3", "bug"), |_| {})
        .expect("run");

    let implementer = report.agent("implementer").expect("implementer");
    assert_eq!(implementer.status, SessionStatus::StepExceeded);
    let correction = implementer
        .trajectory
        .steps
        .iter()
        .find(|step| step.role == StepRole::Tool)
        .expect("correction");
    assert!(
        correction
            .observation
            .as_deref()
            .is_some_and(|o| o.contains("Command not permitted: 'submit'"))
    );
    // The only run of the submit command is the coordinator's post-run collection.
    assert_eq!(
        sandbox.executed(),
        vec!["ls".to_string(), "collect-diff".to_string()]
    );
    assert_eq!(report.result.outcome(), RunOutcome::NoPatch);
}

/// A failed investigator still yields a handoff, and the implementer is warned.
#[test]
fn exhausted_investigator_degrades_handoff() {
    let sandbox = RecordingSandbox::new();
    sandbox.respond(SUBMIT, "diff --git a/a b/a\n", 0);
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let mut script = vec!["no action here".to_string(); 4];
    script.push(fenced("Applying the obvious fix.", "touch a"));
    script.push(fenced("Done.", "submit"));
    let model = ScriptedModel::texts(script);

    let report = coordinator
        .run(&model, &request("r4", "bug"), |_| {})
        .expect("run");

    let investigator = report.agent("investigator").expect("investigator");
    assert_eq!(investigator.status, SessionStatus::ParseExhausted);
    assert!(investigator.trajectory.model_turns().all(|s| s.role == StepRole::Tool));

    let handoff = &report.handoffs[0];
    assert!(handoff.is_incomplete());
    let rendered = handoff.render();
    for heading in [
        "1. PROBLEM LOCATION",
        "2. ROOT CAUSE",
        "3. ERRORS OBSERVED",
        "4. REPRODUCTION EVIDENCE",
        "5. FINAL ANALYSIS",
        "6. EXIT STATUS: parse_exhausted",
    ] {
        assert!(rendered.contains(heading), "missing {heading}");
    }
    assert!(rendered.contains("[INCOMPLETE:"));

    assert!(
        report.requests["implementer"]
            .problem_text()
            .starts_with("WARNING")
    );
    assert_eq!(report.result.outcome(), RunOutcome::Validated);
}

#[test]
fn zero_cost_ceiling_stops_at_first_call() {
    let sandbox = RecordingSandbox::new();
    let mut investigator = fast_profile(Role::Investigator);
    investigator.ceilings.cost = 0.0;
    let coordinator = Coordinator::new(
        SharedEnvironment::new(sandbox.clone()),
        RunPlan::two_spoke(investigator, fast_profile(Role::Implementer)),
    )
    .expect("plan");
    let model = ScriptedModel::costed(
        [
            fenced("Looking.", "ls"),
            fenced("Nothing found, submitting.", "submit"),
        ],
        0.01,
    );

    let report = coordinator
        .run(&model, &request("r5", "bug"), |_| {})
        .expect("run");

    let investigator = report.agent("investigator").expect("investigator");
    assert_eq!(investigator.status, SessionStatus::CostExceeded);
    assert_eq!(
        investigator.artifacts.get("model_calls").map(String::as_str),
        Some("1")
    );
    assert!(!sandbox.executed().contains(&"ls".to_string()));
}

#[test]
fn environment_fault_aborts_run_and_tears_down() {
    let sandbox = RecordingSandbox::new();
    sandbox.fail_on("ls", EnvError::Execution("container vanished".to_string()));
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let model = ScriptedModel::texts([fenced("Looking.", "ls")]);

    let err = coordinator
        .run(&model, &request("r6", "bug"), |_| {})
        .unwrap_err();

    assert!(format!("{err:#}").contains("container vanished"));
    assert_eq!(sandbox.stop_calls(), 1);
}

#[test]
fn teardown_is_idempotent() {
    let sandbox = RecordingSandbox::new();
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let handle = coordinator.teardown_handle();
    let model = ScriptedModel::texts([
        fenced("Nothing to see.", "exit ok"),
        fenced("Nothing to change.", "submit"),
    ]);

    coordinator
        .run(&model, &request("r7", "bug"), |_| {})
        .expect("run");

    handle.stop().expect("first extra stop");
    handle.stop().expect("second extra stop");
    assert_eq!(sandbox.stop_calls(), 1);
}

/// Model that answers from a script but tears the sandbox down on its first call.
struct TimedOutModel {
    teardown: TeardownHandle,
    inner: ScriptedModel,
}

impl ModelClient for TimedOutModel {
    fn query(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.teardown.stop().expect("stop");
        self.inner.query(request)
    }
}

#[test]
fn teardown_mid_spoke_cancels_remaining_spokes() {
    let sandbox = RecordingSandbox::new();
    let coordinator =
        Coordinator::new(SharedEnvironment::new(sandbox.clone()), two_spoke()).expect("plan");
    let model = TimedOutModel {
        teardown: coordinator.teardown_handle(),
        inner: ScriptedModel::texts([
            fenced("Found it.", "exit main.py is broken"),
            fenced("Submitting.", "submit"),
        ]),
    };
    let mut started = Vec::new();

    let err = coordinator
        .run(&model, &request("r10", "bug"), |event| {
            if let CoordinatorEvent::SpokeStarted { spoke, .. } = event {
                started.push(spoke.clone());
            }
        })
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EnvError>(),
        Some(EnvError::Stopped)
    ));
    assert_eq!(started, vec!["investigator".to_string()]);
    assert_eq!(model.inner.calls(), 1);
    assert!(sandbox.executed().is_empty());
    assert_eq!(sandbox.stop_calls(), 1);
}

/// Every spoke after the first sees the handoffs of all earlier spokes.
#[test]
fn later_spokes_receive_all_previous_handoffs() {
    let sandbox = RecordingSandbox::new();
    let plan = RunPlan {
        spokes: vec![
            SpokeSpec::new("topology", fast_profile(Role::Investigator)),
            SpokeSpec::new("temporal", fast_profile(Role::Investigator)),
            SpokeSpec::new("fix", fast_profile(Role::Implementer)),
        ],
        output_dir: None,
    };
    let coordinator = Coordinator::new(SharedEnvironment::new(sandbox), plan).expect("plan");
    let model = ScriptedModel::texts([
        fenced("Mapping modules.", "exit mapped"),
        fenced("Checking history.", "exit checked"),
        fenced("Submitting.", "submit"),
    ]);

    let report = coordinator
        .run(&model, &request("r8", "bug"), |_| {})
        .expect("run");

    assert_eq!(report.spokes, vec!["topology", "temporal", "fix"]);
    let temporal = report.requests["temporal"].context_files();
    assert!(temporal.contains_key("handoff/topology.md"));
    assert!(!temporal.contains_key("handoff/temporal.md"));
    let fix = report.requests["fix"].context_files();
    assert!(fix.contains_key("handoff/topology.md"));
    assert!(fix.contains_key("handoff/temporal.md"));
    assert_eq!(report.handoffs.len(), 3);
}

/// Full run against a real shell sandbox, persisted to disk.
#[test]
fn local_shell_run_persists_artifacts() {
    let repo = temp_repo();
    write_file(repo.path(), "main.py", "print(obj._helper())\n");
    let mut implementer = fast_profile(Role::Implementer);
    implementer.submit_command = "cat main.py".to_string();
    let coordinator = Coordinator::new(
        SharedEnvironment::new(LocalShellEnvironment::new(repo.path())),
        RunPlan::two_spoke(fast_profile(Role::Investigator), implementer),
    )
    .expect("plan");
    let model = ScriptedModel::texts([
        fenced("Find the protected call.", "grep -n _helper main.py"),
        fenced("The bug is in main.py line 1.", "exit main.py:1 uses _helper"),
        fenced("Use the public method.", "printf 'print(obj.helper())\\n' > main.py"),
        fenced("Fixed.", "submit"),
    ]);

    let report = coordinator
        .run(&model, &request("r9", "protected access"), |_| {})
        .expect("run");

    let requests = model.requests();
    let grep_observation = &requests[1].messages.last().expect("message").content;
    assert!(grep_observation.contains("1:print(obj._helper())"));
    assert_eq!(
        report.result.final_patch.as_deref(),
        Some("print(obj.helper())\n")
    );

    let out = tempfile::tempdir().expect("tempdir");
    let paths = write_run(out.path(), &report.record()).expect("write");
    assert!(paths.trajectory_path("investigator").is_file());
    assert!(paths.trajectory_path("implementer").is_file());
    assert!(paths.handoff_path("investigator").is_file());
    assert!(paths.run_result_path.is_file());
    let summary = std::fs::read_to_string(paths.summary_path).expect("summary");
    assert!(summary.contains("outcome: patch produced and validated"));
}
