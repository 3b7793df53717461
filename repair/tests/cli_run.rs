//! CLI tests for `repair run` and `repair check-config`.
//!
//! Spawns the binary against a temp repository with a shell script standing in for
//! the model, and verifies exit codes and persisted artifacts.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use serde_json::json;

use repair::exit_codes;

const MODEL_SCRIPT: &str = r#"#!/bin/sh
cat > /dev/null
dir=$(dirname "$0")
n=$(cat "$dir/count" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$dir/count"
if [ -f "$dir/response_$n.json" ]; then
  cat "$dir/response_$n.json"
else
  echo "script exhausted" >&2
  exit 1
fi
"#;

fn fenced(thought: &str, command: &str) -> String {
    format!("{thought}\n\n```bash\n{command}\n```\n")
}

/// Write the model script and one JSON response file per expected call.
fn write_model(dir: &Path, responses: &[String]) {
    fs::write(dir.join("model.sh"), MODEL_SCRIPT).expect("write model script");
    for (index, text) in responses.iter().enumerate() {
        let body = json!({ "raw_text": text, "usage": { "cost": 0.001 } });
        fs::write(
            dir.join(format!("response_{}.json", index + 1)),
            body.to_string(),
        )
        .expect("write response");
    }
}

fn repair_cmd(cwd: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_repair"));
    cmd.current_dir(cwd).env("RUST_LOG", "warn");
    cmd
}

#[test]
fn run_writes_artifacts_and_exits_ok() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    let model_dir = temp.path().join("model");
    let out = temp.path().join("out");
    fs::create_dir_all(&repo).expect("repo dir");
    fs::create_dir_all(&model_dir).expect("model dir");
    fs::write(repo.join("main.py"), "print(obj._helper())\n").expect("main.py");
    fs::write(
        temp.path().join("implementer.toml"),
        "role = \"implementer\"\n\n[commands]\nsubmit_command = \"cat main.py\"\n\n[limits]\nbackoff_ms = 0\n",
    )
    .expect("implementer config");
    write_model(
        &model_dir,
        &[
            fenced("The bug is in main.py.", "exit main.py calls a protected method"),
            fenced("Use the public method.", "printf 'print(obj.helper())\\n' > main.py"),
            fenced("Fixed.", "submit"),
        ],
    );

    let output = repair_cmd(temp.path())
        .args(["run", "--repo"])
        .arg(&repo)
        .args(["--issue-text", "run() crashes", "--request-id", "r1"])
        .arg("--implementer-config")
        .arg(temp.path().join("implementer.toml"))
        .arg("--output-dir")
        .arg(&out)
        .args(["--model-command", "sh", "--model-arg"])
        .arg(model_dir.join("model.sh"))
        .output()
        .expect("repair run");

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let run_dir = out.join("r1");
    assert!(run_dir.join("investigator.traj.json").is_file());
    assert!(run_dir.join("implementer.traj.json").is_file());
    assert!(run_dir.join("handoff_investigator.md").is_file());

    let raw = fs::read_to_string(run_dir.join("run_result.json")).expect("run result");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["final_patch"], "print(obj.helper())\n");
    assert_eq!(value["validated"], true);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("outcome: patch produced and validated"));
}

#[test]
fn run_without_patch_exits_no_patch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    let model_dir = temp.path().join("model");
    fs::create_dir_all(&repo).expect("repo dir");
    fs::create_dir_all(&model_dir).expect("model dir");
    fs::write(
        temp.path().join("implementer.toml"),
        "[commands]\nsubmit_command = \"true\"\n\n[limits]\nstep_ceiling = 1\nbackoff_ms = 0\n",
    )
    .expect("implementer config");
    write_model(
        &model_dir,
        &[
            fenced("Nothing obvious here.", "exit unclear"),
            fenced("Looking around.", "ls"),
        ],
    );

    let output = repair_cmd(temp.path())
        .args(["run", "--repo"])
        .arg(&repo)
        .args(["--issue-text", "something", "--request-id", "r2"])
        .arg("--implementer-config")
        .arg(temp.path().join("implementer.toml"))
        .args(["--output-dir", "out", "--model-command", "sh", "--model-arg"])
        .arg(model_dir.join("model.sh"))
        .output()
        .expect("repair run");

    assert_eq!(output.status.code(), Some(exit_codes::NO_PATCH));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("final spoke 'implementer' terminated with step_exceeded"));
    assert!(temp.path().join("out/r2/summary.txt").is_file());
}

#[test]
fn run_timeout_cancels_a_spoke_waiting_on_the_model() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    let model_dir = temp.path().join("model");
    fs::create_dir_all(&repo).expect("repo dir");
    fs::create_dir_all(&model_dir).expect("model dir");
    let body = json!({
        "raw_text": fenced("Found it.", "exit main.py is broken"),
        "usage": { "cost": 0.001 },
    });
    fs::write(model_dir.join("response.json"), body.to_string()).expect("write response");
    fs::write(
        model_dir.join("slow.sh"),
        "#!/bin/sh\ncat > /dev/null\nsleep 3\ncat \"$(dirname \"$0\")/response.json\"\n",
    )
    .expect("write model script");

    let started = Instant::now();
    let output = repair_cmd(temp.path())
        .args(["run", "--repo"])
        .arg(&repo)
        .args(["--issue-text", "bug", "--request-id", "r3", "--timeout-secs", "1"])
        .args(["--output-dir", "out", "--model-command", "sh", "--model-arg"])
        .arg(model_dir.join("slow.sh"))
        .output()
        .expect("repair run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sandbox has been stopped"), "stderr: {stderr}");
    assert!(!stderr.contains("[implementer] started"));
}

#[test]
fn missing_repository_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = repair_cmd(temp.path())
        .args([
            "run",
            "--repo",
            "does-not-exist",
            "--issue-text",
            "bug",
            "--model-command",
            "true",
        ])
        .status()
        .expect("repair run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn request_id_outside_output_dir_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = repair_cmd(temp.path())
        .args([
            "run",
            "--repo",
            ".",
            "--issue-text",
            "bug",
            "--request-id",
            "../escape",
            "--output-dir",
            "out",
            "--model-command",
            "true",
        ])
        .output()
        .expect("repair run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--request-id"));
    assert!(!temp.path().join("escape").exists());
}

#[test]
fn check_config_rejects_bad_limits() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("bad.toml"),
        "role = \"investigator\"\n[limits]\nstep_ceiling = 0\n",
    )
    .expect("write");

    let output = repair_cmd(temp.path())
        .args(["check-config", "bad.toml"])
        .output()
        .expect("check-config");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("step_ceiling"));
}
