//! Persistence of run artifacts under `<output_dir>/<request_id>/`.
//!
//! Layout:
//! - `<spoke>.traj.json`: one agent's full trajectory and result
//! - `handoff_<spoke>.md`: rendered handoff documents
//! - `run_result.json`: the aggregate result
//! - `summary.txt`: human-readable overview

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::handoff::HandoffDocument;
use crate::core::result::{AgentResult, RunResult, artifact};
use crate::core::types::is_safe_name;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub run_result_path: PathBuf,
    pub summary_path: PathBuf,
}

impl RunPaths {
    /// Paths for one run; `request_id` must be a single safe path component.
    pub fn new(output_dir: &Path, request_id: &str) -> Result<Self> {
        if !is_safe_name(request_id) {
            bail!("request id '{request_id}' must be non-empty and use only [A-Za-z0-9_-]");
        }
        let dir = output_dir.join(request_id);
        Ok(Self {
            run_result_path: dir.join("run_result.json"),
            summary_path: dir.join("summary.txt"),
            dir,
        })
    }

    pub fn trajectory_path(&self, spoke: &str) -> PathBuf {
        self.dir.join(format!("{spoke}.traj.json"))
    }

    pub fn handoff_path(&self, spoke: &str) -> PathBuf {
        self.dir.join(format!("handoff_{spoke}.md"))
    }
}

/// Everything a finished run hands to persistence.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    pub result: &'a RunResult,
    /// Spoke names in dispatch order, paired with their results.
    pub spokes: Vec<(&'a str, &'a AgentResult)>,
    pub handoffs: &'a [HandoffDocument],
}

#[derive(Debug, Serialize)]
struct TrajectoryFile<'a> {
    spoke: &'a str,
    #[serde(flatten)]
    result: &'a AgentResult,
}

#[instrument(skip_all, fields(request_id = %record.result.request_id))]
pub fn write_run(output_dir: &Path, record: &RunRecord<'_>) -> Result<RunPaths> {
    let paths = RunPaths::new(output_dir, &record.result.request_id)?;
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    // Write in dispatch order to keep outputs stable.
    for &(spoke, result) in &record.spokes {
        write_json(
            &paths.trajectory_path(spoke),
            &TrajectoryFile { spoke, result },
        )?;
    }
    for handoff in record.handoffs {
        let mut body = handoff.render();
        body.push('\n');
        write_atomic(&paths.handoff_path(&handoff.spoke), &body)?;
    }
    write_json(&paths.run_result_path, record.result)?;
    write_atomic(&paths.summary_path, &render_summary(record))?;

    info!(dir = %paths.dir.display(), "run artifacts written");
    Ok(paths)
}

pub fn render_summary(record: &RunRecord<'_>) -> String {
    let result = record.result;
    let mut out = String::new();
    let _ = writeln!(out, "request: {}", result.request_id);
    let _ = writeln!(out, "outcome: {}", result.outcome().describe());
    let _ = writeln!(out, "validated: {}", result.validated);
    let _ = writeln!(
        out,
        "patch: {}",
        match &result.final_patch {
            Some(patch) => format!("{} bytes", patch.len()),
            None => "none".to_string(),
        }
    );
    out.push('\n');
    for (spoke, agent) in &record.spokes {
        let stat = |key: &str| {
            agent
                .artifacts
                .get(key)
                .map(String::as_str)
                .unwrap_or("-")
                .to_string()
        };
        let _ = writeln!(out, "[{spoke}] {}", agent.agent_id);
        let _ = writeln!(out, "  status: {} ({})", agent.status, agent.status.describe());
        let _ = writeln!(out, "  steps: {}", stat(artifact::STEPS));
        let _ = writeln!(out, "  model calls: {}", stat(artifact::MODEL_CALLS));
        let _ = writeln!(out, "  cost: {}", stat(artifact::TOTAL_COST));
        let _ = writeln!(out, "  score: {:.2}", agent.score);
        if let Some(error) = agent.artifacts.get(artifact::ERROR) {
            let _ = writeln!(out, "  error: {error}");
        }
    }
    out
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Atomically write a file (temp file + rename).
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote artifact");
    Ok(())
}
