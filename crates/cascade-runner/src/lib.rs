//! Drives the terminal through a manifest's job tree and persists the run:
//! `<output_root>/runs/<run_id>/` receives the run report, the combined pass
//! export and a run-control file.

pub mod orchestrator;
pub mod report;
pub mod terminal;
pub mod tester_config;

pub use orchestrator::{
    orchestrate, report_target, JobFilter, Orchestration, RunContext, TESTER_CONFIG_FILE,
};
pub use report::{
    Failure, FailureStage, JobOutcome, NodeStatus, OutcomeError, RunReport, StatusCounts,
};
pub use terminal::{
    request_cancel, CancelToken, LaunchOutcome, ProcessError, SessionState, StopOutcome,
    TerminalController, TerminalSession, WaitOutcome,
};
pub use tester_config::{render_tester_config, write_tester_config, ConfigBuildError, ParameterSet};

use anyhow::{anyhow, Context, Result};
use cascade_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, ConfigModel};
use cascade_ingest::{write_passes_csv, write_passes_json};
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PASSES_JSON_FILE: &str = "passes.json";
pub const PASSES_CSV_FILE: &str = "passes.csv";

pub struct RunResult {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub report: RunReport,
    pub passes: usize,
}

#[derive(Default)]
pub struct RunOptions {
    pub filter: JobFilter,
    /// Run report of an earlier run to resume from.
    pub resume: Option<PathBuf>,
    /// Overrides the control-file token watched by `cascade cancel`.
    pub cancel: Option<CancelToken>,
}

pub fn runtime_dir(output_root: &Path) -> PathBuf {
    output_root.join("runtime")
}

/// Control file that cancels a running orchestration under `output_root`.
pub fn cancel_control_path(output_root: &Path) -> PathBuf {
    runtime_dir(output_root).join("cancel.json")
}

#[derive(Debug)]
struct TerminalLock {
    path: PathBuf,
}

impl Drop for TerminalLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_terminal_lock(output_root: &Path) -> Result<TerminalLock> {
    let lock_path = runtime_dir(output_root).join("terminal.lock");
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(TerminalLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "terminal_in_use: another orchestration holds {}",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

fn run_control_path(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("run_control.json")
}

fn write_run_control(run_dir: &Path, run_id: &str, status: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "run_id": run_id,
        "status": status,
        "pid": std::process::id(),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_control_path(run_dir), &payload)?;
    Ok(())
}

struct RunControlGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunControlGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_run_control(&self.run_dir, &self.run_id, status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_control(&self.run_dir, &self.run_id, "failed");
        }
    }
}

/// Claims `runs/run_<timestamp>`, suffixing a counter if it already exists.
fn allocate_run_dir(output_root: &Path) -> Result<(String, PathBuf)> {
    let runs = output_root.join("runs");
    ensure_dir(&runs)?;
    let stamp = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    for attempt in 1..1000 {
        let run_id = if attempt == 1 {
            stamp.clone()
        } else {
            format!("{}_{}", stamp, attempt)
        };
        let dir = runs.join(&run_id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((run_id, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("creating {}", dir.display())),
        }
    }
    Err(anyhow!("no free run directory under {}", runs.display()))
}

/// Loads the manifest and runs it against the real terminal.
pub fn run_manifest(manifest: &Path, options: RunOptions) -> Result<RunResult> {
    let model = ConfigModel::load(manifest)
        .with_context(|| format!("loading manifest {}", manifest.display()))?;
    let mut controller = TerminalController::new(model.settings().terminal.clone());
    run_with_session(&model, &mut controller, options)
}

pub fn run_with_session(
    model: &ConfigModel,
    session: &mut dyn TerminalSession,
    options: RunOptions,
) -> Result<RunResult> {
    let output_root = model.settings().output_root.clone();
    ensure_dir(&output_root)
        .with_context(|| format!("creating output root {}", output_root.display()))?;
    let _lock = acquire_terminal_lock(&output_root)?;

    let cancel_file = cancel_control_path(&output_root);
    if cancel_file.exists() {
        warn!(file = %cancel_file.display(), "removing stale cancel request");
        let _ = fs::remove_file(&cancel_file);
    }
    let cancel = options
        .cancel
        .unwrap_or_else(|| CancelToken::with_control_file(&cancel_file));

    let previous = match &options.resume {
        Some(path) => Some(RunReport::load(path)?),
        None => None,
    };

    let (run_id, run_dir) = allocate_run_dir(&output_root)?;
    write_run_control(&run_dir, &run_id, "running")?;
    let mut run_guard = RunControlGuard::new(&run_dir, &run_id);

    if let Some(source) = model.source() {
        let bytes = fs::read(source)
            .with_context(|| format!("reading manifest {}", source.display()))?;
        atomic_write_bytes(&run_dir.join("manifest.yaml"), &bytes)?;
        atomic_write_bytes(&run_dir.join("manifest.digest"), sha256_bytes(&bytes).as_bytes())?;
    }
    info!(run_id = %run_id, run_dir = %run_dir.display(), "run started");

    let ctx = RunContext {
        model,
        run_id: run_id.clone(),
        cancel,
        previous: previous.as_ref(),
    };
    let Orchestration { report, passes } = orchestrate(&ctx, session, &options.filter);

    report.write(&run_dir.join(report::RUN_REPORT_FILE))?;
    write_passes_json(&run_dir.join(PASSES_JSON_FILE), &passes)
        .context("writing passes.json")?;
    write_passes_csv(&run_dir.join(PASSES_CSV_FILE), &passes).context("writing passes.csv")?;

    run_guard.complete(if report.cancelled { "cancelled" } else { "completed" })?;
    if report.cancelled {
        let _ = fs::remove_file(&cancel_file);
    }
    info!(
        run_id = %run_id,
        status = report.status.as_str(),
        passes = passes.len(),
        "run finished"
    );
    Ok(RunResult {
        run_dir,
        run_id,
        passes: passes.len(),
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cascade_runner_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn terminal_lock_is_exclusive() {
        let root = temp_root("lock");
        let lock1 = acquire_terminal_lock(&root).expect("first lock must succeed");
        let err = acquire_terminal_lock(&root).expect_err("second lock must fail");
        assert!(
            err.to_string().contains("terminal_in_use"),
            "unexpected lock error: {}",
            err
        );
        drop(lock1);
        let lock2 = acquire_terminal_lock(&root).expect("lock should be re-acquirable");
        drop(lock2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_dirs_never_collide() {
        let root = temp_root("rundir");
        let (first, _) = allocate_run_dir(&root).expect("first");
        let (second, dir) = allocate_run_dir(&root).expect("second");
        assert_ne!(first, second);
        assert!(dir.is_dir());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_control_guard_marks_aborted_runs_failed() {
        let root = temp_root("guard");
        {
            let _guard = RunControlGuard::new(&root, "run_x");
        }
        let text = fs::read_to_string(run_control_path(&root)).expect("control file");
        assert!(text.contains("\"failed\""));

        let mut guard = RunControlGuard::new(&root, "run_y");
        guard.complete("completed").expect("complete");
        drop(guard);
        let text = fs::read_to_string(run_control_path(&root)).expect("control file");
        assert!(text.contains("\"completed\""));
        let _ = fs::remove_dir_all(root);
    }
}
