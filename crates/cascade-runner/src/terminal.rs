//! Lifecycle control of the external terminal. The process table is the only
//! source of truth: the terminal has no completion callback, so "running" is
//! re-read from the host on every call.

use cascade_core::TerminalSettings;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, Signal, System, UpdateKind};
use tracing::{debug, info, warn};

const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("terminal exited during startup (exit code {code:?}): {stderr}")]
    LaunchFailed { code: Option<i32>, stderr: String },
    #[error("terminal did not appear within {waited:?}")]
    LaunchTimeout { waited: Duration },
    #[error("terminal still running after stop (pids {pids:?})")]
    StopFailed { pids: Vec<u32> },
    #[error("cannot open stderr capture {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::LaunchFailed { .. } => "launch_failed",
            ProcessError::LaunchTimeout { .. } => "launch_timeout",
            ProcessError::StopFailed { .. } => "stop_failed",
            ProcessError::Capture { .. } => "stderr_capture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotRunning,
    Launching,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { pid: u32 },
    /// A matching process was already present; nothing was spawned.
    AlreadyRunning,
    /// The spawned process exited cleanly before it was ever observed.
    FinishedDuringStartup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed { exit_code: Option<i32> },
    TimedOut { waited: Duration },
    Cancelled { waited: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Graceful,
    Forced,
}

/// Cooperative cancellation shared between the orchestrator and whoever
/// requests the stop. Optionally backed by a control file so another
/// process can cancel a running orchestration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    control_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            control_file: Some(path.into()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.control_file {
            Some(path) if path.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn control_file(&self) -> Option<&Path> {
        self.control_file.as_deref()
    }
}

/// Writes the control file a [`CancelToken`] watches.
pub fn request_cancel(control_file: &Path) -> io::Result<()> {
    let payload = serde_json::json!({
        "schema_version": "cancel_request_v1",
        "pid": std::process::id(),
        "requested_at": Utc::now().to_rfc3339(),
    });
    cascade_core::atomic_write_json_pretty(control_file, &payload)
}

/// What the orchestrator needs from a terminal session.
pub trait TerminalSession {
    fn is_running(&mut self) -> bool;
    fn launch(&mut self, config: &Path) -> Result<LaunchOutcome, ProcessError>;
    fn wait_for_completion(&mut self, max: Duration, cancel: &CancelToken) -> WaitOutcome;
    fn stop(&mut self) -> Result<StopOutcome, ProcessError>;
}

#[derive(Debug, Clone)]
struct ExecutableIdentity {
    canonical: Option<PathBuf>,
    name: String,
}

impl ExecutableIdentity {
    fn for_path(path: &Path) -> Self {
        let canonical = fs::canonicalize(path).ok();
        let name = canonical
            .as_deref()
            .unwrap_or(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { canonical, name }
    }

    fn matches(&self, process: &Process) -> bool {
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }
        match (&self.canonical, process.exe()) {
            (Some(target), Some(exe)) => {
                exe == target.as_path()
                    || fs::canonicalize(exe)
                        .map(|c| &c == target)
                        .unwrap_or(false)
            }
            (Some(_), None) => false,
            (None, _) => self.name_matches(process.name()),
        }
    }

    // Linux reports at most 15 bytes of the command name.
    fn name_matches(&self, name: &str) -> bool {
        if self.name.is_empty() {
            return false;
        }
        name == self.name || (name.len() == 15 && self.name.starts_with(name))
    }
}

pub struct TerminalController {
    settings: TerminalSettings,
    identity: ExecutableIdentity,
    system: System,
    child: Option<Child>,
    last_exit: Option<i32>,
    state: SessionState,
}

impl TerminalController {
    pub fn new(settings: TerminalSettings) -> Self {
        let identity = ExecutableIdentity::for_path(&settings.path);
        debug!(
            path = %settings.path.display(),
            canonical = ?identity.canonical,
            name = %identity.name,
            "terminal identity"
        );
        Self {
            settings,
            identity,
            system: System::new(),
            child: None,
            last_exit: None,
            state: SessionState::NotRunning,
        }
    }

    pub fn settings(&self) -> &TerminalSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pids of every live process matching the terminal executable.
    pub fn running_pids(&mut self) -> Vec<u32> {
        self.reap_child();
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet));
        let mut pids: Vec<u32> = self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| self.identity.matches(process))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn reap_child(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                self.last_exit = status.code();
                debug!(code = ?status.code(), "terminal child exited");
                Some(status.code().unwrap_or(-1))
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "cannot poll terminal child");
                None
            }
        }
    }

    fn sleep_step(&self, remaining: Duration) {
        thread::sleep(self.settings.poll_interval.min(remaining));
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn signal_all(&mut self, pids: &[u32], graceful: bool) {
        for pid in pids {
            let Some(process) = self.system.process(Pid::from_u32(*pid)) else {
                continue;
            };
            let delivered = if graceful {
                // Platforms without SIGTERM fall back to a hard kill.
                process.kill_with(Signal::Term).unwrap_or_else(|| process.kill())
            } else {
                process.kill()
            };
            if !delivered {
                debug!(pid, graceful, "signal not delivered");
            }
        }
    }

    fn wait_until_gone(&mut self, limit: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.running_pids().is_empty() {
                return true;
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return false;
            }
            self.sleep_step(limit - elapsed);
        }
    }
}

impl TerminalSession for TerminalController {
    fn is_running(&mut self) -> bool {
        let running = !self.running_pids().is_empty();
        self.state = match (running, self.state) {
            (false, _) => SessionState::NotRunning,
            (true, SessionState::NotRunning) => SessionState::Running,
            (true, state) => state,
        };
        running
    }

    fn launch(&mut self, config: &Path) -> Result<LaunchOutcome, ProcessError> {
        if self.is_running() {
            info!(config = %config.display(), "terminal already running, reusing it");
            return Ok(LaunchOutcome::AlreadyRunning);
        }

        let stderr_path = config.with_extension("stderr");
        let stderr_file = fs::File::create(&stderr_path).map_err(|source| ProcessError::Capture {
            path: stderr_path.clone(),
            source,
        })?;
        let args = self.settings.render_args(config);
        self.state = SessionState::Launching;
        self.last_exit = None;
        info!(terminal = %self.settings.path.display(), ?args, "launching terminal");

        let spawned = Command::new(&self.settings.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                self.state = SessionState::NotRunning;
                return Err(ProcessError::LaunchFailed {
                    code: None,
                    stderr: err.to_string(),
                });
            }
        };
        let pid = child.id();
        self.child = Some(child);

        let timeout = self.settings.startup_timeout;
        let started = Instant::now();
        loop {
            if let Some(code) = self.reap_child() {
                self.state = SessionState::NotRunning;
                if code == 0 {
                    info!(pid, "terminal finished before it was observed");
                    return Ok(LaunchOutcome::FinishedDuringStartup);
                }
                return Err(ProcessError::LaunchFailed {
                    code: self.last_exit,
                    stderr: stderr_tail(&stderr_path),
                });
            }
            if !self.running_pids().is_empty() {
                self.state = SessionState::Running;
                debug!(pid, elapsed_ms = started.elapsed().as_millis() as u64, "terminal observable");
                return Ok(LaunchOutcome::Started { pid });
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(pid, ?elapsed, "terminal never became observable, killing it");
                self.kill_child();
                self.state = SessionState::NotRunning;
                return Err(ProcessError::LaunchTimeout { waited: elapsed });
            }
            self.sleep_step(timeout - elapsed);
        }
    }

    fn wait_for_completion(&mut self, max: Duration, cancel: &CancelToken) -> WaitOutcome {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if cancel.is_cancelled() {
                info!(?elapsed, "wait cancelled");
                return WaitOutcome::Cancelled { waited: elapsed };
            }
            if !self.is_running() {
                return WaitOutcome::Completed {
                    exit_code: self.last_exit.take(),
                };
            }
            if elapsed >= max {
                warn!(?elapsed, "terminal did not finish in time");
                return WaitOutcome::TimedOut { waited: elapsed };
            }
            self.sleep_step(max - elapsed);
        }
    }

    fn stop(&mut self) -> Result<StopOutcome, ProcessError> {
        let pids = self.running_pids();
        if pids.is_empty() {
            self.state = SessionState::NotRunning;
            return Ok(StopOutcome::NotRunning);
        }
        self.state = SessionState::Terminating;
        info!(?pids, "stopping terminal");
        self.signal_all(&pids, true);
        if self.wait_until_gone(self.settings.stop_grace) {
            self.state = SessionState::NotRunning;
            return Ok(StopOutcome::Graceful);
        }

        let survivors = self.running_pids();
        warn!(?survivors, "terminal ignored terminate, killing");
        self.signal_all(&survivors, false);
        if self.wait_until_gone(self.settings.kill_margin) {
            self.state = SessionState::NotRunning;
            return Ok(StopOutcome::Forced);
        }
        let pids = self.running_pids();
        self.state = SessionState::Running;
        Err(ProcessError::StopFailed { pids })
    }
}

fn stderr_tail(path: &Path) -> String {
    let bytes = fs::read(path).unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    text.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_sees_control_file() {
        let path = std::env::temp_dir().join(format!(
            "cascade_cancel_{}_{}.json",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let token = CancelToken::with_control_file(&path);
        let clone = token.clone();
        assert!(!token.is_cancelled());
        request_cancel(&path).expect("write control file");
        assert!(clone.is_cancelled());
        let _ = fs::remove_file(&path);
        assert!(token.is_cancelled(), "cancellation is sticky");
    }

    #[test]
    fn flag_cancellation_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn name_fallback_handles_truncated_names() {
        let identity = ExecutableIdentity {
            canonical: None,
            name: "terminal64_portable".to_string(),
        };
        assert!(identity.name_matches("terminal64_port"));
        assert!(identity.name_matches("terminal64_portable"));
        assert!(!identity.name_matches("terminal64"));
    }

    #[test]
    fn missing_executable_is_a_launch_failure() {
        let mut settings = TerminalSettings::new("/nonexistent/cascade/terminal64");
        settings.startup_timeout = Duration::from_millis(200);
        settings.poll_interval = Duration::from_millis(20);
        let mut controller = TerminalController::new(settings);
        let config = std::env::temp_dir().join(format!(
            "cascade_missing_exe_{}_{}.ini",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let err = controller.launch(&config).expect_err("cannot spawn");
        assert!(matches!(err, ProcessError::LaunchFailed { code: None, .. }));
        assert_eq!(controller.state(), SessionState::NotRunning);
        let _ = fs::remove_file(config.with_extension("stderr"));
    }
}
