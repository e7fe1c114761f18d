//! Depth-first walk over the job tree. Jobs run one at a time against a
//! single terminal session; every failure is recorded on its job and the walk
//! moves on to the next sibling.

use crate::report::{Failure, FailureStage, JobOutcome, RunReport};
use crate::terminal::{CancelToken, LaunchOutcome, StopOutcome, TerminalSession, WaitOutcome};
use crate::tester_config::{render_tester_config, write_tester_config, ParameterSet};
use cascade_core::{CanonicalPass, ConfigModel, JobKey, JobSpec, JobStatus, ManifestSettings};
use cascade_ingest::{discover, ingest_dir, write_job_marker, IngestionError};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, info_span, warn};

pub const TESTER_CONFIG_FILE: &str = "tester.ini";

/// Restricts the walk to matching jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub robot: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub period: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, key: &JobKey) -> bool {
        let robot_ok = self.robot.as_deref().map_or(true, |r| {
            r == key.robot || r.eq_ignore_ascii_case(&key.robot_stem())
        });
        let symbol_ok = self
            .symbol
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case(&key.symbol));
        let timeframe_ok = self
            .timeframe
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case(&key.timeframe));
        let period_ok = self.period.as_deref().map_or(true, |p| p == key.period);
        robot_ok && symbol_ok && timeframe_ok && period_ok
    }

    /// Same rule applied to a pass, through the job it came from.
    pub fn matches_pass(&self, pass: &CanonicalPass) -> bool {
        let p = &pass.provenance;
        self.matches(&JobKey {
            robot: p.robot.clone(),
            symbol: p.symbol.clone(),
            timeframe: p.timeframe.clone(),
            period: p.period.clone(),
            kind: p.period_kind,
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &JobFilter::default()
    }
}

/// Everything a run carries explicitly instead of through globals.
pub struct RunContext<'a> {
    pub model: &'a ConfigModel,
    pub run_id: String,
    pub cancel: CancelToken,
    /// Outcomes of an earlier run; successful jobs with an unchanged config
    /// are carried over instead of rerun.
    pub previous: Option<&'a RunReport>,
}

pub struct Orchestration {
    pub report: RunReport,
    pub passes: Vec<CanonicalPass>,
}

/// Stops the session when a robot's subtree ends, however it ends.
struct SessionGuard<'s> {
    session: &'s mut dyn TerminalSession,
    robot: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        match self.session.stop() {
            Ok(StopOutcome::NotRunning) => {}
            Ok(outcome) => info!(robot = %self.robot, ?outcome, "closed terminal session"),
            Err(err) => warn!(robot = %self.robot, error = %err, "terminal did not stop"),
        }
    }
}

pub fn orchestrate(
    ctx: &RunContext<'_>,
    session: &mut dyn TerminalSession,
    filter: &JobFilter,
) -> Orchestration {
    let model = ctx.model;
    let output_root = &model.settings().output_root;
    let jobs: Vec<JobSpec<'_>> = model.jobs().filter(|j| filter.matches(&j.key())).collect();
    let mut report = RunReport::for_jobs(&ctx.run_id, model.source(), output_root, jobs.iter().copied());
    let mut passes = Vec::new();
    let mut cancelled = false;
    info!(run_id = %ctx.run_id, jobs = jobs.len(), "starting orchestration");

    let mut index = 0;
    while index < jobs.len() && !cancelled {
        let robot_name = jobs[index].robot.name.clone();
        let robot_span = info_span!("robot", robot = %robot_name);
        let _robot_entered = robot_span.enter();
        let mut guard = SessionGuard {
            session: &mut *session,
            robot: robot_name.clone(),
        };
        while index < jobs.len() && jobs[index].robot.name == robot_name {
            if ctx.cancel.is_cancelled() {
                info!("cancellation requested, leaving remaining jobs pending");
                cancelled = true;
                break;
            }
            let job = jobs[index];
            index += 1;
            let key = job.key();
            let Some(outcome) = report.job_mut(&key) else {
                continue;
            };
            let span = info_span!(
                "job",
                symbol = %key.symbol,
                timeframe = %key.timeframe,
                period = %key.period,
                kind = %key.kind
            );
            let _entered = span.enter();
            let previous = ctx.previous.and_then(|r| r.job(&key));
            let job_passes = run_job(ctx, &mut *guard.session, job, outcome, previous);
            info!(
                status = %outcome.status(),
                passes = outcome.passes,
                reused = outcome.reused,
                "job finished"
            );
            if outcome.status() == JobStatus::Failed
                && outcome.failure.as_ref().map(|f| f.stage) == Some(FailureStage::Cancelled)
            {
                cancelled = true;
            }
            passes.extend(job_passes);
            if cancelled {
                break;
            }
        }
    }

    report.finish(cancelled);
    info!(
        status = report.status.as_str(),
        success = report.counts.success,
        failed = report.counts.failed,
        timed_out = report.counts.timed_out,
        pending = report.counts.pending,
        "orchestration finished"
    );
    Orchestration { report, passes }
}

fn record(outcome: &mut JobOutcome, status: JobStatus, failure: Failure) {
    warn!(
        stage = ?failure.stage,
        kind = %failure.kind,
        message = %failure.message,
        "job failed"
    );
    if let Err(err) = outcome.fail(status, failure) {
        warn!(error = %err, "outcome already final");
    }
}

fn advance(outcome: &mut JobOutcome, status: JobStatus) {
    if let Err(err) = outcome.advance(status) {
        debug!(error = %err, "status not advanced");
    }
}

/// `Report=` value for a job. With a report directory configured the terminal
/// gets a bare name and the files are harvested after the run.
pub fn report_target(settings: &ManifestSettings, key: &JobKey, output_dir: &Path) -> String {
    match &settings.terminal.report_dir {
        Some(_) => key.report_base(),
        None => output_dir.join(key.report_base()).to_string_lossy().into_owned(),
    }
}

/// Runs one leaf and returns the passes it produced.
fn run_job(
    ctx: &RunContext<'_>,
    session: &mut dyn TerminalSession,
    job: JobSpec<'_>,
    outcome: &mut JobOutcome,
    previous: Option<&JobOutcome>,
) -> Vec<CanonicalPass> {
    let settings = ctx.model.settings();
    let key = job.key();
    let output_dir = outcome.output_dir.clone();
    let config_path = output_dir.join(TESTER_CONFIG_FILE);
    outcome.config_path = Some(config_path.clone());

    let parameters = match job.robot.set_file.as_deref().map(ParameterSet::load) {
        None => None,
        Some(Ok(set)) => {
            if set.is_none() {
                debug!("parameter set file absent, no inputs block");
            }
            set
        }
        Some(Err(err)) => {
            record(
                outcome,
                JobStatus::Failed,
                Failure::new(FailureStage::Build, "parameter_set", err.to_string()),
            );
            return Vec::new();
        }
    };
    let report_target = report_target(settings, &key, &output_dir);
    let contents = render_tester_config(job, parameters.as_ref(), &report_target);
    let digest = cascade_core::sha256_bytes(contents.as_bytes());

    if let Some(prev) = previous {
        if let Some(passes) = try_reuse(outcome, prev, &digest) {
            return passes;
        }
    }

    if let Err(err) = prepare_output_dir(&output_dir, &key) {
        record(
            outcome,
            JobStatus::Failed,
            Failure::new(FailureStage::Build, "output_dir", err.to_string()),
        );
        return Vec::new();
    }
    match write_tester_config(&config_path, &contents) {
        Ok(written) => outcome.config_digest = Some(written),
        Err(err) => {
            record(
                outcome,
                JobStatus::Failed,
                Failure::new(FailureStage::Build, "config_build", err.to_string()),
            );
            return Vec::new();
        }
    }

    advance(outcome, JobStatus::Launching);
    let launched = match session.launch(&config_path) {
        Ok(launched) => launched,
        Err(err) => {
            let failure = Failure::new(FailureStage::Launch, err.kind(), err.to_string());
            if let Err(stop_err) = session.stop() {
                warn!(error = %stop_err, "cleanup stop after failed launch did not succeed");
            }
            record(outcome, JobStatus::Failed, failure);
            return Vec::new();
        }
    };
    advance(outcome, JobStatus::Running);

    if launched != LaunchOutcome::FinishedDuringStartup {
        let limit = settings.terminal.completion_timeout;
        match session.wait_for_completion(limit, &ctx.cancel) {
            WaitOutcome::Completed { exit_code } => {
                outcome.exit_code = exit_code;
                if matches!(exit_code, Some(code) if code != 0) {
                    warn!(exit_code = ?exit_code, "terminal exited with non-zero status");
                }
            }
            WaitOutcome::TimedOut { waited } => {
                let failure = match session.stop() {
                    Ok(stopped) => Failure::new(
                        FailureStage::Wait,
                        "timed_out",
                        format!("no completion after {:?}; terminal stopped ({:?})", waited, stopped),
                    ),
                    Err(err) => Failure::new(FailureStage::Stop, err.kind(), err.to_string()),
                };
                record(outcome, JobStatus::TimedOut, failure);
                return Vec::new();
            }
            WaitOutcome::Cancelled { waited } => {
                let mut message = format!("cancelled after {:?}", waited);
                if let Err(err) = session.stop() {
                    message.push_str(&format!("; {}", err));
                }
                record(
                    outcome,
                    JobStatus::Failed,
                    Failure::new(FailureStage::Cancelled, "cancelled", message),
                );
                return Vec::new();
            }
        }
    }

    advance(outcome, JobStatus::Collecting);
    if let Some(report_dir) = &settings.terminal.report_dir {
        harvest_reports(report_dir, &key.report_base(), &output_dir);
    }
    collect(outcome, &output_dir, &key)
}

fn collect(outcome: &mut JobOutcome, output_dir: &Path, key: &JobKey) -> Vec<CanonicalPass> {
    match ingest_dir(output_dir, key) {
        Ok(ingested) => {
            outcome.files = ingested.files.clone();
            outcome.passes = ingested.passes.len();
            if ingested.ingested_files() == 0 {
                let message = ingested
                    .failed_files()
                    .map(|f| {
                        format!(
                            "{}: {}",
                            f.path.display(),
                            f.error.as_deref().unwrap_or("unreadable")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                record(
                    outcome,
                    JobStatus::Failed,
                    Failure::new(FailureStage::Ingest, "unparseable_results", message),
                );
                return Vec::new();
            }
            for failed in ingested.failed_files() {
                warn!(file = %failed.path.display(), "result file skipped");
            }
            if let Err(err) = outcome.succeed() {
                warn!(error = %err, "outcome already final");
            }
            ingested.passes
        }
        Err(err) => {
            let kind = match err {
                IngestionError::NoResultFiles { .. } => "no_result_files",
                _ => "ingest_error",
            };
            record(
                outcome,
                JobStatus::Failed,
                Failure::new(FailureStage::Ingest, kind, err.to_string()),
            );
            Vec::new()
        }
    }
}

/// Carries over a previous success whose config is byte-identical. The
/// directory is re-read so the passes still reach the run's export.
fn try_reuse(
    outcome: &mut JobOutcome,
    previous: &JobOutcome,
    digest: &str,
) -> Option<Vec<CanonicalPass>> {
    if previous.status() != JobStatus::Success
        || previous.config_digest.as_deref() != Some(digest)
    {
        return None;
    }
    let ingested = match ingest_dir(&outcome.output_dir, &outcome.key) {
        Ok(ingested) if ingested.ingested_files() > 0 => ingested,
        _ => {
            debug!("previous results no longer readable, rerunning");
            return None;
        }
    };
    outcome.config_digest = Some(digest.to_string());
    outcome.exit_code = previous.exit_code;
    outcome.files = ingested.files;
    outcome.passes = ingested.passes.len();
    outcome.reused = true;
    if let Err(err) = outcome.succeed() {
        warn!(error = %err, "outcome already final");
    }
    info!("reusing previous result");
    Some(ingested.passes)
}

/// Marks the directory with its job key and removes result files left by an
/// earlier attempt so they cannot be mistaken for fresh output.
fn prepare_output_dir(dir: &Path, key: &JobKey) -> io::Result<()> {
    cascade_core::ensure_dir(dir)?;
    write_job_marker(dir, key)?;
    let stale = discover(dir).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    for (path, _) in stale {
        debug!(file = %path.display(), "removing stale result file");
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Moves reports named after `base` from the terminal's report directory
/// into the job directory.
fn harvest_reports(report_dir: &Path, base: &str, output_dir: &Path) -> usize {
    let entries = match fs::read_dir(report_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %report_dir.display(), error = %err, "cannot read report directory");
            return 0;
        }
    };
    let mut moved = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        if !name_str.starts_with(base) || !entry.path().is_file() {
            continue;
        }
        let target = output_dir.join(&name);
        let result = fs::rename(entry.path(), &target).or_else(|_| {
            fs::copy(entry.path(), &target)?;
            fs::remove_file(entry.path())
        });
        match result {
            Ok(()) => moved += 1,
            Err(err) => warn!(file = %entry.path().display(), error = %err, "cannot harvest report"),
        }
    }
    debug!(moved, base, "harvested reports");
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::PeriodKind;
    use chrono::Utc;

    fn key(robot: &str) -> JobKey {
        JobKey {
            robot: format!("Experts\\{}.ex5", robot),
            symbol: "EURUSD".to_string(),
            timeframe: "H1".to_string(),
            period: "q1".to_string(),
            kind: PeriodKind::Backtest,
        }
    }

    #[test]
    fn filter_matches_stems_and_ignores_case() {
        let filter = JobFilter {
            robot: Some("grid".to_string()),
            symbol: Some("eurusd".to_string()),
            ..JobFilter::default()
        };
        assert!(filter.matches(&key("Grid")));
        assert!(!filter.matches(&key("Trend")));
        assert!(JobFilter::default().matches(&key("Trend")));
        assert!(JobFilter::default().is_empty());
        let by_period = JobFilter {
            period: Some("q2".to_string()),
            ..JobFilter::default()
        };
        assert!(!by_period.matches(&key("Grid")));
    }

    #[test]
    fn filter_applies_to_pass_provenance() {
        let k = key("Grid");
        let pass = CanonicalPass {
            pass: Some(3),
            metrics: Default::default(),
            parameters: Default::default(),
            provenance: cascade_core::Provenance::for_job(
                &k,
                "report.xml",
                cascade_core::SourceFormat::Xml,
            ),
        };
        let filter = JobFilter {
            robot: Some("Grid".to_string()),
            timeframe: Some("h1".to_string()),
            ..JobFilter::default()
        };
        assert!(filter.matches_pass(&pass));
        let other_symbol = JobFilter {
            symbol: Some("GBPUSD".to_string()),
            ..JobFilter::default()
        };
        assert!(!other_symbol.matches_pass(&pass));
    }

    #[test]
    fn harvest_moves_only_matching_reports() {
        let base = std::env::temp_dir().join(format!(
            "cascade_harvest_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let reports = base.join("reports");
        let job = base.join("job");
        fs::create_dir_all(&reports).expect("reports dir");
        fs::create_dir_all(&job).expect("job dir");
        fs::write(reports.join("report_Grid_EURUSD.xml"), "<x/>").expect("xml");
        fs::write(reports.join("report_Grid_EURUSD.forward.xml"), "<x/>").expect("fwd");
        fs::write(reports.join("report_Other.xml"), "<x/>").expect("other");

        assert_eq!(harvest_reports(&reports, "report_Grid_EURUSD", &job), 2);
        assert!(job.join("report_Grid_EURUSD.forward.xml").exists());
        assert!(reports.join("report_Other.xml").exists());
        assert_eq!(harvest_reports(&base.join("missing"), "x", &job), 0);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn prepare_clears_stale_results_but_keeps_other_files() {
        let dir = std::env::temp_dir().join(format!(
            "cascade_prepare_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        fs::write(dir.join("old.csv"), "Pass\n1\n").expect("old csv");
        fs::write(dir.join(TESTER_CONFIG_FILE), "[Tester]\n").expect("ini");
        prepare_output_dir(&dir, &key("Grid")).expect("prepare");
        assert!(!dir.join("old.csv").exists());
        assert!(dir.join(TESTER_CONFIG_FILE).exists());
        assert_eq!(
            cascade_ingest::read_job_marker(&dir).expect("marker"),
            key("Grid")
        );
        let _ = fs::remove_dir_all(dir);
    }
}
