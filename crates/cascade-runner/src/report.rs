//! Per-job outcomes and the run report tree that mirrors the manifest.

use anyhow::{anyhow, Context, Result};
use cascade_core::{JobKey, JobSpec, JobStatus};
use cascade_ingest::FileReport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_REPORT_SCHEMA: &str = "run_report_v1";
pub const RUN_REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Build,
    Launch,
    Wait,
    Stop,
    Ingest,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: FailureStage,
    pub kind: String,
    pub message: String,
}

impl Failure {
    pub fn new(stage: FailureStage, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("job {key} is already final ({status})")]
    AlreadyFinal { key: JobKey, status: JobStatus },
    #[error("job {key} cannot move from {from} to {to}")]
    Backwards {
        key: JobKey,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Result of one job. Only moves forward; once final it is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub key: JobKey,
    status: JobStatus,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub config_digest: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub files: Vec<FileReport>,
    #[serde(default)]
    pub passes: usize,
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub reused: bool,
}

impl JobOutcome {
    pub fn pending(key: JobKey, output_dir: PathBuf) -> Self {
        Self {
            key,
            status: JobStatus::Pending,
            output_dir,
            config_path: None,
            config_digest: None,
            exit_code: None,
            files: Vec::new(),
            passes: 0,
            failure: None,
            started_at: None,
            finished_at: None,
            reused: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), OutcomeError> {
        if self.status.is_terminal() {
            return Err(OutcomeError::AlreadyFinal {
                key: self.key.clone(),
                status: self.status,
            });
        }
        if !self.status.can_advance_to(next) {
            return Err(OutcomeError::Backwards {
                key: self.key.clone(),
                from: self.status,
                to: next,
            });
        }
        if self.status == JobStatus::Pending {
            self.started_at = Some(Utc::now().to_rfc3339());
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now().to_rfc3339());
        }
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<(), OutcomeError> {
        self.advance(JobStatus::Success)
    }

    pub fn fail(&mut self, status: JobStatus, failure: Failure) -> Result<(), OutcomeError> {
        self.advance(status)?;
        self.failure = Some(failure);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Success => self.success += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::TimedOut => self.timed_out += 1,
            _ => self.pending += 1,
        }
    }

    fn merge(&mut self, other: &StatusCounts) {
        self.total += other.total;
        self.pending += other.pending;
        self.success += other.success;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
    }

    pub fn status(&self) -> NodeStatus {
        if self.total == 0 || self.pending == self.total {
            NodeStatus::Pending
        } else if self.success == self.total {
            NodeStatus::Success
        } else if self.success == 0 && self.pending == 0 {
            NodeStatus::Failed
        } else {
            NodeStatus::Partial
        }
    }
}

/// Aggregate status of a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Success,
    Partial,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Success => "success",
            NodeStatus::Partial => "partial",
            NodeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub symbol: String,
    pub timeframe: String,
    pub status: NodeStatus,
    pub counts: StatusCounts,
    pub jobs: Vec<JobOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotReport {
    pub robot: String,
    pub status: NodeStatus,
    pub counts: StatusCounts,
    pub optimizations: Vec<OptimizationReport>,
}

/// Enough to rerun one failed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJob {
    pub key: JobKey,
    pub status: JobStatus,
    pub stage: Option<FailureStage>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub manifest: Option<PathBuf>,
    pub output_root: PathBuf,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: NodeStatus,
    #[serde(default)]
    pub cancelled: bool,
    pub counts: StatusCounts,
    pub robots: Vec<RobotReport>,
}

impl RunReport {
    /// Every job starts pending. Jobs are grouped in walk order.
    pub fn for_jobs<'a>(
        run_id: &str,
        manifest: Option<&Path>,
        output_root: &Path,
        jobs: impl IntoIterator<Item = JobSpec<'a>>,
    ) -> Self {
        let mut robots: Vec<RobotReport> = Vec::new();
        for job in jobs {
            let key = job.key();
            let outcome = JobOutcome::pending(key.clone(), key.output_dir(output_root));
            if robots.last().map_or(true, |r| r.robot != key.robot) {
                robots.push(RobotReport {
                    robot: key.robot.clone(),
                    status: NodeStatus::Pending,
                    counts: StatusCounts::default(),
                    optimizations: Vec::new(),
                });
            }
            let Some(robot) = robots.last_mut() else {
                continue;
            };
            let same_optimization = robot
                .optimizations
                .last()
                .map_or(false, |o| o.symbol == key.symbol && o.timeframe == key.timeframe);
            if !same_optimization {
                robot.optimizations.push(OptimizationReport {
                    symbol: key.symbol.clone(),
                    timeframe: key.timeframe.clone(),
                    status: NodeStatus::Pending,
                    counts: StatusCounts::default(),
                    jobs: Vec::new(),
                });
            }
            let Some(optimization) = robot.optimizations.last_mut() else {
                continue;
            };
            optimization.jobs.push(outcome);
        }
        let mut report = Self {
            schema_version: RUN_REPORT_SCHEMA.to_string(),
            run_id: run_id.to_string(),
            manifest: manifest.map(Path::to_path_buf),
            output_root: output_root.to_path_buf(),
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            status: NodeStatus::Pending,
            cancelled: false,
            counts: StatusCounts::default(),
            robots,
        };
        report.refresh();
        report
    }

    /// Recomputes every count and status from the job outcomes.
    pub fn refresh(&mut self) {
        let mut run_counts = StatusCounts::default();
        for robot in &mut self.robots {
            let mut robot_counts = StatusCounts::default();
            for optimization in &mut robot.optimizations {
                let mut counts = StatusCounts::default();
                for job in &optimization.jobs {
                    counts.add(job.status());
                }
                optimization.counts = counts;
                optimization.status = counts.status();
                robot_counts.merge(&counts);
            }
            robot.counts = robot_counts;
            robot.status = robot_counts.status();
            run_counts.merge(&robot_counts);
        }
        self.counts = run_counts;
        self.status = run_counts.status();
    }

    pub fn finish(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
        self.finished_at = Some(Utc::now().to_rfc3339());
        self.refresh();
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.robots
            .iter()
            .flat_map(|r| r.optimizations.iter())
            .flat_map(|o| o.jobs.iter())
    }

    pub fn job(&self, key: &JobKey) -> Option<&JobOutcome> {
        self.jobs().find(|j| &j.key == key)
    }

    pub fn job_mut(&mut self, key: &JobKey) -> Option<&mut JobOutcome> {
        self.robots
            .iter_mut()
            .flat_map(|r| r.optimizations.iter_mut())
            .flat_map(|o| o.jobs.iter_mut())
            .find(|j| &j.key == key)
    }

    pub fn robot(&self, name: &str) -> Option<&RobotReport> {
        self.robots.iter().find(|r| r.robot == name)
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.jobs()
            .filter(|j| matches!(j.status(), JobStatus::Failed | JobStatus::TimedOut))
            .map(|j| FailedJob {
                key: j.key.clone(),
                status: j.status(),
                stage: j.failure.as_ref().map(|f| f.stage),
                message: j
                    .failure
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        cascade_core::atomic_write_json_pretty(path, self)
            .with_context(|| format!("writing run report {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("reading run report {}", path.display()))?;
        let report: RunReport = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run report {}", path.display()))?;
        if report.schema_version != RUN_REPORT_SCHEMA {
            return Err(anyhow!(
                "unsupported run report schema '{}' in {}",
                report.schema_version,
                path.display()
            ));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{ConfigModel, PeriodKind};

    const MANIFEST: &str = r#"
terminal: { path: /opt/mt5/terminal64 }
robots:
  - name: Grid
    optimizations:
      - symbol: EURUSD
        timeframe: H1
        periods:
          - { name: a, kind: backtest, from: 2022.01.01, to: 2022.06.30 }
          - { name: b, kind: forwardtest, from: 2022.07.01, to: 2022.12.31 }
      - symbol: GBPUSD
        timeframe: H1
        periods:
          - { name: a, kind: backtest, from: 2022.01.01, to: 2022.06.30 }
  - name: Trend
    optimizations:
      - symbol: EURUSD
        timeframe: D1
        periods:
          - { name: a, kind: backtest, from: 2022.01.01, to: 2022.06.30 }
"#;

    fn report() -> RunReport {
        let model = ConfigModel::from_yaml_str(MANIFEST, Path::new("/srv")).expect("manifest");
        RunReport::for_jobs("run_test", None, Path::new("/srv/results"), model.jobs())
    }

    fn key(robot: &str, symbol: &str, period: &str, kind: PeriodKind) -> JobKey {
        JobKey {
            robot: robot.to_string(),
            symbol: symbol.to_string(),
            timeframe: if robot == "Trend" { "D1" } else { "H1" }.to_string(),
            period: period.to_string(),
            kind,
        }
    }

    #[test]
    fn tree_mirrors_the_manifest_and_starts_pending() {
        let report = report();
        assert_eq!(report.robots.len(), 2);
        assert_eq!(report.robots[0].optimizations.len(), 2);
        assert_eq!(report.robots[0].optimizations[0].jobs.len(), 2);
        assert_eq!(report.counts.total, 4);
        assert_eq!(report.counts.pending, 4);
        assert_eq!(report.status, NodeStatus::Pending);
    }

    #[test]
    fn final_outcomes_are_frozen() {
        let mut outcome = JobOutcome::pending(
            key("Grid", "EURUSD", "a", PeriodKind::Backtest),
            PathBuf::from("/x"),
        );
        outcome.advance(JobStatus::Launching).expect("launching");
        outcome.advance(JobStatus::Running).expect("running");
        assert!(matches!(
            outcome.advance(JobStatus::Launching),
            Err(OutcomeError::Backwards { .. })
        ));
        outcome
            .fail(
                JobStatus::TimedOut,
                Failure::new(FailureStage::Wait, "timed_out", "no finish"),
            )
            .expect("timed out");
        assert!(outcome.started_at.is_some());
        assert!(outcome.finished_at.is_some());
        assert!(matches!(
            outcome.succeed(),
            Err(OutcomeError::AlreadyFinal {
                status: JobStatus::TimedOut,
                ..
            })
        ));
        assert_eq!(outcome.failure.as_ref().map(|f| f.stage), Some(FailureStage::Wait));
    }

    #[test]
    fn aggregation_counts_each_level() {
        let mut report = report();
        let ok = key("Grid", "EURUSD", "a", PeriodKind::Backtest);
        let bad = key("Grid", "EURUSD", "b", PeriodKind::Forwardtest);
        let gbp = key("Grid", "GBPUSD", "a", PeriodKind::Backtest);
        report.job_mut(&ok).expect("job").succeed().expect("success");
        report
            .job_mut(&bad)
            .expect("job")
            .fail(
                JobStatus::Failed,
                Failure::new(FailureStage::Launch, "launch_failed", "exit 3"),
            )
            .expect("failed");
        report.job_mut(&gbp).expect("job").succeed().expect("success");
        report.finish(false);

        let grid = report.robot("Grid").expect("grid");
        assert_eq!(grid.status, NodeStatus::Partial);
        assert_eq!(grid.optimizations[0].status, NodeStatus::Partial);
        assert_eq!(grid.optimizations[1].status, NodeStatus::Success);
        assert_eq!(report.robot("Trend").map(|r| r.status), Some(NodeStatus::Pending));
        assert_eq!(report.counts.success, 2);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.pending, 1);
        assert_eq!(report.status, NodeStatus::Partial);

        let failed = report.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, bad);
        assert_eq!(failed[0].stage, Some(FailureStage::Launch));
    }

    #[test]
    fn report_survives_a_disk_round_trip() {
        let mut report = report();
        report.finish(true);
        let path = std::env::temp_dir().join(format!(
            "cascade_report_{}_{}.json",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        report.write(&path).expect("write");
        let back = RunReport::load(&path).expect("load");
        assert_eq!(back, report);
        assert!(back.cancelled);
        let _ = fs::remove_file(path);
    }
}
