use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Backtest,
    Forwardtest,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Backtest => "backtest",
            PeriodKind::Forwardtest => "forwardtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "backtest" => Some(PeriodKind::Backtest),
            "forwardtest" | "forward" => Some(PeriodKind::Forwardtest),
            _ => None,
        }
    }

    /// Value of the tester's `ForwardMode` key.
    pub fn forward_mode(&self) -> u8 {
        match self {
            PeriodKind::Backtest => 0,
            PeriodKind::Forwardtest => 2,
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schedulable unit: robot x symbol/timeframe x period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub robot: String,
    pub symbol: String,
    pub timeframe: String,
    pub period: String,
    pub kind: PeriodKind,
}

impl JobKey {
    /// Robot file name without directories or the `.ex5` suffix.
    pub fn robot_stem(&self) -> String {
        robot_stem(&self.robot)
    }

    pub fn dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            sanitize_component(&self.symbol),
            sanitize_component(&self.timeframe),
            sanitize_component(&self.period),
            self.kind.as_str()
        )
    }

    /// `<root>/<robot stem>/<symbol>_<timeframe>_<period>_<kind>`
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        root.join(sanitize_component(&self.robot_stem()))
            .join(self.dir_name())
    }

    pub fn report_base(&self) -> String {
        format!(
            "report_{}_{}",
            sanitize_component(&self.robot_stem()),
            self.dir_name()
        )
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}({})",
            self.robot, self.symbol, self.timeframe, self.period, self.kind
        )
    }
}

pub fn robot_stem(robot: &str) -> String {
    let base = robot
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(robot);
    let lower = base.to_ascii_lowercase();
    if lower.ends_with(".ex5") {
        base[..base.len() - 4].to_string()
    } else {
        base.to_string()
    }
}

pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Launching,
    Running,
    Collecting,
    Success,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Launching => 1,
            JobStatus::Running => 2,
            JobStatus::Collecting => 3,
            JobStatus::Success | JobStatus::Failed | JobStatus::TimedOut => 4,
        }
    }

    /// Lifecycle only moves forward; a terminal status accepts nothing.
    /// Any non-terminal status may jump straight to a terminal one.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Launching => "launching",
            JobStatus::Running => "running",
            JobStatus::Collecting => "collecting",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> JobKey {
        JobKey {
            robot: "Experts\\Grid Master.ex5".into(),
            symbol: "EURUSD".into(),
            timeframe: "H1".into(),
            period: "2023 H1".into(),
            kind: PeriodKind::Forwardtest,
        }
    }

    #[test]
    fn output_dir_is_deterministic_and_sanitized() {
        let root = PathBuf::from("/tmp/results");
        let dir = key().output_dir(&root);
        assert_eq!(
            dir,
            PathBuf::from("/tmp/results/Grid_Master/EURUSD_H1_2023_H1_forwardtest")
        );
        assert_eq!(dir, key().output_dir(&root));
    }

    #[test]
    fn robot_stem_strips_directories_and_extension() {
        assert_eq!(robot_stem("Experts/Advisors/Scalper.EX5"), "Scalper");
        assert_eq!(robot_stem("Plain"), "Plain");
    }

    #[test]
    fn sanitize_never_yields_traversal_components() {
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("a/b"), "a_b");
    }

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Launching));
        assert!(JobStatus::Launching.can_advance_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Collecting));
        assert!(!JobStatus::Collecting.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Success.can_advance_to(JobStatus::Failed));
        assert!(!JobStatus::TimedOut.can_advance_to(JobStatus::Success));
    }

    #[test]
    fn period_kind_parses_and_maps_forward_mode() {
        assert_eq!(PeriodKind::parse("Backtest"), Some(PeriodKind::Backtest));
        assert_eq!(
            PeriodKind::parse("forwardtest").map(|k| k.forward_mode()),
            Some(2)
        );
        assert_eq!(PeriodKind::parse("walkforward"), None);
    }
}
