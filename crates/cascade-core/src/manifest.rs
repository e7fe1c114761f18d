//! Manifest loading: robots → optimizations → periods plus global settings.
//!
//! The manifest is YAML (JSON is accepted as a subset). Field names of the
//! older JSON configuration (`mt5_path`, `type`, `from_date`, `to_date`,
//! `optimization_type`, ...) are accepted as aliases.

use crate::error::ConfigError;
use crate::job::{JobKey, PeriodKind};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const TIMEFRAMES: &[&str] = &[
    "M1", "M2", "M3", "M4", "M5", "M6", "M10", "M12", "M15", "M20", "M30", "H1", "H2", "H3", "H4",
    "H6", "H8", "H12", "D1", "W1", "MN1",
];

pub const CONFIG_PLACEHOLDER: &str = "{config}";

const DEFAULT_LEVERAGE: u32 = 500;
const DEFAULT_DEPOSIT: u64 = 10_000;
const DEFAULT_MODEL: u8 = 1;
const DEFAULT_CRITERION: u8 = 3;

/// Tester `Optimization` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationMode {
    Disabled,
    Complete,
    Genetic,
    AllSymbols,
}

impl OptimizationMode {
    pub fn code(&self) -> u8 {
        match self {
            OptimizationMode::Disabled => 0,
            OptimizationMode::Complete => 1,
            OptimizationMode::Genetic => 2,
            OptimizationMode::AllSymbols => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OptimizationMode::Disabled),
            1 => Some(OptimizationMode::Complete),
            2 => Some(OptimizationMode::Genetic),
            3 => Some(OptimizationMode::AllSymbols),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" => Some(OptimizationMode::Disabled),
            "complete" | "slow" | "slow_complete" => Some(OptimizationMode::Complete),
            "genetic" | "fast" | "fast_genetic" => Some(OptimizationMode::Genetic),
            "all_symbols" | "market_watch" => Some(OptimizationMode::AllSymbols),
            other => other.parse::<i64>().ok().and_then(Self::from_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodSpec {
    pub name: String,
    pub kind: PeriodKind,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationSpec {
    pub symbol: String,
    pub timeframe: String,
    pub mode: OptimizationMode,
    pub model: u8,
    pub leverage: u32,
    pub deposit: u64,
    pub criterion: u8,
    pub periods: Vec<PeriodSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RobotSpec {
    pub name: String,
    pub set_file: Option<PathBuf>,
    pub optimizations: Vec<OptimizationSpec>,
}

impl RobotSpec {
    pub fn stem(&self) -> String {
        crate::job::robot_stem(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSettings {
    pub path: PathBuf,
    /// Launch arguments; `{config}` is replaced by the generated config path.
    pub args: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub completion_timeout: Duration,
    pub stop_grace: Duration,
    pub kill_margin: Duration,
    /// Directory the terminal writes reports into, when it cannot write
    /// straight into the job directory.
    pub report_dir: Option<PathBuf>,
}

impl TerminalSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: default_args(),
            startup_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            completion_timeout: Duration::from_secs(4 * 60 * 60),
            stop_grace: Duration::from_secs(10),
            kill_margin: Duration::from_secs(5),
            report_dir: None,
        }
    }

    pub fn render_args(&self, config_path: &Path) -> Vec<String> {
        let config = config_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    }
}

fn default_args() -> Vec<String> {
    vec!["/portable".to_string(), format!("/config:{}", CONFIG_PLACEHOLDER)]
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSettings {
    pub terminal: TerminalSettings,
    pub output_root: PathBuf,
    /// Passed through untouched to the analysis layer.
    pub analysis_criteria: Option<Value>,
}

/// One leaf of the tree with its ancestors.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec<'a> {
    pub robot: &'a RobotSpec,
    pub optimization: &'a OptimizationSpec,
    pub period: &'a PeriodSpec,
}

impl JobSpec<'_> {
    pub fn key(&self) -> JobKey {
        JobKey {
            robot: self.robot.name.clone(),
            symbol: self.optimization.symbol.clone(),
            timeframe: self.optimization.timeframe.clone(),
            period: self.period.name.clone(),
            kind: self.period.kind,
        }
    }
}

/// Validated, immutable job tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigModel {
    source: Option<PathBuf>,
    settings: ManifestSettings,
    robots: Vec<RobotSpec>,
}

impl ConfigModel {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut model = Self::from_yaml_str(&text, base_dir)?;
        model.source = Some(path.to_path_buf());
        Ok(model)
    }

    /// Relative paths in the manifest are resolved against `base_dir`.
    pub fn from_yaml_str(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawManifest =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let model = validate(raw, base_dir)?;
        tracing::debug!(
            robots = model.robots.len(),
            jobs = model.job_count(),
            "manifest loaded"
        );
        Ok(model)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn settings(&self) -> &ManifestSettings {
        &self.settings
    }

    pub fn robots(&self) -> &[RobotSpec] {
        &self.robots
    }

    pub fn robot(&self, name: &str) -> Option<&RobotSpec> {
        self.robots.iter().find(|r| r.name == name)
    }

    pub fn optimization(
        &self,
        robot: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Option<&OptimizationSpec> {
        self.robot(robot)?
            .optimizations
            .iter()
            .find(|o| o.symbol == symbol && o.timeframe == timeframe)
    }

    /// Depth-first: robot → optimization → period, in manifest order.
    pub fn jobs(&self) -> impl Iterator<Item = JobSpec<'_>> + '_ {
        self.robots.iter().flat_map(|robot| {
            robot.optimizations.iter().flat_map(move |optimization| {
                optimization.periods.iter().map(move |period| JobSpec {
                    robot,
                    optimization,
                    period,
                })
            })
        })
    }

    pub fn job_count(&self) -> usize {
        self.jobs().count()
    }
}

/// Holder for the current tree. A reload builds the complete new tree before
/// swapping it in; readers keep whatever snapshot they already hold.
#[derive(Debug)]
pub struct SharedConfig {
    path: PathBuf,
    current: RwLock<Arc<ConfigModel>>,
}

impl SharedConfig {
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let model = ConfigModel::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(model)),
        })
    }

    pub fn snapshot(&self) -> Arc<ConfigModel> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// On failure the previous tree stays in place.
    pub fn reload(&self) -> Result<Arc<ConfigModel>, ConfigError> {
        let model = Arc::new(ConfigModel::load(&self.path)?);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&model);
        Ok(model)
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    terminal: Option<RawTerminal>,
    #[serde(default, alias = "mt5_path")]
    terminal_path: Option<String>,
    #[serde(default, alias = "output_dir")]
    output_directory: Option<String>,
    #[serde(default)]
    analysis_criteria: Option<Value>,
    #[serde(default)]
    robots: Vec<RawRobot>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTerminal {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    startup_timeout_secs: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    completion_timeout_secs: Option<u64>,
    #[serde(default)]
    stop_grace_secs: Option<u64>,
    #[serde(default)]
    kill_margin_secs: Option<u64>,
    #[serde(default)]
    report_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRobot {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    set_file: Option<String>,
    #[serde(default)]
    optimizations: Vec<RawOptimization>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMode {
    Code(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct RawOptimization {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    timeframe: Option<String>,
    #[serde(default, alias = "optimization_type")]
    optimization: Option<RawMode>,
    #[serde(default)]
    model: Option<i64>,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default, alias = "deposit")]
    initial_deposit: Option<u64>,
    #[serde(default, alias = "optimization_criterion")]
    criterion: Option<u8>,
    #[serde(default)]
    periods: Vec<RawPeriod>,
}

#[derive(Debug, Deserialize)]
struct RawPeriod {
    #[serde(default)]
    name: Option<serde_yaml::Value>,
    #[serde(default, alias = "type")]
    kind: Option<serde_yaml::Value>,
    #[serde(default, alias = "from_date")]
    from: Option<serde_yaml::Value>,
    #[serde(default, alias = "to_date")]
    to: Option<serde_yaml::Value>,
}

fn scalar_string(value: &Option<serde_yaml::Value>) -> Option<String> {
    let s = match value.as_ref()? {
        serde_yaml::Value::String(s) => s.trim().to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y.%m.%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

// Bare executable names are left for PATH lookup.
fn resolve_executable(base_dir: &Path, raw: &str) -> PathBuf {
    if raw.contains('/') || raw.contains('\\') {
        resolve_path(base_dir, raw)
    } else {
        PathBuf::from(raw)
    }
}

fn validate(raw: RawManifest, base_dir: &Path) -> Result<ConfigModel, ConfigError> {
    let mut problems = Vec::new();
    let raw_terminal = raw.terminal.unwrap_or_default();

    let terminal_path = raw_terminal
        .path
        .clone()
        .or(raw.terminal_path.clone())
        .filter(|p| !p.trim().is_empty());
    let mut terminal = TerminalSettings::new(match &terminal_path {
        Some(p) => resolve_executable(base_dir, p),
        None => {
            problems.push("terminal.path is missing".to_string());
            PathBuf::new()
        }
    });
    if let Some(args) = raw_terminal.args {
        terminal.args = args;
    }
    if let Some(secs) = raw_terminal.startup_timeout_secs {
        terminal.startup_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = raw_terminal.poll_interval_ms {
        if ms == 0 {
            problems.push("terminal.poll_interval_ms must be > 0".to_string());
        }
        terminal.poll_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = raw_terminal.completion_timeout_secs {
        terminal.completion_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = raw_terminal.stop_grace_secs {
        terminal.stop_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = raw_terminal.kill_margin_secs {
        terminal.kill_margin = Duration::from_secs(secs);
    }
    terminal.report_dir = raw_terminal
        .report_dir
        .as_deref()
        .map(|d| resolve_path(base_dir, d));

    let output_root = resolve_path(
        base_dir,
        raw.output_directory.as_deref().unwrap_or("results"),
    );

    if raw.robots.is_empty() {
        problems.push("manifest defines no robots".to_string());
    }

    let mut robots = Vec::new();
    let mut seen_keys = BTreeSet::new();
    for (r_idx, raw_robot) in raw.robots.into_iter().enumerate() {
        let robot_label = match &raw_robot.name {
            Some(name) => format!("robots[{}] ({})", r_idx, name),
            None => format!("robots[{}]", r_idx),
        };
        let name = raw_robot.name.clone().filter(|n| !n.trim().is_empty());
        if name.is_none() {
            problems.push(format!("{}: name is missing", robot_label));
        }
        if raw_robot.optimizations.is_empty() {
            problems.push(format!("{}: no optimizations", robot_label));
        }

        let mut optimizations = Vec::new();
        for (o_idx, raw_opt) in raw_robot.optimizations.into_iter().enumerate() {
            let opt_label = format!("{}.optimizations[{}]", robot_label, o_idx);
            if let Some(opt) = validate_optimization(raw_opt, &opt_label, &mut problems) {
                optimizations.push(opt);
            }
        }

        if let Some(name) = name {
            let robot = RobotSpec {
                name,
                set_file: raw_robot.set_file.as_deref().map(|p| resolve_path(base_dir, p)),
                optimizations,
            };
            let mut seen_pairs = BTreeSet::new();
            for opt in &robot.optimizations {
                // Reports group a robot's jobs by symbol and timeframe.
                if !seen_pairs.insert((opt.symbol.as_str(), opt.timeframe.as_str())) {
                    problems.push(format!(
                        "{}: duplicate optimization {} {}",
                        robot_label, opt.symbol, opt.timeframe
                    ));
                }
                for period in &opt.periods {
                    let key = (
                        robot.name.clone(),
                        opt.symbol.clone(),
                        opt.timeframe.clone(),
                        period.name.clone(),
                        period.kind,
                    );
                    if !seen_keys.insert(key) {
                        problems.push(format!(
                            "{}: duplicate job {} {} {} ({})",
                            robot_label, opt.symbol, opt.timeframe, period.name, period.kind
                        ));
                    }
                }
            }
            robots.push(robot);
        }
    }

    if !problems.is_empty() {
        return Err(ConfigError::Invalid(problems));
    }
    Ok(ConfigModel {
        source: None,
        settings: ManifestSettings {
            terminal,
            output_root,
            analysis_criteria: raw.analysis_criteria,
        },
        robots,
    })
}

fn validate_optimization(
    raw: RawOptimization,
    label: &str,
    problems: &mut Vec<String>,
) -> Option<OptimizationSpec> {
    let before = problems.len();
    let symbol = raw.symbol.filter(|s| !s.trim().is_empty());
    if symbol.is_none() {
        problems.push(format!("{}: symbol is missing", label));
    }
    let timeframe = raw.timeframe.map(|t| t.trim().to_ascii_uppercase());
    match &timeframe {
        None => problems.push(format!("{}: timeframe is missing", label)),
        Some(tf) if !TIMEFRAMES.contains(&tf.as_str()) => {
            problems.push(format!("{}: unknown timeframe {}", label, tf))
        }
        _ => {}
    }
    let mode = match raw.optimization {
        None => Some(OptimizationMode::Genetic),
        Some(RawMode::Code(code)) => OptimizationMode::from_code(code),
        Some(RawMode::Name(name)) => OptimizationMode::from_name(&name),
    };
    if mode.is_none() {
        problems.push(format!("{}: unknown optimization mode", label));
    }
    let model = raw.model.unwrap_or(DEFAULT_MODEL as i64);
    if !(0..=4).contains(&model) {
        problems.push(format!("{}: model must be within 0..=4 (got {})", label, model));
    }
    let leverage = raw.leverage.unwrap_or(DEFAULT_LEVERAGE);
    if leverage == 0 {
        problems.push(format!("{}: leverage must be > 0", label));
    }
    if raw.periods.is_empty() {
        problems.push(format!("{}: no periods", label));
    }

    let mut periods = Vec::new();
    for (p_idx, raw_period) in raw.periods.iter().enumerate() {
        let period_label = format!("{}.periods[{}]", label, p_idx);
        if let Some(period) = validate_period(raw_period, &period_label, problems) {
            periods.push(period);
        }
    }

    if problems.len() != before {
        return None;
    }
    Some(OptimizationSpec {
        symbol: symbol?,
        timeframe: timeframe?,
        mode: mode?,
        model: model as u8,
        leverage,
        deposit: raw.initial_deposit.unwrap_or(DEFAULT_DEPOSIT),
        criterion: raw.criterion.unwrap_or(DEFAULT_CRITERION),
        periods,
    })
}

fn validate_period(raw: &RawPeriod, label: &str, problems: &mut Vec<String>) -> Option<PeriodSpec> {
    let name = scalar_string(&raw.name);
    let kind_raw = scalar_string(&raw.kind);
    let from_raw = scalar_string(&raw.from);
    let to_raw = scalar_string(&raw.to);

    let mut missing = Vec::new();
    if name.is_none() {
        missing.push("name");
    }
    if kind_raw.is_none() {
        missing.push("kind");
    }
    if from_raw.is_none() {
        missing.push("from");
    }
    if to_raw.is_none() {
        missing.push("to");
    }
    if !missing.is_empty() {
        problems.push(format!("{}: missing {}", label, missing.join(", ")));
        return None;
    }
    let (name, kind_raw, from_raw, to_raw) = (name?, kind_raw?, from_raw?, to_raw?);

    let kind = PeriodKind::parse(&kind_raw);
    if kind.is_none() {
        problems.push(format!(
            "{}: kind must be backtest or forwardtest (got {})",
            label, kind_raw
        ));
    }
    let from = parse_date(&from_raw);
    if from.is_none() {
        problems.push(format!("{}: unparseable from date {}", label, from_raw));
    }
    let to = parse_date(&to_raw);
    if to.is_none() {
        problems.push(format!("{}: unparseable to date {}", label, to_raw));
    }
    let (kind, from, to) = (kind?, from?, to?);
    if from >= to {
        problems.push(format!(
            "{}: from ({}) must be before to ({})",
            label, from_raw, to_raw
        ));
        return None;
    }
    Some(PeriodSpec {
        name,
        kind,
        from,
        to,
    })
}
