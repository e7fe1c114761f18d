use anyhow::{anyhow, Context, Result};
use cascade_analysis::{criteria_from_settings, filter_passes, rank_passes, Criteria, MetricKey};
use cascade_core::{CanonicalPass, ConfigModel, JobStatus};
use cascade_ingest::{
    ingest_all, ingest_dir, read_job_marker, read_passes_csv, read_passes_json, scan_results_root,
    write_passes_csv, write_passes_json, IngestReport, JOB_MARKER_FILE,
};
use cascade_runner::{
    cancel_control_path, render_tester_config, report_target, request_cancel, run_manifest,
    write_tester_config, JobFilter, ParameterSet, RunOptions, RunReport, TerminalController,
    TerminalSession, TESTER_CONFIG_FILE,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cascade",
    version = "0.3.0",
    about = "Runs strategy-tester optimization cascades and collects their passes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    #[arg(long)]
    robot: Option<String>,
    #[arg(long)]
    symbol: Option<String>,
    #[arg(long)]
    timeframe: Option<String>,
    #[arg(long)]
    period: Option<String>,
}

impl From<FilterArgs> for JobFilter {
    fn from(value: FilterArgs) -> Self {
        JobFilter {
            robot: value.robot,
            symbol: value.symbol,
            timeframe: value.timeframe,
            period: value.period,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        manifest: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// run_report.json of an earlier run; its successful jobs are reused.
        #[arg(long)]
        resume: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    BuildConfig {
        manifest: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// Writes under this directory instead of the manifest's output root.
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Ingest {
        /// A job output directory or a results root containing several.
        path: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// Export file; `.csv` writes CSV, anything else JSON.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Filter {
        /// passes.json or passes.csv
        passes: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// Takes `analysis_criteria` from this manifest.
        #[arg(long, conflicts_with = "criteria")]
        manifest: Option<PathBuf>,
        /// JSON file holding the criteria object.
        #[arg(long)]
        criteria: Option<PathBuf>,
        #[arg(long)]
        rank: Option<String>,
        #[arg(long)]
        top: Option<usize>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Terminal {
        #[command(subcommand)]
        action: TerminalCommands,
    },
    Cancel {
        manifest: PathBuf,
    },
    Init {
        #[arg(long, default_value = "cascade.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TerminalCommands {
    Status {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Stop {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CASCADE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            manifest,
            filter,
            resume,
            json,
        } => {
            let options = RunOptions {
                filter: filter.into(),
                resume,
                cancel: None,
            };
            let result = run_manifest(&manifest, options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": {
                        "run_id": result.run_id,
                        "run_dir": result.run_dir.display().to_string(),
                        "passes": result.passes,
                    },
                    "report": serde_json::to_value(&result.report)?,
                    "failed_jobs": serde_json::to_value(result.report.failed_jobs())?,
                })));
            }
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            print_report(&result.report);
            println!("passes: {}", result.passes);
        }
        Commands::Describe { manifest, json } => {
            let model = load_model(&manifest)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": model_to_json(&model),
                })));
            }
            print_model(&model);
        }
        Commands::BuildConfig {
            manifest,
            filter,
            out_dir,
            json,
        } => {
            let model = load_model(&manifest)?;
            let filter: JobFilter = filter.into();
            let settings = model.settings();
            let mut written = Vec::new();
            for job in model.jobs().filter(|j| filter.matches(&j.key())) {
                let key = job.key();
                let output_dir = match &out_dir {
                    Some(dir) => dir.join(key.dir_name()),
                    None => key.output_dir(&settings.output_root),
                };
                let parameters = match job.robot.set_file.as_deref() {
                    Some(path) => ParameterSet::load(path)?,
                    None => None,
                };
                let contents = render_tester_config(
                    job,
                    parameters.as_ref(),
                    &report_target(settings, &key, &output_dir),
                );
                let path = output_dir.join(TESTER_CONFIG_FILE);
                let digest = write_tester_config(&path, &contents)?;
                written.push((key, path, digest));
            }
            if written.is_empty() {
                return Err(anyhow!("no job in {} matches the filter", manifest.display()));
            }
            if json {
                let configs: Vec<Value> = written
                    .iter()
                    .map(|(key, path, digest)| {
                        json!({
                            "job": key,
                            "path": path.display().to_string(),
                            "sha256": digest,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build-config",
                    "configs": configs,
                })));
            }
            for (key, path, digest) in &written {
                println!("{}: {} ({})", key, path.display(), digest);
            }
        }
        Commands::Ingest {
            path,
            filter,
            out,
            json,
        } => {
            let reports = ingest_path(&path, &filter.into())?;
            let passes: Vec<CanonicalPass> = reports
                .iter()
                .flat_map(|r| r.passes.iter().cloned())
                .collect();
            if let Some(out) = &out {
                write_passes(out, &passes)?;
            }
            if json {
                let dirs: Vec<Value> = reports.iter().map(ingest_report_to_json).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ingest",
                    "dirs": dirs,
                    "passes": passes.len(),
                    "out": out.as_ref().map(|p| p.display().to_string()),
                })));
            }
            for report in &reports {
                println!(
                    "{}: {} passes from {} of {} files",
                    report.dir.display(),
                    report.passes.len(),
                    report.ingested_files(),
                    report.files.len()
                );
                for failed in report.failed_files() {
                    println!(
                        "  failed: {} ({})",
                        failed.path.display(),
                        failed.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            println!("passes: {}", passes.len());
            if let Some(out) = &out {
                println!("written: {}", out.display());
            }
        }
        Commands::Filter {
            passes,
            filter,
            manifest,
            criteria,
            rank,
            top,
            out,
            json,
        } => {
            let job_filter: JobFilter = filter.into();
            let input: Vec<CanonicalPass> = read_passes(&passes)?
                .into_iter()
                .filter(|p| job_filter.matches_pass(p))
                .collect();
            let criteria = load_criteria(manifest.as_deref(), criteria.as_deref())?;
            let metric = match rank.as_deref() {
                Some(raw) => MetricKey::parse(raw).ok_or_else(|| {
                    let known: Vec<&str> = MetricKey::ALL.iter().map(|m| m.as_str()).collect();
                    anyhow!("unknown rank metric '{}' (expected one of {})", raw, known.join(", "))
                })?,
                None => cascade_analysis::DEFAULT_RANK_METRIC,
            };
            let filtered = filter_passes(&input, &criteria);
            let ranked = rank_passes(&filtered.passes, metric, top);
            if let Some(out) = &out {
                write_passes(out, &ranked)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "filter",
                    "criteria": serde_json::to_value(&criteria)?,
                    "total": filtered.total,
                    "kept": filtered.kept,
                    "rank": metric.as_str(),
                    "passes": serde_json::to_value(&ranked)?,
                })));
            }
            println!("total: {}", filtered.total);
            println!("kept: {}", filtered.kept);
            println!("rank: {}", metric);
            for pass in &ranked {
                println!(
                    "  {} pass={} {}={}",
                    pass.provenance.source_file,
                    pass.pass.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    metric,
                    metric
                        .value(&pass.metrics)
                        .map_or_else(|| "null".to_string(), |v| v.to_string())
                );
            }
        }
        Commands::Terminal { action } => match action {
            TerminalCommands::Status { manifest, json } => {
                let model = load_model(&manifest)?;
                let mut controller = TerminalController::new(model.settings().terminal.clone());
                let pids = controller.running_pids();
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "terminal-status",
                        "terminal": controller.settings().path.display().to_string(),
                        "running": !pids.is_empty(),
                        "pids": pids,
                    })));
                }
                println!("terminal: {}", controller.settings().path.display());
                println!("running: {}", !pids.is_empty());
                if !pids.is_empty() {
                    println!("pids: {:?}", pids);
                }
            }
            TerminalCommands::Stop { manifest, json } => {
                let model = load_model(&manifest)?;
                let mut controller = TerminalController::new(model.settings().terminal.clone());
                let outcome = controller.stop()?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "terminal-stop",
                        "outcome": format!("{:?}", outcome),
                        "running": controller.is_running(),
                    })));
                }
                println!("outcome: {:?}", outcome);
            }
        },
        Commands::Cancel { manifest } => {
            let model = load_model(&manifest)?;
            let path = cancel_control_path(&model.settings().output_root);
            request_cancel(&path)
                .with_context(|| format!("writing cancel request {}", path.display()))?;
            println!("cancel requested: {}", path.display());
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "manifest already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, MANIFEST_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: set terminal.path and the robots to optimize");
            println!("next: cascade describe {}", path.display());
        }
    }
    Ok(None)
}

const MANIFEST_TEMPLATE: &str = "\
terminal:
  path: ''                      # REQUIRED: terminal executable
  args: ['/config:{config}']
  startup_timeout_secs: 60
  completion_timeout_secs: 36000
  stop_grace_secs: 10
  kill_margin_secs: 5
  # report_dir: ''              # where the terminal drops its reports, if not the job directory
output_directory: results
analysis_criteria:
  max_drawdown_percent: 30
  min_profit_factor: 1.2
  min_trades: 30
robots:
  - name: ''                    # REQUIRED: expert name as the terminal knows it
    # set_file: robot.set       # optional input parameter set
    optimizations:
      - symbol: EURUSD
        timeframe: H1
        optimization: genetic   # disabled | complete | genetic | all_symbols
        model: 1
        leverage: 500
        initial_deposit: 10000
        criterion: 3
        periods:
          - name: '2023'
            type: backtest
            from: 2023.01.01
            to: 2023.12.31
          - name: '2024'
            type: forwardtest
            from: 2024.01.01
            to: 2024.06.30
";

fn load_model(manifest: &Path) -> Result<ConfigModel> {
    ConfigModel::load(manifest).with_context(|| format!("loading manifest {}", manifest.display()))
}

fn load_criteria(manifest: Option<&Path>, criteria: Option<&Path>) -> Result<Criteria> {
    if let Some(path) = criteria {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading criteria {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing criteria {}", path.display()))?;
        return Criteria::from_value(&value)
            .with_context(|| format!("invalid criteria in {}", path.display()));
    }
    if let Some(manifest) = manifest {
        let model = load_model(manifest)?;
        return Ok(criteria_from_settings(model.settings())
            .context("invalid analysis_criteria")?
            .unwrap_or_default());
    }
    Ok(Criteria::default())
}

fn ingest_path(path: &Path, filter: &JobFilter) -> Result<Vec<IngestReport>> {
    if path.join(JOB_MARKER_FILE).is_file() {
        let key = read_job_marker(path)?;
        if !filter.matches(&key) {
            return Ok(Vec::new());
        }
        return Ok(vec![ingest_dir(path, &key)?]);
    }
    let found = scan_results_root(path);
    if found.is_empty() {
        return Err(anyhow!(
            "no job directories ({}) under {}",
            JOB_MARKER_FILE,
            path.display()
        ));
    }
    let jobs: Vec<_> = found
        .into_iter()
        .filter(|(_, key)| filter.matches(key))
        .collect();
    let mut reports = Vec::new();
    for ((dir, _), result) in jobs.iter().zip(ingest_all(&jobs)) {
        match result {
            Ok(report) => reports.push(report),
            Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "skipping job directory"),
        }
    }
    Ok(reports)
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

fn write_passes(path: &Path, passes: &[CanonicalPass]) -> Result<()> {
    if is_csv(path) {
        write_passes_csv(path, passes)
    } else {
        write_passes_json(path, passes)
    }
    .with_context(|| format!("writing {}", path.display()))
}

fn read_passes(path: &Path) -> Result<Vec<CanonicalPass>> {
    if is_csv(path) {
        read_passes_csv(path)
    } else {
        read_passes_json(path)
    }
    .with_context(|| format!("reading {}", path.display()))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::BuildConfig { json, .. }
        | Commands::Ingest { json, .. }
        | Commands::Filter { json, .. } => *json,
        Commands::Terminal { action } => match action {
            TerminalCommands::Status { json, .. } | TerminalCommands::Stop { json, .. } => *json,
        },
        _ => false,
    }
}

fn ingest_report_to_json(report: &IngestReport) -> Value {
    json!({
        "dir": report.dir.display().to_string(),
        "job": report.key,
        "passes": report.passes.len(),
        "ingested_files": report.ingested_files(),
        "files": report.files,
        "texts": report.texts.iter().map(|t| t.path.display().to_string()).collect::<Vec<_>>(),
    })
}

fn model_to_json(model: &ConfigModel) -> Value {
    let settings = model.settings();
    let robots: Vec<Value> = model
        .robots()
        .iter()
        .map(|robot| {
            json!({
                "name": robot.name,
                "set_file": robot.set_file.as_ref().map(|p| p.display().to_string()),
                "optimizations": robot.optimizations.iter().map(|opt| json!({
                    "symbol": opt.symbol,
                    "timeframe": opt.timeframe,
                    "optimization": opt.mode.code(),
                    "model": opt.model,
                    "periods": opt.periods.iter().map(|p| json!({
                        "name": p.name,
                        "kind": p.kind,
                        "from": p.from.to_string(),
                        "to": p.to.to_string(),
                    })).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "terminal": settings.terminal.path.display().to_string(),
        "output_root": settings.output_root.display().to_string(),
        "report_dir": settings.terminal.report_dir.as_ref().map(|p| p.display().to_string()),
        "analysis_criteria": settings.analysis_criteria,
        "robots": robots,
        "total_jobs": model.job_count(),
    })
}

fn print_model(model: &ConfigModel) {
    let settings = model.settings();
    println!("terminal: {}", settings.terminal.path.display());
    println!("output_root: {}", settings.output_root.display());
    if let Some(dir) = &settings.terminal.report_dir {
        println!("report_dir: {}", dir.display());
    }
    for robot in model.robots() {
        println!("robot: {}", robot.name);
        for opt in &robot.optimizations {
            println!("  {} {} (optimization={})", opt.symbol, opt.timeframe, opt.mode.code());
            for period in &opt.periods {
                println!(
                    "    {} {} {}..{}",
                    period.name, period.kind, period.from, period.to
                );
            }
        }
    }
    println!("total_jobs: {}", model.job_count());
}

fn print_report(report: &RunReport) {
    println!("status: {}", report.status.as_str());
    if report.cancelled {
        println!("cancelled: true");
    }
    println!(
        "jobs: {} success, {} failed, {} timed out, {} pending",
        report.counts.success, report.counts.failed, report.counts.timed_out, report.counts.pending
    );
    for robot in &report.robots {
        println!("robot {}: {}", robot.robot, robot.status.as_str());
    }
    for failed in report.failed_jobs() {
        let stage = failed
            .stage
            .map_or_else(|| "-".to_string(), |s| format!("{:?}", s).to_lowercase());
        let status = if failed.status == JobStatus::TimedOut {
            "timed_out"
        } else {
            "failed"
        };
        println!("  {} {} [{}]: {}", status, failed.key, stage, failed.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{JobKey, PeriodKind};
    use cascade_ingest::write_job_marker;

    #[test]
    fn filled_in_template_is_a_valid_manifest() {
        let text = MANIFEST_TEMPLATE
            .replace("path: ''", "path: /opt/terminal/terminal64")
            .replace("name: ''", "name: Grid");
        let model = ConfigModel::from_yaml_str(&text, Path::new("/proj")).expect("template loads");
        assert_eq!(model.job_count(), 2);
        assert!(criteria_from_settings(model.settings())
            .expect("criteria parse")
            .is_some());
    }

    #[test]
    fn bare_template_is_rejected() {
        assert!(ConfigModel::from_yaml_str(MANIFEST_TEMPLATE, Path::new("/proj")).is_err());
    }

    #[test]
    fn json_mode_reaches_nested_terminal_commands() {
        let cli = Cli::try_parse_from(["cascade", "terminal", "status", "m.yaml", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["cascade", "cancel", "m.yaml"]).expect("parse");
        assert!(!command_json_mode(&cli.command));
    }

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cascade_cli_{}_{}_{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn job_dir(root: &Path, symbol: &str) -> JobKey {
        let key = JobKey {
            robot: "Experts\\Grid.ex5".to_string(),
            symbol: symbol.to_string(),
            timeframe: "H1".to_string(),
            period: "2024".to_string(),
            kind: PeriodKind::Backtest,
        };
        let dir = key.output_dir(root);
        std::fs::create_dir_all(&dir).expect("job dir");
        write_job_marker(&dir, &key).expect("marker");
        std::fs::write(dir.join("report.csv"), "Pass,Profit\n1,10\n2,20\n").expect("csv");
        key
    }

    #[test]
    fn filtered_ingest_keeps_only_matching_job_dirs() {
        let root = temp_root("ingest_filter");
        job_dir(&root, "EURUSD");
        let gbp = job_dir(&root, "GBPUSD");

        let all = ingest_path(&root, &JobFilter::default()).expect("ingest all");
        assert_eq!(all.len(), 2);

        let filter = JobFilter {
            symbol: Some("gbpusd".to_string()),
            ..JobFilter::default()
        };
        let reports = ingest_path(&root, &filter).expect("filtered ingest");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, gbp);
        assert_eq!(reports[0].passes.len(), 2);
        assert!(reports[0]
            .passes
            .iter()
            .all(|p| p.provenance.symbol == "GBPUSD"));

        let eur_only = JobFilter {
            symbol: Some("EURUSD".to_string()),
            ..JobFilter::default()
        };
        let single = ingest_path(&gbp.output_dir(&root), &eur_only).expect("single dir");
        assert!(single.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn filter_flags_become_a_job_filter() {
        let cli = Cli::try_parse_from([
            "cascade",
            "run",
            "m.yaml",
            "--symbol",
            "EURUSD",
            "--period",
            "2024",
        ])
        .expect("parse");
        let Commands::Run { filter, .. } = cli.command else {
            panic!("expected run");
        };
        let filter: JobFilter = filter.into();
        assert_eq!(filter.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(filter.period.as_deref(), Some("2024"));
        assert!(filter.robot.is_none());
    }
}
