//! Generated tester configuration (`.ini`) for one job.

use cascade_core::{decode_text, ensure_dir, sha256_bytes, JobSpec};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DATE_FORMAT: &str = "%Y.%m.%d";

#[derive(Debug, thiserror::Error)]
pub enum ConfigBuildError {
    #[error("cannot create config directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read parameter set {}: {source}", path.display())]
    ReadParameters {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Usable lines of a robot parameter set (`.set`), in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    lines: Vec<String>,
    encoding: &'static str,
}

impl ParameterSet {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigBuildError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigBuildError::ReadParameters {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let (text, encoding) = decode_text(&bytes);
        Ok(Some(Self::parse(&text, encoding)))
    }

    pub fn parse(text: &str, encoding: &'static str) -> Self {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(';'))
            .map(str::to_string)
            .collect();
        Self { lines, encoding }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn encoding(&self) -> &'static str {
        self.encoding
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `name -> value` pairs; the value keeps optimization ranges
    /// (`50||10||5||100||Y`) untouched.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
        })
    }
}

pub fn render_tester_config(
    job: JobSpec<'_>,
    parameters: Option<&ParameterSet>,
    report: &str,
) -> String {
    let opt = job.optimization;
    let period = job.period;
    let mut out = String::new();
    let _ = writeln!(out, "[Tester]");
    let _ = writeln!(out, "Expert={}", job.robot.name);
    let _ = writeln!(out, "Symbol={}", opt.symbol);
    let _ = writeln!(out, "Period={}", opt.timeframe);
    let _ = writeln!(out, "Optimization={}", opt.mode.code());
    let _ = writeln!(out, "Model={}", opt.model);
    let _ = writeln!(out, "FromDate={}", period.from.format(DATE_FORMAT));
    let _ = writeln!(out, "ToDate={}", period.to.format(DATE_FORMAT));
    let _ = writeln!(out, "ForwardMode={}", period.kind.forward_mode());
    let _ = writeln!(out, "Deposit={}", opt.deposit);
    let _ = writeln!(out, "Leverage=1:{}", opt.leverage);
    let _ = writeln!(out, "OptimizationCriterion={}", opt.criterion);
    let _ = writeln!(out, "Report={}", report);
    let _ = writeln!(out, "ReplaceReport=1");
    let _ = writeln!(out, "ShutdownTerminal=1");
    if let Some(set) = parameters {
        let _ = writeln!(out);
        let _ = writeln!(out, "[TesterInputs]");
        for line in set.lines() {
            let _ = writeln!(out, "{}", line);
        }
    }
    out
}

/// Writes the config and returns the sha256 of its bytes.
pub fn write_tester_config(path: &Path, contents: &str) -> Result<String, ConfigBuildError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).map_err(|source| ConfigBuildError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    cascade_core::atomic_write_bytes(path, contents.as_bytes()).map_err(|source| {
        ConfigBuildError::Write {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(sha256_bytes(contents.as_bytes()))
}
