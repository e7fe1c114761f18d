//! Manifest load errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a manifest. Load is all-or-nothing: any of
/// these means no tree was produced.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Manifest file could not be read
    #[error("cannot read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest is not valid YAML/JSON or has the wrong shape
    #[error("manifest parse error: {0}")]
    Parse(String),

    /// One or more semantic problems, reported together
    #[error("manifest is invalid:\n{}", format_problems(.0))]
    Invalid(Vec<String>),
}

impl ConfigError {
    /// Problems listed by an `Invalid` error, empty for the other variants.
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid(problems) => problems,
            _ => &[],
        }
    }
}

fn format_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}
