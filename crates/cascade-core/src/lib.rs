//! Shared model for the tester cascade: the manifest tree, job keys,
//! canonical pass records and the small filesystem helpers every crate uses.

pub mod error;
pub mod job;
pub mod manifest;
pub mod pass;
pub mod text;

pub use error::ConfigError;
pub use job::{JobKey, JobStatus, PeriodKind};
pub use manifest::{
    ConfigModel, JobSpec, ManifestSettings, OptimizationMode, OptimizationSpec, PeriodSpec,
    RobotSpec, SharedConfig, TerminalSettings,
};
pub use pass::{CanonicalPass, PassMetrics, Provenance, SourceFormat};
pub use text::decode_text;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
