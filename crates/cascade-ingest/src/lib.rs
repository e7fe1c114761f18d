//! Turns whatever the terminal left in a job directory into canonical pass
//! records. Files are parsed independently; a broken file is reported and the
//! rest still contribute.

mod columns;
mod delimited;
pub mod export;
mod html;
mod xml;

pub use columns::{parse_count, parse_number};
pub use export::{
    read_passes_csv, read_passes_json, write_passes_csv, write_passes_json, ExportError,
};

use cascade_core::{decode_text, CanonicalPass, JobKey, Provenance, SourceFormat};
use columns::PassDraft;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const JOB_MARKER_FILE: &str = "job.json";

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("no result files in {}", dir.display())]
    NoResultFiles { dir: PathBuf },
    #[error("cannot list {}: {source}", dir.display())]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("job marker {}: {message}", path.display())]
    Marker { path: PathBuf, message: String },
}

/// Rows extracted from one file before provenance is attached.
#[derive(Debug, Default)]
pub(crate) struct ParsedTable {
    pub rows: Vec<PassDraft>,
    pub skipped_rows: usize,
    pub summary: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub format: SourceFormat,
    pub encoding: Option<String>,
    pub passes: usize,
    pub skipped_rows: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Plain-text output kept verbatim; nothing is extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlob {
    pub path: PathBuf,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub dir: PathBuf,
    pub key: JobKey,
    pub passes: Vec<CanonicalPass>,
    pub files: Vec<FileReport>,
    pub texts: Vec<TextBlob>,
}

impl IngestReport {
    pub fn ingested_files(&self) -> usize {
        self.files.iter().filter(|f| f.is_ok()).count()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| !f.is_ok())
    }
}

pub fn format_for_path(path: &Path) -> Option<SourceFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "xml" => Some(SourceFormat::Xml),
        "htm" | "html" => Some(SourceFormat::Html),
        "csv" | "tsv" => Some(SourceFormat::Delimited),
        "txt" | "log" => Some(SourceFormat::Text),
        _ => None,
    }
}

/// Candidate result files directly inside `dir`, sorted by path.
pub fn discover(dir: &Path) -> Result<Vec<(PathBuf, SourceFormat)>, IngestionError> {
    let entries = fs::read_dir(dir).map_err(|source| IngestionError::ReadDir {
        dir: dir.to_path_buf(),
        source,
    })?;
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if hidden {
            continue;
        }
        if let Some(format) = format_for_path(&path) {
            found.push((path, format));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

fn parse_file(format: SourceFormat, text: &str) -> Result<ParsedTable, String> {
    match format {
        SourceFormat::Xml => xml::parse_xml(text),
        SourceFormat::Html => html::parse_html(text),
        SourceFormat::Delimited => delimited::parse_delimited(text),
        SourceFormat::Text => Ok(ParsedTable::default()),
    }
}

pub fn ingest_dir(dir: &Path, key: &JobKey) -> Result<IngestReport, IngestionError> {
    let candidates = discover(dir)?;
    if candidates.is_empty() {
        return Err(IngestionError::NoResultFiles {
            dir: dir.to_path_buf(),
        });
    }

    let mut report = IngestReport {
        dir: dir.to_path_buf(),
        key: key.clone(),
        passes: Vec::new(),
        files: Vec::new(),
        texts: Vec::new(),
    };
    for (path, format) in candidates {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = FileReport {
            path: path.clone(),
            format,
            encoding: None,
            passes: 0,
            skipped_rows: 0,
            summary: BTreeMap::new(),
            error: None,
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "result file unreadable");
                file.error = Some(err.to_string());
                report.files.push(file);
                continue;
            }
        };
        let (text, encoding) = decode_text(&bytes);
        file.encoding = Some(encoding.to_string());

        match parse_file(format, &text) {
            Ok(table) => {
                file.passes = table.rows.len();
                file.skipped_rows = table.skipped_rows;
                file.summary = table.summary;
                for draft in table.rows {
                    report.passes.push(CanonicalPass {
                        pass: draft.pass,
                        metrics: draft.metrics,
                        parameters: draft.parameters,
                        provenance: Provenance::for_job(key, file_name.clone(), format),
                    });
                }
                if format == SourceFormat::Text {
                    report.texts.push(TextBlob {
                        path: path.clone(),
                        text,
                    });
                }
                debug!(
                    file = %path.display(),
                    format = %format,
                    passes = file.passes,
                    skipped = file.skipped_rows,
                    "parsed result file"
                );
            }
            Err(message) => {
                warn!(file = %path.display(), format = %format, error = %message, "result file rejected");
                file.error = Some(message);
            }
        }
        report.files.push(file);
    }
    Ok(report)
}

pub fn write_job_marker(dir: &Path, key: &JobKey) -> io::Result<()> {
    cascade_core::atomic_write_json_pretty(&dir.join(JOB_MARKER_FILE), key)
}

pub fn read_job_marker(dir: &Path) -> Result<JobKey, IngestionError> {
    let path = dir.join(JOB_MARKER_FILE);
    let bytes = fs::read(&path).map_err(|e| IngestionError::Marker {
        path: path.clone(),
        message: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| IngestionError::Marker {
        path,
        message: e.to_string(),
    })
}

/// Job directories under `root`, identified by their marker file.
pub fn scan_results_root(root: &Path) -> Vec<(PathBuf, JobKey)> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() != JOB_MARKER_FILE {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        match read_job_marker(dir) {
            Ok(key) => found.push((dir.to_path_buf(), key)),
            Err(err) => warn!(error = %err, "skipping job directory"),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

/// Ingests disjoint job directories in parallel; results keep input order.
pub fn ingest_all(jobs: &[(PathBuf, JobKey)]) -> Vec<Result<IngestReport, IngestionError>> {
    jobs.par_iter()
        .map(|(dir, key)| ingest_dir(dir, key))
        .collect()
}
