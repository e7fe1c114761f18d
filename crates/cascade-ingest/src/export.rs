//! Canonical pass export. JSON keeps the records as-is; CSV flattens them to
//! one row per pass with empty cells for missing metrics and the parameter
//! map JSON-encoded in a single column, so reading back yields equal records.

use cascade_core::{CanonicalPass, PassMetrics, PeriodKind, Provenance, SourceFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PASSES_SCHEMA_VERSION: &str = "canonical_passes_v1";

pub const CSV_HEADER: [&str; 19] = [
    "robot",
    "symbol",
    "timeframe",
    "period",
    "period_kind",
    "source_file",
    "source_format",
    "pass",
    "profit",
    "expected_payoff",
    "drawdown",
    "drawdown_pct",
    "profit_factor",
    "recovery_factor",
    "sharpe_ratio",
    "total_trades",
    "profit_trades",
    "max_consecutive_losses",
    "parameters",
];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("unexpected header: {0}")]
    Header(String),
    #[error("row {row}, column {column}: cannot read {value:?}")]
    Field {
        row: usize,
        column: &'static str,
        value: String,
    },
}

#[derive(Serialize)]
struct PassesDocRef<'a> {
    schema_version: &'a str,
    passes: &'a [CanonicalPass],
}

#[derive(Deserialize)]
struct PassesDoc {
    schema_version: String,
    passes: Vec<CanonicalPass>,
}

pub fn write_passes_json(path: &Path, passes: &[CanonicalPass]) -> Result<(), ExportError> {
    let doc = PassesDocRef {
        schema_version: PASSES_SCHEMA_VERSION,
        passes,
    };
    cascade_core::atomic_write_json_pretty(path, &doc)?;
    Ok(())
}

pub fn read_passes_json(path: &Path) -> Result<Vec<CanonicalPass>, ExportError> {
    let bytes = fs::read(path)?;
    let doc: PassesDoc = serde_json::from_slice(&bytes)?;
    if doc.schema_version != PASSES_SCHEMA_VERSION {
        return Err(ExportError::Header(format!(
            "schema_version {}",
            doc.schema_version
        )));
    }
    Ok(doc.passes)
}

fn opt_cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn passes_to_csv(passes: &[CanonicalPass]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for pass in passes {
        let p = &pass.provenance;
        let m = &pass.metrics;
        writer.write_record([
            p.robot.clone(),
            p.symbol.clone(),
            p.timeframe.clone(),
            p.period.clone(),
            p.period_kind.as_str().to_string(),
            p.source_file.clone(),
            p.source_format.as_str().to_string(),
            opt_cell(pass.pass),
            opt_cell(m.profit),
            opt_cell(m.expected_payoff),
            opt_cell(m.drawdown),
            opt_cell(m.drawdown_pct),
            opt_cell(m.profit_factor),
            opt_cell(m.recovery_factor),
            opt_cell(m.sharpe_ratio),
            opt_cell(m.total_trades),
            opt_cell(m.profit_trades),
            opt_cell(m.max_consecutive_losses),
            serde_json::to_string(&pass.parameters)?,
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))
}

pub fn write_passes_csv(path: &Path, passes: &[CanonicalPass]) -> Result<(), ExportError> {
    let bytes = passes_to_csv(passes)?;
    cascade_core::atomic_write_bytes(path, &bytes)?;
    Ok(())
}

struct RowReader<'a> {
    row: usize,
    record: &'a csv::StringRecord,
}

impl RowReader<'_> {
    fn text(&self, idx: usize) -> String {
        self.record.get(idx).unwrap_or("").to_string()
    }

    fn bad(&self, idx: usize) -> ExportError {
        ExportError::Field {
            row: self.row,
            column: CSV_HEADER[idx],
            value: self.text(idx),
        }
    }

    fn float(&self, idx: usize) -> Result<Option<f64>, ExportError> {
        let raw = self.record.get(idx).unwrap_or("");
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<f64>().map(Some).map_err(|_| self.bad(idx))
    }

    fn count(&self, idx: usize) -> Result<Option<u64>, ExportError> {
        let raw = self.record.get(idx).unwrap_or("");
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u64>().map(Some).map_err(|_| self.bad(idx))
    }
}

pub fn passes_from_csv(bytes: &[u8]) -> Result<Vec<CanonicalPass>, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.iter().ne(CSV_HEADER.iter().copied()) {
        return Err(ExportError::Header(headers.iter().collect::<Vec<_>>().join(",")));
    }

    let mut passes = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let r = RowReader {
            row: idx + 1,
            record: &record,
        };
        let period_kind = PeriodKind::parse(&r.text(4)).ok_or_else(|| r.bad(4))?;
        let source_format = SourceFormat::parse(&r.text(6)).ok_or_else(|| r.bad(6))?;
        let parameters: BTreeMap<String, String> =
            serde_json::from_str(&r.text(18)).map_err(|_| r.bad(18))?;
        passes.push(CanonicalPass {
            pass: r.count(7)?,
            metrics: PassMetrics {
                profit: r.float(8)?,
                expected_payoff: r.float(9)?,
                drawdown: r.float(10)?,
                drawdown_pct: r.float(11)?,
                profit_factor: r.float(12)?,
                recovery_factor: r.float(13)?,
                sharpe_ratio: r.float(14)?,
                total_trades: r.count(15)?,
                profit_trades: r.count(16)?,
                max_consecutive_losses: r.count(17)?,
            },
            parameters,
            provenance: Provenance {
                robot: r.text(0),
                symbol: r.text(1),
                timeframe: r.text(2),
                period: r.text(3),
                period_kind,
                source_file: r.text(5),
                source_format,
            },
        });
    }
    Ok(passes)
}

pub fn read_passes_csv(path: &Path) -> Result<Vec<CanonicalPass>, ExportError> {
    let bytes = fs::read(path)?;
    passes_from_csv(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pass: Option<u64>) -> CanonicalPass {
        CanonicalPass {
            pass,
            metrics: PassMetrics {
                profit: Some(0.1 + 0.2),
                drawdown_pct: Some(-0.0),
                total_trades: Some(0),
                ..PassMetrics::default()
            },
            parameters: BTreeMap::new(),
            provenance: Provenance {
                robot: "Experts\\Grid, v2.ex5".to_string(),
                symbol: "EURUSD".to_string(),
                timeframe: "H1".to_string(),
                period: "q\"1\"".to_string(),
                period_kind: PeriodKind::Forwardtest,
                source_file: "report.xml".to_string(),
                source_format: SourceFormat::Xml,
            },
        }
    }

    #[test]
    fn csv_keeps_nulls_quotes_and_float_bits() {
        let mut with_params = sample(Some(12));
        with_params
            .parameters
            .insert("Comment".to_string(), "a,b \"c\"".to_string());
        let passes = vec![sample(None), with_params];

        let bytes = passes_to_csv(&passes).expect("write csv");
        let back = passes_from_csv(&bytes).expect("read csv");
        assert_eq!(back, passes);
        assert_eq!(
            back[0].metrics.profit.map(f64::to_bits),
            Some((0.1f64 + 0.2).to_bits())
        );
        assert!(back[0].parameters.is_empty());
        assert_eq!(back[0].metrics.sharpe_ratio, None);
    }

    #[test]
    fn json_keeps_float_bits_of_long_mantissas() {
        let mut values = vec![90269.37363188561, 62208.493435459444, 9950.482069653373];
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..2000 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            values.push((state >> 11) as f64 / (1u64 << 53) as f64 * 200_000.0 - 100_000.0);
        }
        let passes: Vec<CanonicalPass> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut pass = sample(Some(i as u64));
                pass.metrics.profit = Some(*v);
                pass.metrics.sharpe_ratio = Some(v / 7.0);
                pass
            })
            .collect();

        let dir = std::env::temp_dir().join(format!(
            "cascade_export_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let path = dir.join("passes.json");
        write_passes_json(&path, &passes).expect("write json");
        let back = read_passes_json(&path).expect("read json");
        assert_eq!(back.len(), passes.len());
        for (a, b) in passes.iter().zip(&back) {
            assert_eq!(
                a.metrics.profit.map(f64::to_bits),
                b.metrics.profit.map(f64::to_bits),
                "profit {:?} came back as {:?}",
                a.metrics.profit,
                b.metrics.profit
            );
            assert_eq!(
                a.metrics.sharpe_ratio.map(f64::to_bits),
                b.metrics.sharpe_ratio.map(f64::to_bits)
            );
        }
        assert_eq!(back, passes);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn csv_rejects_foreign_header() {
        let err = passes_from_csv(b"a,b,c\n1,2,3\n").expect_err("wrong header");
        assert!(matches!(err, ExportError::Header(_)));
    }

    #[test]
    fn csv_reports_bad_cells_with_position() {
        let mut bytes = passes_to_csv(&[sample(Some(1))]).expect("write csv");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        bytes = text.replacen(",forwardtest,", ",sideways,", 1).into_bytes();
        match passes_from_csv(&bytes) {
            Err(ExportError::Field { row, column, value }) => {
                assert_eq!(row, 1);
                assert_eq!(column, "period_kind");
                assert_eq!(value, "sideways");
            }
            other => panic!("expected field error, got {:?}", other),
        }
    }
}
