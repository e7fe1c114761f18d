use crate::job::{JobKey, PeriodKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which kind of output file a pass came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Xml,
    Html,
    Delimited,
    Text,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Xml => "xml",
            SourceFormat::Html => "html",
            SourceFormat::Delimited => "delimited",
            SourceFormat::Text => "text",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "xml" => Some(SourceFormat::Xml),
            "html" => Some(SourceFormat::Html),
            "delimited" => Some(SourceFormat::Delimited),
            "text" => Some(SourceFormat::Text),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known metrics of one optimization pass. `None` means the value was absent
/// or unparseable; zero is a real value and is never used as a placeholder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassMetrics {
    pub profit: Option<f64>,
    pub expected_payoff: Option<f64>,
    pub drawdown: Option<f64>,
    pub drawdown_pct: Option<f64>,
    pub profit_factor: Option<f64>,
    pub recovery_factor: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub total_trades: Option<u64>,
    pub profit_trades: Option<u64>,
    pub max_consecutive_losses: Option<u64>,
}

impl PassMetrics {
    /// `profit_trades / total_trades * 100`; undefined without trades.
    pub fn win_rate(&self) -> Option<f64> {
        match (self.profit_trades, self.total_trades) {
            (Some(wins), Some(total)) if total > 0 => Some(wins as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub robot: String,
    pub symbol: String,
    pub timeframe: String,
    pub period: String,
    pub period_kind: PeriodKind,
    pub source_file: String,
    pub source_format: SourceFormat,
}

impl Provenance {
    pub fn for_job(key: &JobKey, source_file: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            robot: key.robot.clone(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            period: key.period.clone(),
            period_kind: key.kind,
            source_file: source_file.into(),
            source_format: format,
        }
    }
}

/// Format-independent record of one optimization trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPass {
    pub pass: Option<u64>,
    pub metrics: PassMetrics,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win_rate_is_undefined_without_trades() {
        let mut metrics = PassMetrics {
            profit_trades: Some(0),
            total_trades: Some(0),
            ..PassMetrics::default()
        };
        assert_eq!(metrics.win_rate(), None);
        metrics.total_trades = None;
        assert_eq!(metrics.win_rate(), None);
        metrics.total_trades = Some(8);
        metrics.profit_trades = Some(6);
        assert_eq!(metrics.win_rate(), Some(75.0));
    }

    #[test]
    fn null_metrics_serialize_as_null() {
        let value = serde_json::to_value(PassMetrics {
            profit: Some(0.0),
            ..PassMetrics::default()
        })
        .unwrap();
        assert_eq!(value["profit"], serde_json::json!(0.0));
        assert!(value["drawdown"].is_null());
    }
}
