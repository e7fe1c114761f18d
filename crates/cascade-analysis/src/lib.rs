//! Filtering and ranking over canonical passes. Everything here reads typed
//! metrics; a missing value is never read as zero.

pub mod criteria;

pub use criteria::{Criteria, Direction, MetricKey, Rejection, Threshold};

use cascade_core::{CanonicalPass, ManifestSettings};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Metric used when no ranking metric is given.
pub const DEFAULT_RANK_METRIC: MetricKey = MetricKey::Profit;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterReport {
    pub total: usize,
    pub kept: usize,
    pub passes: Vec<CanonicalPass>,
}

pub fn filter_passes(passes: &[CanonicalPass], criteria: &Criteria) -> FilterReport {
    let thresholds = criteria.thresholds();
    let kept: Vec<CanonicalPass> = passes
        .iter()
        .filter(|p| thresholds.iter().all(|t| t.admits(&p.metrics)))
        .cloned()
        .collect();
    debug!(
        total = passes.len(),
        kept = kept.len(),
        thresholds = thresholds.len(),
        "filtered passes"
    );
    FilterReport {
        total: passes.len(),
        kept: kept.len(),
        passes: kept,
    }
}

/// Descending by `metric`; passes without the metric sort last. Ties keep
/// their input order.
pub fn rank_passes(
    passes: &[CanonicalPass],
    metric: MetricKey,
    top_n: Option<usize>,
) -> Vec<CanonicalPass> {
    let mut ranked: Vec<&CanonicalPass> = passes.iter().collect();
    ranked.sort_by(|a, b| {
        match (metric.value(&a.metrics), metric.value(&b.metrics)) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
    let limit = top_n.unwrap_or(ranked.len());
    ranked.into_iter().take(limit).cloned().collect()
}

/// Criteria carried in the manifest's `analysis_criteria` block, if any.
pub fn criteria_from_settings(
    settings: &ManifestSettings,
) -> Result<Option<Criteria>, serde_json::Error> {
    settings
        .analysis_criteria
        .as_ref()
        .map(Criteria::from_value)
        .transpose()
}

/// A parameter value with its most specific type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub fn coerce_parameter(raw: &str) -> ParamValue {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return ParamValue::Bool(true),
        "false" => return ParamValue::Bool(false),
        _ => {}
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return ParamValue::Int(v);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => ParamValue::Float(v),
        _ => ParamValue::Text(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{PassMetrics, PeriodKind, Provenance, SourceFormat};
    use std::collections::BTreeMap;

    fn pass(id: u64, metrics: PassMetrics) -> CanonicalPass {
        CanonicalPass {
            pass: Some(id),
            metrics,
            parameters: BTreeMap::new(),
            provenance: Provenance {
                robot: "Grid".to_string(),
                symbol: "EURUSD".to_string(),
                timeframe: "H1".to_string(),
                period: "p1".to_string(),
                period_kind: PeriodKind::Backtest,
                source_file: "r.csv".to_string(),
                source_format: SourceFormat::Delimited,
            },
        }
    }

    fn profit(id: u64, value: Option<f64>) -> CanonicalPass {
        pass(
            id,
            PassMetrics {
                profit: value,
                ..PassMetrics::default()
            },
        )
    }

    #[test]
    fn zero_trade_pass_is_excluded_by_win_rate() {
        let criteria = Criteria {
            min_win_rate: Some(0.0),
            ..Criteria::default()
        };
        let passes = vec![
            pass(
                1,
                PassMetrics {
                    total_trades: Some(0),
                    profit_trades: Some(0),
                    ..PassMetrics::default()
                },
            ),
            pass(
                2,
                PassMetrics {
                    total_trades: Some(10),
                    profit_trades: Some(6),
                    ..PassMetrics::default()
                },
            ),
        ];
        let report = filter_passes(&passes, &criteria);
        assert_eq!(report.total, 2);
        assert_eq!(report.kept, 1);
        assert_eq!(report.passes[0].pass, Some(2));
    }

    #[test]
    fn empty_criteria_keep_everything() {
        let passes = vec![profit(1, None), profit(2, Some(-1.0))];
        let report = filter_passes(&passes, &Criteria::default());
        assert_eq!(report.kept, 2);
    }

    #[test]
    fn evaluate_lists_every_failed_threshold() {
        let criteria = Criteria {
            min_profit_factor: Some(1.5),
            max_drawdown_percent: Some(10.0),
            min_trades: Some(30),
            ..Criteria::default()
        };
        let p = pass(
            1,
            PassMetrics {
                profit_factor: Some(1.2),
                drawdown_pct: Some(5.0),
                ..PassMetrics::default()
            },
        );
        let rejections = criteria.evaluate(&p);
        let metrics: Vec<MetricKey> = rejections.iter().map(|r| r.threshold.metric).collect();
        assert_eq!(metrics, vec![MetricKey::ProfitFactor, MetricKey::TotalTrades]);
        assert_eq!(rejections[1].actual, None);
        assert!(!criteria.accepts(&p));
    }

    #[test]
    fn ranking_is_descending_stable_with_nulls_last() {
        let passes = vec![
            profit(1, None),
            profit(2, Some(5.0)),
            profit(3, Some(9.0)),
            profit(4, Some(5.0)),
            profit(5, None),
        ];
        let ids: Vec<Option<u64>> = rank_passes(&passes, MetricKey::Profit, None)
            .into_iter()
            .map(|p| p.pass)
            .collect();
        assert_eq!(ids, vec![Some(3), Some(2), Some(4), Some(1), Some(5)]);

        let top = rank_passes(&passes, MetricKey::Profit, Some(2));
        assert_eq!(top.len(), 2);
        assert_eq!(top[1].pass, Some(2));
    }

    #[test]
    fn parameters_coerce_to_the_narrowest_type() {
        assert_eq!(coerce_parameter("true"), ParamValue::Bool(true));
        assert_eq!(coerce_parameter("FALSE"), ParamValue::Bool(false));
        assert_eq!(coerce_parameter(" 42 "), ParamValue::Int(42));
        assert_eq!(coerce_parameter("0.25"), ParamValue::Float(0.25));
        assert_eq!(coerce_parameter("inf"), ParamValue::Text("inf".to_string()));
        assert_eq!(
            coerce_parameter("50||10||5||100||Y"),
            ParamValue::Text("50||10||5||100||Y".to_string())
        );
    }
}
