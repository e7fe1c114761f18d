use cascade_core::{CanonicalPass, PassMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metric a threshold or a ranking reads from a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    Profit,
    ExpectedPayoff,
    Drawdown,
    DrawdownPct,
    ProfitFactor,
    RecoveryFactor,
    SharpeRatio,
    TotalTrades,
    ProfitTrades,
    MaxConsecutiveLosses,
    WinRate,
}

impl MetricKey {
    pub const ALL: [MetricKey; 11] = [
        MetricKey::Profit,
        MetricKey::ExpectedPayoff,
        MetricKey::Drawdown,
        MetricKey::DrawdownPct,
        MetricKey::ProfitFactor,
        MetricKey::RecoveryFactor,
        MetricKey::SharpeRatio,
        MetricKey::TotalTrades,
        MetricKey::ProfitTrades,
        MetricKey::MaxConsecutiveLosses,
        MetricKey::WinRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::Profit => "profit",
            MetricKey::ExpectedPayoff => "expected_payoff",
            MetricKey::Drawdown => "drawdown",
            MetricKey::DrawdownPct => "drawdown_pct",
            MetricKey::ProfitFactor => "profit_factor",
            MetricKey::RecoveryFactor => "recovery_factor",
            MetricKey::SharpeRatio => "sharpe_ratio",
            MetricKey::TotalTrades => "total_trades",
            MetricKey::ProfitTrades => "profit_trades",
            MetricKey::MaxConsecutiveLosses => "max_consecutive_losses",
            MetricKey::WinRate => "win_rate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|m| m.as_str() == wanted)
    }

    /// `None` when the metric is missing or, for win rate, undefined.
    pub fn value(&self, metrics: &PassMetrics) -> Option<f64> {
        match self {
            MetricKey::Profit => metrics.profit,
            MetricKey::ExpectedPayoff => metrics.expected_payoff,
            MetricKey::Drawdown => metrics.drawdown,
            MetricKey::DrawdownPct => metrics.drawdown_pct,
            MetricKey::ProfitFactor => metrics.profit_factor,
            MetricKey::RecoveryFactor => metrics.recovery_factor,
            MetricKey::SharpeRatio => metrics.sharpe_ratio,
            MetricKey::TotalTrades => metrics.total_trades.map(|v| v as f64),
            MetricKey::ProfitTrades => metrics.profit_trades.map(|v| v as f64),
            MetricKey::MaxConsecutiveLosses => metrics.max_consecutive_losses.map(|v| v as f64),
            MetricKey::WinRate => metrics.win_rate(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AtMost,
    AtLeast,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: MetricKey,
    pub direction: Direction,
    pub value: f64,
}

impl Threshold {
    /// A missing metric never satisfies a threshold.
    pub fn admits(&self, metrics: &PassMetrics) -> bool {
        match self.metric.value(metrics) {
            Some(actual) => match self.direction {
                Direction::AtMost => actual <= self.value,
                Direction::AtLeast => actual >= self.value,
            },
            None => false,
        }
    }
}

/// Acceptance criteria. Unset fields impose nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Criteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_drawdown_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_profit_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_expected_payoff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_recovery_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_sharpe_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trades: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_losses: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_win_rate: Option<f64>,
}

/// Why a pass was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub threshold: Threshold,
    pub actual: Option<f64>,
}

impl Criteria {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds().is_empty()
    }

    pub fn thresholds(&self) -> Vec<Threshold> {
        let at_most = |metric, value| Threshold {
            metric,
            direction: Direction::AtMost,
            value,
        };
        let at_least = |metric, value| Threshold {
            metric,
            direction: Direction::AtLeast,
            value,
        };
        let mut out = Vec::new();
        if let Some(v) = self.max_drawdown_percent {
            out.push(at_most(MetricKey::DrawdownPct, v));
        }
        if let Some(v) = self.min_profit_factor {
            out.push(at_least(MetricKey::ProfitFactor, v));
        }
        if let Some(v) = self.min_expected_payoff {
            out.push(at_least(MetricKey::ExpectedPayoff, v));
        }
        if let Some(v) = self.min_recovery_factor {
            out.push(at_least(MetricKey::RecoveryFactor, v));
        }
        if let Some(v) = self.min_sharpe_ratio {
            out.push(at_least(MetricKey::SharpeRatio, v));
        }
        if let Some(v) = self.min_trades {
            out.push(at_least(MetricKey::TotalTrades, v as f64));
        }
        if let Some(v) = self.max_consecutive_losses {
            out.push(at_most(MetricKey::MaxConsecutiveLosses, v as f64));
        }
        if let Some(v) = self.min_win_rate {
            out.push(at_least(MetricKey::WinRate, v));
        }
        out
    }

    /// Every threshold the pass fails; empty means accepted.
    pub fn evaluate(&self, pass: &CanonicalPass) -> Vec<Rejection> {
        self.thresholds()
            .into_iter()
            .filter(|t| !t.admits(&pass.metrics))
            .map(|threshold| Rejection {
                actual: threshold.metric.value(&pass.metrics),
                threshold,
            })
            .collect()
    }

    pub fn accepts(&self, pass: &CanonicalPass) -> bool {
        self.thresholds().iter().all(|t| t.admits(&pass.metrics))
    }
}
