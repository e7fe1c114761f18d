//! Column naming and numeric coercion shared by every tabular format.

use cascade_core::PassMetrics;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Metric {
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Column {
    Pass,
    Metric(Metric),
    Parameter(String),
}

impl Column {
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Column::Parameter(_))
    }
}

/// Lowercase, `%` spelled out as `pct`, everything else non-alphanumeric dropped.
pub(crate) fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    for c in header.chars() {
        if c == '%' {
            out.push_str("pct");
        } else if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn lookup(normalized: &str) -> Option<Column> {
    let metric = match normalized {
        "pass" | "passno" | "passnumber" => return Some(Column::Pass),
        "profit" | "netprofit" | "totalnetprofit" | "result" => Metric::Profit,
        "expectedpayoff" | "payoff" => Metric::ExpectedPayoff,
        "drawdown" | "maxdrawdown" | "maximaldrawdown" | "equitydd" | "balancedd"
        | "equityddmaximal" | "balanceddmaximal" => Metric::Drawdown,
        "drawdownpct" | "drawdownpercent" | "maxdrawdownpct" | "equityddpct"
        | "balanceddpct" | "equityddrelative" | "balanceddrelative" => Metric::DrawdownPct,
        "profitfactor" => Metric::ProfitFactor,
        "recoveryfactor" => Metric::RecoveryFactor,
        "sharperatio" | "sharpe" => Metric::SharpeRatio,
        "trades" | "totaltrades" => Metric::TotalTrades,
        "profittrades" | "wintrades" | "winningtrades" => Metric::ProfitTrades,
        "maxconsecutivelosses" | "consecutivelosses" | "maximumconsecutivelosses" => {
            Metric::MaxConsecutiveLosses
        }
        _ => return None,
    };
    Some(Column::Metric(metric))
}

/// Maps each header to a column. The first header bound to a metric wins;
/// later duplicates are kept as parameters so no value is lost.
pub(crate) fn classify_headers<S: AsRef<str>>(headers: &[S]) -> Vec<Column> {
    let mut taken: Vec<Column> = Vec::new();
    headers
        .iter()
        .map(|h| {
            let header = h.as_ref().trim();
            match lookup(&normalize_header(header)) {
                Some(col) if !taken.contains(&col) => {
                    taken.push(col.clone());
                    col
                }
                _ => Column::Parameter(header.to_string()),
            }
        })
        .collect()
}

/// A pass before provenance is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PassDraft {
    pub pass: Option<u64>,
    pub metrics: PassMetrics,
    pub parameters: BTreeMap<String, String>,
}

impl PassDraft {
    pub(crate) fn apply(&mut self, column: &Column, raw: &str) {
        match column {
            Column::Pass => self.pass = parse_count(raw),
            Column::Parameter(name) => {
                self.parameters
                    .insert(name.clone(), raw.trim().to_string());
            }
            Column::Metric(metric) => self.apply_metric(*metric, raw),
        }
    }

    fn apply_metric(&mut self, metric: Metric, raw: &str) {
        let m = &mut self.metrics;
        match metric {
            Metric::Profit => m.profit = parse_number(raw),
            Metric::ExpectedPayoff => m.expected_payoff = parse_number(raw),
            Metric::Drawdown => {
                let (amount, pct) = split_amount_percent(raw);
                m.drawdown = amount;
                if m.drawdown_pct.is_none() {
                    m.drawdown_pct = pct;
                }
            }
            Metric::DrawdownPct => {
                let (first, pct) = split_amount_percent(raw);
                m.drawdown_pct = pct.or(first);
            }
            Metric::ProfitFactor => m.profit_factor = parse_number(raw),
            Metric::RecoveryFactor => m.recovery_factor = parse_number(raw),
            Metric::SharpeRatio => m.sharpe_ratio = parse_number(raw),
            Metric::TotalTrades => m.total_trades = parse_count(raw),
            Metric::ProfitTrades => m.profit_trades = parse_count(raw),
            Metric::MaxConsecutiveLosses => m.max_consecutive_losses = parse_count(raw),
        }
    }
}

/// Tolerant numeric coercion; anything that is not a finite number is `None`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();
    if let Some(stripped) = s.strip_suffix('%') {
        s = stripped.to_string();
    }
    if s.is_empty() {
        return None;
    }
    if s.contains(',') {
        let commas = s.matches(',').count();
        s = if s.contains('.') || commas > 1 {
            s.replace(',', "")
        } else {
            s.replace(',', ".")
        };
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_count(raw: &str) -> Option<u64> {
    let value = parse_number(raw)?;
    if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

/// `"1234.50 (12.34%)"` → `(Some(1234.5), Some(12.34))`.
pub(crate) fn split_amount_percent(raw: &str) -> (Option<f64>, Option<f64>) {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.find('('), raw.rfind(')')) {
        if open < close {
            let amount = parse_number(&raw[..open]);
            let pct = parse_number(&raw[open + 1..close]);
            return (amount, pct);
        }
    }
    (parse_number(raw), None)
}
