//! Cross-run analysis: combines stored per-day run summaries by config and
//! ranks configs by fee-adjusted expectancy

use std::str::FromStr;

use persistence::repository::BacktestRunRecord;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::types::DetectorConfig;

/// Default taker fee per side, in percent
pub const DEFAULT_FEE_PERCENT: Decimal = Decimal::from_parts(2, 0, 0, false, 1);

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("run {run}: invalid {field} value {value:?}")]
    InvalidNumber {
        run: String,
        field: &'static str,
        value: String,
    },
}

/// One stored run summary, parsed back into numbers
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub config: DetectorConfig,
    pub events_found: u64,
    pub profitable_count: u64,
    pub avg_max_profit: Option<Decimal>,
    pub median_max_profit: Option<Decimal>,
    pub avg_max_drawdown: Option<Decimal>,
    pub max_max_drawdown: Option<Decimal>,
    pub avg_time_to_breakeven: Option<Decimal>,
    pub avg_end_result: Option<Decimal>,
}

impl TryFrom<&BacktestRunRecord> for RunSummary {
    type Error = AnalysisError;

    fn try_from(row: &BacktestRunRecord) -> Result<Self, Self::Error> {
        let run = format!("{} {}", row.symbol, row.range_label);
        let parse = |field: &'static str, value: &str| {
            Decimal::from_str(value).map_err(|_| AnalysisError::InvalidNumber {
                run: run.clone(),
                field,
                value: value.to_string(),
            })
        };
        let optional = |field: &'static str, value: &Option<String>| {
            value.as_deref().map(|v| parse(field, v)).transpose()
        };
        let count = |field: &'static str, value: i64| {
            u64::try_from(value).map_err(|_| AnalysisError::InvalidNumber {
                run: run.clone(),
                field,
                value: value.to_string(),
            })
        };
        let seconds = |field: &'static str, value: i64| {
            u32::try_from(value).map_err(|_| AnalysisError::InvalidNumber {
                run: run.clone(),
                field,
                value: value.to_string(),
            })
        };

        Ok(Self {
            config: DetectorConfig {
                window_seconds: seconds("window_seconds", row.window_seconds)?,
                drop_percent: parse("drop_percent", &row.drop_percent)?,
                record_after_seconds: seconds("record_after_seconds", row.record_after_seconds)?,
                cooldown_seconds: seconds("cooldown_seconds", row.cooldown_seconds)?,
            },
            events_found: count("events_found", row.events_found)?,
            profitable_count: count("profitable_count", row.profitable_count)?,
            avg_max_profit: optional("avg_max_profit", &row.avg_max_profit)?,
            median_max_profit: optional("median_max_profit", &row.median_max_profit)?,
            avg_max_drawdown: optional("avg_max_drawdown", &row.avg_max_drawdown)?,
            max_max_drawdown: optional("max_max_drawdown", &row.max_max_drawdown)?,
            avg_time_to_breakeven: optional("avg_time_to_breakeven", &row.avg_time_to_breakeven)?,
            avg_end_result: optional("avg_end_result", &row.avg_end_result)?,
        })
    }
}

/// Combined statistics of one config across all its runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAnalysis {
    pub config: DetectorConfig,
    pub runs: usize,
    pub total_events: u64,
    pub total_profitable: u64,
    /// Fraction of events reaching breakeven, 0..=1
    pub win_rate: Decimal,
    pub avg_max_profit: Decimal,
    pub median_max_profit: Decimal,
    pub avg_max_drawdown: Decimal,
    pub max_max_drawdown: Decimal,
    pub avg_time_to_breakeven: Option<Decimal>,
    pub avg_end_result: Decimal,
    /// Expected percent return per trade after round-trip fees
    pub expectancy: Decimal,
}

/// `win_rate * (avg_max_profit - 2 * fee) - (1 - win_rate) * avg_max_drawdown`
pub fn expectancy(win_rate: Decimal, avg_max_profit: Decimal, avg_max_drawdown: Decimal, fee_percent: Decimal) -> Decimal {
    win_rate * (avg_max_profit - Decimal::TWO * fee_percent) - (Decimal::ONE - win_rate) * avg_max_drawdown
}

#[derive(Default)]
struct Accumulator {
    runs: usize,
    events: u64,
    profitable: u64,
    max_profit: Decimal,
    median_max_profit: Decimal,
    max_drawdown: Decimal,
    worst_drawdown: Decimal,
    end_result: Decimal,
    breakeven: Decimal,
    breakeven_weight: u64,
}

impl Accumulator {
    fn add(&mut self, run: &RunSummary) {
        self.runs += 1;
        self.events += run.events_found;
        self.profitable += run.profitable_count;
        if run.events_found == 0 {
            return;
        }

        let n = Decimal::from(run.events_found);
        let value = |v: Option<Decimal>| v.unwrap_or_default();
        self.max_profit += value(run.avg_max_profit) * n;
        self.median_max_profit += value(run.median_max_profit) * n;
        self.max_drawdown += value(run.avg_max_drawdown) * n;
        self.end_result += value(run.avg_end_result) * n;
        self.worst_drawdown = self.worst_drawdown.max(value(run.max_max_drawdown));

        if let Some(breakeven) = run.avg_time_to_breakeven {
            if run.profitable_count > 0 {
                self.breakeven += breakeven * Decimal::from(run.profitable_count);
                self.breakeven_weight += run.profitable_count;
            }
        }
    }

    fn finish(self, config: DetectorConfig, fee_percent: Decimal) -> Option<ConfigAnalysis> {
        if self.events == 0 {
            return None;
        }
        let n = Decimal::from(self.events);
        let win_rate = Decimal::from(self.profitable) / n;
        let avg_max_profit = self.max_profit / n;
        let avg_max_drawdown = self.max_drawdown / n;

        Some(ConfigAnalysis {
            config,
            runs: self.runs,
            total_events: self.events,
            total_profitable: self.profitable,
            win_rate,
            avg_max_profit,
            median_max_profit: self.median_max_profit / n,
            avg_max_drawdown,
            max_max_drawdown: self.worst_drawdown,
            avg_time_to_breakeven: self
                .breakeven
                .checked_div(Decimal::from(self.breakeven_weight)),
            avg_end_result: self.end_result / n,
            expectancy: expectancy(win_rate, avg_max_profit, avg_max_drawdown, fee_percent),
        })
    }
}

/// Group runs by config, combine them event-count weighted and sort by
/// expectancy, best first. Configs without any event are left out.
pub fn analyze_runs(runs: &[RunSummary], fee_percent: Decimal) -> Vec<ConfigAnalysis> {
    let mut groups: Vec<(DetectorConfig, Accumulator)> = Vec::new();
    for run in runs {
        match groups.iter_mut().find(|(config, _)| *config == run.config) {
            Some((_, acc)) => acc.add(run),
            None => {
                let mut acc = Accumulator::default();
                acc.add(run);
                groups.push((run.config, acc));
            }
        }
    }

    let mut analyses: Vec<ConfigAnalysis> = groups
        .into_iter()
        .filter_map(|(config, acc)| acc.finish(config, fee_percent))
        .collect();
    analyses.sort_by(|a, b| b.expectancy.cmp(&a.expectancy));
    analyses
}
