//! Backtest runner: replays cached days through one detector per config
//!
//! The load range is extended by the longest record-after of all configs so
//! events triggered near the end of the target range finish recording.
//! Events triggered in that extension are discarded afterwards.

use tracing::{debug, info};

use crate::cache::{CacheError, CachedDay, KlineCache};
use crate::detector::DropDetector;
use crate::types::{BacktestConfigResult, DetectorConfig, TimeRange};

/// Longest record-after across `configs`
pub fn trailing_seconds(configs: &[DetectorConfig]) -> u32 {
    configs
        .iter()
        .map(|c| c.record_after_seconds)
        .max()
        .unwrap_or(0)
}

/// Results of one backtest over a target range
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub symbol: String,
    pub range: TimeRange,
    /// One entry per config, in config order
    pub results: Vec<BacktestConfigResult>,
    /// Days with at least one point inside `range`
    pub days_processed: usize,
    /// Points inside `range`; trailing points are replayed but not counted
    pub points_processed: usize,
}

impl BacktestReport {
    /// No cached data inside the target range
    pub fn is_empty(&self) -> bool {
        self.days_processed == 0
    }

    pub fn total_events(&self) -> usize {
        self.results.iter().map(|r| r.events.len()).sum()
    }
}

/// Replay `days` (chronological, already loaded over the extended range)
/// through one detector per config.
///
/// Every point is fed to the detectors in config order. Points past the
/// extended end are ignored.
pub fn run_backtest<I, E>(
    symbol: &str,
    configs: &[DetectorConfig],
    range: TimeRange,
    days: I,
) -> Result<BacktestReport, E>
where
    I: IntoIterator<Item = Result<CachedDay, E>>,
{
    let symbol = symbol.to_uppercase();
    let load_range = range.extended_by(trailing_seconds(configs));

    let mut detectors: Vec<DropDetector> = configs.iter().copied().map(DropDetector::new).collect();
    let mut results: Vec<BacktestConfigResult> =
        configs.iter().copied().map(BacktestConfigResult::new).collect();

    let mut days_processed = 0;
    let mut points_processed = 0;

    for day in days {
        let CachedDay { day, klines } = day?;
        let mut fed = 0;
        let mut in_range = 0;

        for kline in klines.iter().filter(|k| load_range.contains(k.open_time)) {
            let point = kline.to_price_point(&symbol);
            for (detector, result) in detectors.iter_mut().zip(results.iter_mut()) {
                if let Some(event) = detector.feed(point.clone()) {
                    if range.contains(event.trigger_timestamp) {
                        result.events.push(event);
                    } else {
                        debug!(id = %event.id, "Event triggered outside target range, discarded");
                    }
                }
            }
            fed += 1;
            if range.contains(kline.open_time) {
                in_range += 1;
            }
        }

        if in_range == 0 {
            debug!(symbol = %symbol, %day, klines = fed, "Trailing day replayed");
            continue;
        }
        days_processed += 1;
        points_processed += in_range;
        info!(
            symbol = %symbol,
            %day,
            klines = in_range,
            events = %config_summary(&results),
            "Day processed"
        );
    }

    info!(symbol = %symbol, days = days_processed, range = %range.label(), "Backtest replay complete");

    Ok(BacktestReport {
        symbol,
        range,
        results,
        days_processed,
        points_processed,
    })
}

/// Load `range` plus trailing data from the cache and run the backtest
pub fn run_from_cache(
    cache: &KlineCache,
    symbol: &str,
    configs: &[DetectorConfig],
    range: TimeRange,
) -> Result<BacktestReport, CacheError> {
    let load_range = range.extended_by(trailing_seconds(configs));
    run_backtest(symbol, configs, range, cache.load_klines(symbol, load_range))
}

/// `60s/2%: 3, 30s/2%: 5`
fn config_summary(results: &[BacktestConfigResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}: {}", r.config.label(), r.events.len()))
        .collect::<Vec<_>>()
        .join(", ")
}
