//! Core types shared by the detector, cache, runner and aggregator

use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Milliseconds in one 1s candle
pub const KLINE_INTERVAL_MS: i64 = 1_000;

/// A single one-second candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Kline {
    /// Price sample for the detectors: close price stamped with the open time
    pub fn to_price_point(&self, symbol: &str) -> PricePoint {
        PricePoint {
            symbol: symbol.to_string(),
            timestamp: self.open_time,
            price: self.close,
        }
    }
}

/// One price observation. Timestamps are Unix milliseconds and must be
/// non-decreasing within a symbol's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub symbol: String,
    pub timestamp: i64,
    pub price: Decimal,
}

/// Parameters of one drop detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Rolling window length in seconds
    pub window_seconds: u32,
    /// Drop from the window high, in percent (2 = 2%), that triggers an event
    pub drop_percent: Decimal,
    /// How long to keep recording prices after a trigger
    pub record_after_seconds: u32,
    /// Minimum distance between two triggers, measured trigger to trigger
    pub cooldown_seconds: u32,
}

impl DetectorConfig {
    pub fn window_ms(&self) -> i64 {
        i64::from(self.window_seconds) * 1000
    }

    pub fn record_after_ms(&self) -> i64 {
        i64::from(self.record_after_seconds) * 1000
    }

    pub fn cooldown_ms(&self) -> i64 {
        i64::from(self.cooldown_seconds) * 1000
    }

    /// Short label such as `60s/2%`
    pub fn label(&self) -> String {
        format!("{}s/{}%", self.window_seconds, self.drop_percent.normalize())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            drop_percent: Decimal::from(2),
            record_after_seconds: 120,
            cooldown_seconds: 300,
        }
    }
}

impl std::fmt::Display for DetectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (record {}s, cooldown {}s)",
            self.label(),
            self.record_after_seconds,
            self.cooldown_seconds
        )
    }
}

/// A detected rapid drop and the prices recorded around it.
///
/// Mutated only by its detector while recording; immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropEvent {
    pub id: String,
    pub symbol: String,
    pub trigger_price: Decimal,
    pub trigger_timestamp: i64,
    /// Highest price in the rolling window at trigger time
    pub window_high: Decimal,
    /// Largest drop from `window_high` seen so far, in percent
    pub drop_percent: Decimal,
    /// Threshold of the config that fired
    pub config_drop_percent: Decimal,
    pub lowest_price: Decimal,
    pub lowest_price_timestamp: i64,
    pub window_seconds: u32,
    /// Window contents at trigger time, oldest first (includes the trigger point)
    pub prices_before: Vec<PricePoint>,
    /// Points fed while recording, in arrival order
    pub prices_after: Vec<PricePoint>,
}

/// Inclusive millisecond range `[from_ms, to_ms]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeRange {
    pub fn new(from_ms: i64, to_ms: i64) -> Self {
        Self { from_ms, to_ms }
    }

    /// One UTC calendar day, 00:00:00.000 to 23:59:59.999
    pub fn for_day(day: NaiveDate) -> Self {
        Self::for_days(day, day)
    }

    /// From the start of `from` to the end of `to` (UTC)
    pub fn for_days(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from_ms: day_start_ms(from),
            to_ms: day_start_ms(to) + DAY_MS - 1,
        }
    }

    /// Same start, end pushed out by `seconds`
    pub fn extended_by(&self, seconds: u32) -> Self {
        Self {
            from_ms: self.from_ms,
            to_ms: self.to_ms + i64::from(seconds) * 1000,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.from_ms && timestamp <= self.to_ms
    }

    /// UTC calendar days touched by the range, in order
    pub fn days(&self) -> Vec<NaiveDate> {
        match (date_of(self.from_ms), date_of(self.to_ms)) {
            (Some(first), Some(last)) => first.iter_days().take_while(|d| *d <= last).collect(),
            _ => Vec::new(),
        }
    }

    /// `2024-03-01` for a single day, `2024-03-01..2024-03-07` otherwise
    pub fn label(&self) -> String {
        let days = self.days();
        match (days.first(), days.last()) {
            (Some(first), Some(last)) if first == last => first.to_string(),
            (Some(first), Some(last)) => format!("{first}..{last}"),
            _ => format!("{}..{}", self.from_ms, self.to_ms),
        }
    }
}

pub const DAY_MS: i64 = 86_400_000;

/// Unix milliseconds at 00:00 UTC of `day`
pub fn day_start_ms(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::default()).and_utc().timestamp_millis()
}

/// UTC calendar day of a millisecond timestamp
pub fn date_of(timestamp_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|dt| dt.date_naive())
}

/// All events one detector config produced over a backtest range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfigResult {
    pub config: DetectorConfig,
    pub events: Vec<DropEvent>,
}

impl BacktestConfigResult {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            events: Vec::new(),
        }
    }
}
