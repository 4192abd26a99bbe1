//! Rapid drop detector
//!
//! One detector per (config, symbol stream). Each fed point trims the rolling
//! window, then either extends the active recording or checks whether the
//! drop from the window high crosses the threshold. A completed event is
//! returned from [`DropDetector::feed`] exactly once, when a point at or past
//! `trigger + record_after` arrives.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::types::{DetectorConfig, DropEvent, PricePoint};

/// Percent drop from `high` down to `price`. `None` when `high` is zero.
pub fn drop_percent_from(high: Decimal, price: Decimal) -> Option<Decimal> {
    (high - price).checked_div(high).map(|ratio| ratio * dec!(100))
}

/// An event being recorded
#[derive(Debug, Clone)]
pub struct Recording {
    pub event: DropEvent,
    pub end_timestamp: i64,
    pub window_high: Decimal,
}

impl Recording {
    /// Append a point to the recording. Returns the next state and, when the
    /// recording period is over, the finished event.
    pub fn advance(mut self, point: PricePoint) -> (DetectorState, Option<DropEvent>) {
        let drop = drop_percent_from(self.window_high, point.price).unwrap_or(Decimal::ZERO);
        if drop > self.event.drop_percent {
            self.event.drop_percent = drop;
        }
        if point.price < self.event.lowest_price {
            self.event.lowest_price = point.price;
            self.event.lowest_price_timestamp = point.timestamp;
        }

        let done = point.timestamp >= self.end_timestamp;
        self.event.prices_after.push(point);

        if done {
            debug!(
                symbol = %self.event.symbol,
                points = self.event.prices_after.len(),
                max_drop = %self.event.drop_percent.round_dp(2),
                "Recording complete"
            );
            (DetectorState::Idle, Some(self.event))
        } else {
            (DetectorState::Recording(self), None)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum DetectorState {
    #[default]
    Idle,
    Recording(Recording),
}

/// Stateful drop detector for a single config and a single symbol
#[derive(Debug, Clone)]
pub struct DropDetector {
    config: DetectorConfig,
    window: VecDeque<PricePoint>,
    state: DetectorState,
    last_trigger_timestamp: Option<i64>,
}

impl DropDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            state: DetectorState::Idle,
            last_trigger_timestamp: None,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, DetectorState::Recording(_))
    }

    /// Current rolling window, oldest first
    pub fn window(&self) -> impl Iterator<Item = &PricePoint> {
        self.window.iter()
    }

    /// Feed the next price sample. Returns an event when its recording completes.
    pub fn feed(&mut self, point: PricePoint) -> Option<DropEvent> {
        let cutoff = point.timestamp - self.config.window_ms();
        while self.window.front().is_some_and(|p| p.timestamp <= cutoff) {
            self.window.pop_front();
        }
        self.window.push_back(point.clone());

        let (next, emitted) = match std::mem::take(&mut self.state) {
            DetectorState::Recording(recording) => recording.advance(point),
            DetectorState::Idle => (self.check_trigger(&point), None),
        };
        self.state = next;
        emitted
    }

    fn check_trigger(&mut self, point: &PricePoint) -> DetectorState {
        if self.window.len() < 2 {
            return DetectorState::Idle;
        }

        let window_high = match self.window.iter().map(|p| p.price).max() {
            Some(high) => high,
            None => return DetectorState::Idle,
        };
        let drop = match drop_percent_from(window_high, point.price) {
            Some(drop) => drop,
            None => return DetectorState::Idle,
        };

        let cooled_down = self
            .last_trigger_timestamp
            .map_or(true, |last| point.timestamp - last > self.config.cooldown_ms());

        if drop < self.config.drop_percent || !cooled_down {
            return DetectorState::Idle;
        }

        self.last_trigger_timestamp = Some(point.timestamp);

        debug!(
            symbol = %point.symbol,
            drop = %drop.round_dp(2),
            window = self.config.window_seconds,
            high = %window_high,
            price = %point.price,
            record_after = self.config.record_after_seconds,
            "Drop detected"
        );

        let event = DropEvent {
            id: event_id(&self.config, point),
            symbol: point.symbol.clone(),
            trigger_price: point.price,
            trigger_timestamp: point.timestamp,
            window_high,
            drop_percent: drop,
            config_drop_percent: self.config.drop_percent,
            lowest_price: point.price,
            lowest_price_timestamp: point.timestamp,
            window_seconds: self.config.window_seconds,
            prices_before: self.window.iter().cloned().collect(),
            prices_after: Vec::new(),
        };

        DetectorState::Recording(Recording {
            event,
            end_timestamp: point.timestamp + self.config.record_after_ms(),
            window_high,
        })
    }
}

/// Deterministic id: one detector triggers at most once per timestamp
fn event_id(config: &DetectorConfig, point: &PricePoint) -> String {
    format!(
        "{}-{}-w{}-d{}-r{}-c{}",
        point.symbol,
        point.timestamp,
        config.window_seconds,
        config.drop_percent.normalize(),
        config.record_after_seconds,
        config.cooldown_seconds
    )
}
