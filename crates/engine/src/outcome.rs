//! Per-event outcome metrics and per-config aggregates
//!
//! All percentages are relative to the trigger price: an entry at the
//! trigger, held through the recorded after-window.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{DropEvent, PricePoint};

/// Seconds after trigger at which recovery is sampled
pub const RECOVERY_INTERVALS: [u32; 4] = [60, 120, 300, 600];

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Percent change from `base` to `price`; `None` when `base` is zero
pub fn percent_change(base: Decimal, price: Decimal) -> Option<Decimal> {
    (price - base).checked_div(base).map(|r| r * HUNDRED)
}

fn elapsed_seconds(from_ms: i64, to_ms: i64) -> Decimal {
    Decimal::new(to_ms - from_ms, 3).normalize()
}

/// Derived profitability of one completed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub max_profit_percent: Decimal,
    pub max_drawdown_percent: Decimal,
    /// First after-point strictly above the trigger price
    pub time_to_breakeven_seconds: Option<Decimal>,
    pub time_to_max_profit_seconds: Decimal,
    pub end_result_percent: Decimal,
}

impl EventOutcome {
    /// Single pass over `prices_after`. `None` for events without after-points
    /// or with a zero trigger price.
    pub fn compute(event: &DropEvent) -> Option<Self> {
        let trigger = event.trigger_price;
        let last = event.prices_after.last()?;

        let mut max_profit = Decimal::ZERO;
        let mut time_to_max_profit = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;
        let mut time_to_breakeven = None;

        for point in &event.prices_after {
            let change = percent_change(trigger, point.price)?;
            if change > max_profit {
                max_profit = change;
                time_to_max_profit = elapsed_seconds(event.trigger_timestamp, point.timestamp);
            }
            if -change > max_drawdown {
                max_drawdown = -change;
            }
            if time_to_breakeven.is_none() && point.price > trigger {
                time_to_breakeven = Some(elapsed_seconds(event.trigger_timestamp, point.timestamp));
            }
        }

        Some(Self {
            max_profit_percent: max_profit,
            max_drawdown_percent: max_drawdown,
            time_to_breakeven_seconds: time_to_breakeven,
            time_to_max_profit_seconds: time_to_max_profit,
            end_result_percent: percent_change(trigger, last.price)?,
        })
    }

    pub fn reached_breakeven(&self) -> bool {
        self.time_to_breakeven_seconds.is_some()
    }
}

/// After-point whose timestamp is closest to `trigger + seconds`; the
/// earlier point wins a tie
pub fn closest_after_point(event: &DropEvent, seconds: u32) -> Option<&PricePoint> {
    let target = event.trigger_timestamp + i64::from(seconds) * 1000;
    event
        .prices_after
        .iter()
        .min_by_key(|p| (p.timestamp - target).abs())
}

/// Percent change from trigger at the after-point closest to `trigger + seconds`
pub fn recovery_at(event: &DropEvent, seconds: u32) -> Option<Decimal> {
    closest_after_point(event, seconds).and_then(|p| percent_change(event.trigger_price, p.price))
}

/// How far price fell below the trigger before the event completed
pub fn drawdown_after_trigger(event: &DropEvent) -> Option<Decimal> {
    (event.trigger_price - event.lowest_price)
        .checked_div(event.trigger_price)
        .map(|r| r * HUNDRED)
}

/// Recovery statistics at one interval across a config's events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalRecovery {
    pub seconds: u32,
    pub avg_change_percent: Option<Decimal>,
    /// Percent of events trading above the trigger price at the interval
    pub win_rate: Option<Decimal>,
}

impl IntervalRecovery {
    pub fn compute(events: &[DropEvent], seconds: u32) -> Self {
        let changes: Vec<Decimal> = events.iter().filter_map(|e| recovery_at(e, seconds)).collect();
        let above = changes.iter().filter(|c| **c > Decimal::ZERO).count();
        Self {
            seconds,
            avg_change_percent: mean(&changes),
            win_rate: ratio_percent(above, changes.len()),
        }
    }
}

/// Aggregate statistics for the events of one config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAggregates {
    pub events_found: usize,
    /// Events with a computable outcome
    pub evaluated: usize,
    pub profitable_count: usize,
    /// Percent of evaluated events that reached breakeven
    pub win_rate: Option<Decimal>,
    pub avg_max_profit: Option<Decimal>,
    pub median_max_profit: Option<Decimal>,
    pub avg_max_drawdown: Option<Decimal>,
    pub median_max_drawdown: Option<Decimal>,
    pub max_max_drawdown: Option<Decimal>,
    pub avg_time_to_breakeven: Option<Decimal>,
    pub median_time_to_breakeven: Option<Decimal>,
    pub avg_time_to_max_profit: Option<Decimal>,
    pub avg_end_result: Option<Decimal>,
    pub recovery: Vec<IntervalRecovery>,
}

impl RunAggregates {
    pub fn from_events(events: &[DropEvent]) -> Self {
        let outcomes: Vec<EventOutcome> = events.iter().filter_map(EventOutcome::compute).collect();

        let max_profits: Vec<Decimal> = outcomes.iter().map(|o| o.max_profit_percent).collect();
        let drawdowns: Vec<Decimal> = outcomes.iter().map(|o| o.max_drawdown_percent).collect();
        let breakevens: Vec<Decimal> = outcomes
            .iter()
            .filter_map(|o| o.time_to_breakeven_seconds)
            .collect();
        let max_profit_times: Vec<Decimal> = outcomes.iter().map(|o| o.time_to_max_profit_seconds).collect();
        let end_results: Vec<Decimal> = outcomes.iter().map(|o| o.end_result_percent).collect();

        Self {
            events_found: events.len(),
            evaluated: outcomes.len(),
            profitable_count: breakevens.len(),
            win_rate: ratio_percent(breakevens.len(), outcomes.len()),
            avg_max_profit: mean(&max_profits),
            median_max_profit: median(&max_profits),
            avg_max_drawdown: mean(&drawdowns),
            median_max_drawdown: median(&drawdowns),
            max_max_drawdown: drawdowns.iter().copied().max(),
            avg_time_to_breakeven: mean(&breakevens),
            median_time_to_breakeven: median(&breakevens),
            avg_time_to_max_profit: mean(&max_profit_times),
            avg_end_result: mean(&end_results),
            recovery: RECOVERY_INTERVALS
                .iter()
                .map(|&s| IntervalRecovery::compute(events, s))
                .collect(),
        }
    }
}

pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().sum();
    sum.checked_div(Decimal::from(values.len()))
}

pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

fn ratio_percent(part: usize, whole: usize) -> Option<Decimal> {
    Decimal::from(part)
        .checked_div(Decimal::from(whole))
        .map(|r| r * HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(trigger_price: Decimal, after: &[(i64, Decimal)]) -> DropEvent {
        let trigger_timestamp = 1_000_000;
        let prices_after: Vec<PricePoint> = after
            .iter()
            .map(|&(offset_s, price)| PricePoint {
                symbol: "BTCUSDT".to_string(),
                timestamp: trigger_timestamp + offset_s * 1000,
                price,
            })
            .collect();
        let lowest = prices_after
            .iter()
            .map(|p| p.price)
            .chain(std::iter::once(trigger_price))
            .min()
            .unwrap();
        DropEvent {
            id: "test".to_string(),
            symbol: "BTCUSDT".to_string(),
            trigger_price,
            trigger_timestamp,
            window_high: dec!(102),
            drop_percent: dec!(2),
            config_drop_percent: dec!(2),
            lowest_price: lowest,
            lowest_price_timestamp: trigger_timestamp,
            window_seconds: 60,
            prices_before: Vec::new(),
            prices_after,
        }
    }

    #[test]
    fn test_outcome_of_dip_then_recovery() {
        let e = event(
            dec!(100),
            &[(1, dec!(99)), (2, dec!(97)), (3, dec!(100)), (4, dec!(101)), (5, dec!(103)), (6, dec!(102))],
        );
        let o = EventOutcome::compute(&e).unwrap();
        assert_eq!(o.max_profit_percent, dec!(3));
        assert_eq!(o.max_drawdown_percent, dec!(3));
        assert_eq!(o.time_to_breakeven_seconds, Some(dec!(4)));
        assert_eq!(o.time_to_max_profit_seconds, dec!(5));
        assert_eq!(o.end_result_percent, dec!(2));
    }

    #[test]
    fn test_never_above_trigger_has_no_breakeven() {
        let e = event(dec!(100), &[(1, dec!(98)), (2, dec!(99)), (3, dec!(100))]);
        let o = EventOutcome::compute(&e).unwrap();
        assert_eq!(o.time_to_breakeven_seconds, None);
        assert_eq!(o.max_profit_percent, Decimal::ZERO);
        assert_eq!(o.time_to_max_profit_seconds, Decimal::ZERO);
        assert_eq!(o.end_result_percent, Decimal::ZERO);

        let agg = RunAggregates::from_events(&[e]);
        assert_eq!(agg.profitable_count, 0);
        assert_eq!(agg.win_rate, Some(Decimal::ZERO));
        assert_eq!(agg.avg_time_to_breakeven, None);
    }

    #[test]
    fn test_empty_after_list_has_no_outcome() {
        let e = event(dec!(100), &[]);
        assert!(EventOutcome::compute(&e).is_none());

        let agg = RunAggregates::from_events(&[e]);
        assert_eq!(agg.events_found, 1);
        assert_eq!(agg.evaluated, 0);
        assert_eq!(agg.win_rate, None);
    }

    #[test]
    fn test_zero_trigger_price_is_skipped() {
        let e = event(Decimal::ZERO, &[(1, dec!(1))]);
        assert!(EventOutcome::compute(&e).is_none());
    }

    #[test]
    fn test_aggregates_over_three_events() {
        let events = vec![
            event(dec!(100), &[(10, dec!(95)), (20, dec!(104))]),
            event(dec!(100), &[(5, dec!(98)), (30, dec!(99))]),
            event(dec!(100), &[(2, dec!(101)), (40, dec!(92))]),
        ];
        let agg = RunAggregates::from_events(&events);

        assert_eq!(agg.events_found, 3);
        assert_eq!(agg.profitable_count, 2);
        assert_eq!(agg.win_rate.unwrap().round_dp(2), dec!(66.67));
        // max profit 4, 0, 1
        assert_eq!(agg.avg_max_profit.unwrap().round_dp(4), dec!(1.6667));
        assert_eq!(agg.median_max_profit, Some(dec!(1)));
        // drawdown 5, 2, 8
        assert_eq!(agg.avg_max_drawdown, Some(dec!(5)));
        assert_eq!(agg.median_max_drawdown, Some(dec!(5)));
        assert_eq!(agg.max_max_drawdown, Some(dec!(8)));
        // breakeven at 20s and 2s
        assert_eq!(agg.avg_time_to_breakeven, Some(dec!(11)));
        assert_eq!(agg.median_time_to_breakeven, Some(dec!(11)));
        // end results 4, -1, -8
        assert_eq!(agg.avg_end_result.unwrap().round_dp(4), dec!(-1.6667));
        // time to max profit 20, 0, 2
        assert_eq!(agg.avg_time_to_max_profit.unwrap().round_dp(4), dec!(7.3333));
    }

    #[test]
    fn test_recovery_uses_closest_point() {
        let e = event(dec!(100), &[(58, dec!(99)), (61, dec!(102)), (125, dec!(98))]);
        assert_eq!(recovery_at(&e, 60), Some(dec!(2)));
        assert_eq!(recovery_at(&e, 120), Some(dec!(-2)));
        // earlier point wins a tie
        let tie = event(dec!(100), &[(59, dec!(99)), (61, dec!(102))]);
        assert_eq!(recovery_at(&tie, 60), Some(dec!(-1)));
        assert_eq!(recovery_at(&event(dec!(100), &[]), 60), None);
    }

    #[test]
    fn test_interval_recovery_stats() {
        let events = vec![
            event(dec!(100), &[(60, dec!(101)), (600, dec!(103))]),
            event(dec!(100), &[(60, dec!(100)), (600, dec!(97))]),
        ];
        let agg = RunAggregates::from_events(&events);
        let one_min = &agg.recovery[0];
        assert_eq!(one_min.seconds, 60);
        assert_eq!(one_min.avg_change_percent, Some(dec!(0.5)));
        assert_eq!(one_min.win_rate, Some(dec!(50)));

        let ten_min = agg.recovery.iter().find(|r| r.seconds == 600).unwrap();
        assert_eq!(ten_min.avg_change_percent, Some(Decimal::ZERO));
        assert_eq!(ten_min.win_rate, Some(dec!(50)));
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[dec!(3), dec!(1), dec!(2)]), Some(dec!(2)));
        assert_eq!(median(&[dec!(4), dec!(1), dec!(3), dec!(2)]), Some(dec!(2.5)));
        assert_eq!(median(&[]), None);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_drawdown_after_trigger() {
        let e = event(dec!(200), &[(1, dec!(190)), (2, dec!(195))]);
        assert_eq!(drawdown_after_trigger(&e), Some(dec!(5)));
    }
}
