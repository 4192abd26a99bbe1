//! Conversion of backtest and live results into persistence records, and
//! best-effort storage of a backtest report

use persistence::repository::{
    BacktestRepository, BacktestRunRecord, DropEventRecord, EventWithPoints, PricePhase,
    PricePointRecord, SaveOutcome,
};
use persistence::{Database, DbResult};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::outcome::RunAggregates;
use crate::runner::BacktestReport;
use crate::types::{BacktestConfigResult, DetectorConfig, DropEvent, TimeRange};

/// Deterministic key of a (symbol, range, config) run, used to skip reruns
pub fn compute_params_hash(symbol: &str, range: TimeRange, config: &DetectorConfig) -> String {
    let input = format!(
        "rapid-drop:{}:{}:{}:{}:{}:{}:{}",
        symbol.to_uppercase(),
        range.from_ms,
        range.to_ms,
        config.window_seconds,
        config.drop_percent.normalize(),
        config.record_after_seconds,
        config.cooldown_seconds
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn decimal_text(value: Decimal) -> String {
    value.round_dp(8).normalize().to_string()
}

fn optional_text(value: Option<Decimal>) -> Option<String> {
    value.map(decimal_text)
}

/// Summary row for one config's results over `range`
pub fn result_to_record(symbol: &str, range: TimeRange, result: &BacktestConfigResult) -> BacktestRunRecord {
    let config = &result.config;
    let agg = RunAggregates::from_events(&result.events);

    BacktestRunRecord {
        id: None,
        params_hash: compute_params_hash(symbol, range, config),
        symbol: symbol.to_uppercase(),
        range_label: range.label(),
        from_time: range.from_ms,
        to_time: range.to_ms,
        window_seconds: i64::from(config.window_seconds),
        drop_percent: config.drop_percent.normalize().to_string(),
        record_after_seconds: i64::from(config.record_after_seconds),
        cooldown_seconds: i64::from(config.cooldown_seconds),
        events_found: agg.events_found as i64,
        profitable_count: agg.profitable_count as i64,
        win_rate: optional_text(agg.win_rate),
        avg_max_profit: optional_text(agg.avg_max_profit),
        median_max_profit: optional_text(agg.median_max_profit),
        avg_max_drawdown: optional_text(agg.avg_max_drawdown),
        median_max_drawdown: optional_text(agg.median_max_drawdown),
        max_max_drawdown: optional_text(agg.max_max_drawdown),
        avg_time_to_breakeven: optional_text(agg.avg_time_to_breakeven),
        median_time_to_breakeven: optional_text(agg.median_time_to_breakeven),
        avg_time_to_max_profit: optional_text(agg.avg_time_to_max_profit),
        avg_end_result: optional_text(agg.avg_end_result),
        recovery_json: serde_json::to_string(&agg.recovery).ok(),
    }
}

/// Event row plus its before/after points, before points first
pub fn event_to_record(event: &DropEvent) -> EventWithPoints {
    let points = event
        .prices_before
        .iter()
        .map(|p| PricePointRecord::new(PricePhase::Before, p.timestamp, p.price.to_string()))
        .chain(
            event
                .prices_after
                .iter()
                .map(|p| PricePointRecord::new(PricePhase::After, p.timestamp, p.price.to_string())),
        )
        .collect();

    EventWithPoints {
        event: DropEventRecord {
            id: None,
            event_uid: event.id.clone(),
            symbol: event.symbol.clone(),
            trigger_price: event.trigger_price.to_string(),
            trigger_timestamp: event.trigger_timestamp,
            window_high: event.window_high.to_string(),
            drop_percent: decimal_text(event.drop_percent),
            config_drop_percent: event.config_drop_percent.normalize().to_string(),
            lowest_price: event.lowest_price.to_string(),
            lowest_price_timestamp: event.lowest_price_timestamp,
            window_seconds: i64::from(event.window_seconds),
        },
        points,
    }
}

/// Configs without a stored run for (symbol, range), in their original order
pub async fn filter_new_configs(
    db: &Database,
    symbol: &str,
    range: TimeRange,
    configs: &[DetectorConfig],
) -> DbResult<Vec<DetectorConfig>> {
    let repo = BacktestRepository::new(db.pool());
    let mut fresh = Vec::with_capacity(configs.len());
    for config in configs {
        let hash = compute_params_hash(symbol, range, config);
        if repo.exists_by_hash(&hash).await? {
            info!(symbol, range = %range.label(), config = %config.label(), "Skipped: already exists");
        } else {
            fresh.push(*config);
        }
    }
    Ok(fresh)
}

/// Counts from one `persist_report` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Store every config result of `report`. A failed run is logged and the
/// remaining runs are still attempted.
pub async fn persist_report(db: &Database, report: &BacktestReport) -> PersistSummary {
    let repo = BacktestRepository::new(db.pool());
    let mut summary = PersistSummary::default();

    for result in &report.results {
        let run = result_to_record(&report.symbol, report.range, result);
        let events: Vec<EventWithPoints> = result.events.iter().map(event_to_record).collect();
        let label = result.config.label();

        match repo.save_run(&run, &events).await {
            Ok(SaveOutcome::Inserted(run_id)) => {
                info!(
                    symbol = %report.symbol,
                    range = %run.range_label,
                    config = %label,
                    events = events.len(),
                    run_id,
                    "Run persisted"
                );
                summary.inserted += 1;
            }
            Ok(SaveOutcome::Skipped) => {
                info!(symbol = %report.symbol, range = %run.range_label, config = %label, "Skipped: already exists");
                summary.skipped += 1;
            }
            Err(e) => {
                warn!(symbol = %report.symbol, range = %run.range_label, config = %label, error = %e, "Failed to persist run");
                summary.failed += 1;
            }
        }
    }

    summary
}
