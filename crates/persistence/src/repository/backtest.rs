//! Backtest runs repository: per-config run summaries with their events

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use super::{insert_price_points, DropEventRecord, EventWithPoints, PricePointRecord};
use crate::DbResult;

/// Summary row for one (symbol, range, config) backtest run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub symbol: String,
    pub range_label: String,
    pub from_time: i64,
    pub to_time: i64,
    pub window_seconds: i64,
    pub drop_percent: String,
    pub record_after_seconds: i64,
    pub cooldown_seconds: i64,
    pub events_found: i64,
    pub profitable_count: i64,
    pub win_rate: Option<String>,
    pub avg_max_profit: Option<String>,
    pub median_max_profit: Option<String>,
    pub avg_max_drawdown: Option<String>,
    pub median_max_drawdown: Option<String>,
    pub max_max_drawdown: Option<String>,
    pub avg_time_to_breakeven: Option<String>,
    pub median_time_to_breakeven: Option<String>,
    pub avg_time_to_max_profit: Option<String>,
    pub avg_end_result: Option<String>,
    pub recovery_json: Option<String>,
}

/// Result of trying to store a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(i64),
    /// A run with the same params_hash already exists; nothing was written
    Skipped,
}

const RUN_COLUMNS: &str = r#"
    id, params_hash, symbol, range_label, from_time, to_time,
    window_seconds, drop_percent, record_after_seconds, cooldown_seconds,
    events_found, profitable_count, win_rate,
    avg_max_profit, median_max_profit, avg_max_drawdown, median_max_drawdown, max_max_drawdown,
    avg_time_to_breakeven, median_time_to_breakeven, avg_time_to_max_profit, avg_end_result,
    recovery_json
"#;

/// Repository for backtest runs, events and price points
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Check if a run with this params_hash already exists
    pub async fn exists_by_hash(&self, hash: &str) -> DbResult<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs WHERE params_hash = ?")
            .bind(hash)
            .fetch_one(self.pool)
            .await?;

        Ok(row.0 > 0)
    }

    /// Store a run summary, its events and all their price points in one
    /// transaction. Skips (and writes nothing) when the params_hash exists.
    pub async fn save_run(
        &self,
        run: &BacktestRunRecord,
        events: &[EventWithPoints],
    ) -> DbResult<SaveOutcome> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO backtest_runs (
                params_hash, symbol, range_label, from_time, to_time,
                window_seconds, drop_percent, record_after_seconds, cooldown_seconds,
                events_found, profitable_count, win_rate,
                avg_max_profit, median_max_profit, avg_max_drawdown, median_max_drawdown, max_max_drawdown,
                avg_time_to_breakeven, median_time_to_breakeven, avg_time_to_max_profit, avg_end_result,
                recovery_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.params_hash)
        .bind(&run.symbol)
        .bind(&run.range_label)
        .bind(run.from_time)
        .bind(run.to_time)
        .bind(run.window_seconds)
        .bind(&run.drop_percent)
        .bind(run.record_after_seconds)
        .bind(run.cooldown_seconds)
        .bind(run.events_found)
        .bind(run.profitable_count)
        .bind(&run.win_rate)
        .bind(&run.avg_max_profit)
        .bind(&run.median_max_profit)
        .bind(&run.avg_max_drawdown)
        .bind(&run.median_max_drawdown)
        .bind(&run.max_max_drawdown)
        .bind(&run.avg_time_to_breakeven)
        .bind(&run.median_time_to_breakeven)
        .bind(&run.avg_time_to_max_profit)
        .bind(&run.avg_end_result)
        .bind(&run.recovery_json)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SaveOutcome::Skipped);
        }
        let run_id = result.last_insert_rowid();

        for item in events {
            let event = &item.event;
            let inserted = sqlx::query(
                r#"
                INSERT INTO backtest_events (
                    run_id, event_uid, symbol, trigger_price, trigger_timestamp, window_high,
                    drop_percent, config_drop_percent, lowest_price, lowest_price_timestamp,
                    window_seconds
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(&event.event_uid)
            .bind(&event.symbol)
            .bind(&event.trigger_price)
            .bind(event.trigger_timestamp)
            .bind(&event.window_high)
            .bind(&event.drop_percent)
            .bind(&event.config_drop_percent)
            .bind(&event.lowest_price)
            .bind(event.lowest_price_timestamp)
            .bind(event.window_seconds)
            .execute(&mut *tx)
            .await?;

            insert_price_points(
                &mut tx,
                "backtest_price_points",
                inserted.last_insert_rowid(),
                &item.points,
            )
            .await?;
        }

        tx.commit().await?;
        debug!(run_id, events = events.len(), "Backtest run stored");

        Ok(SaveOutcome::Inserted(run_id))
    }

    /// Runs, optionally filtered by symbol and record-after length, oldest range first
    pub async fn list_runs(
        &self,
        symbol: Option<&str>,
        record_after_seconds: Option<i64>,
    ) -> DbResult<Vec<BacktestRunRecord>> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM backtest_runs WHERE 1=1");
        if symbol.is_some() {
            sql.push_str(" AND symbol = ?");
        }
        if record_after_seconds.is_some() {
            sql.push_str(" AND record_after_seconds = ?");
        }
        sql.push_str(" ORDER BY symbol, from_time, id");

        let mut query = sqlx::query_as::<_, BacktestRunRecord>(&sql);
        if let Some(sym) = symbol {
            query = query.bind(sym);
        }
        if let Some(secs) = record_after_seconds {
            query = query.bind(secs);
        }

        Ok(query.fetch_all(self.pool).await?)
    }

    /// Events of a run in trigger order
    pub async fn get_events(&self, run_id: i64) -> DbResult<Vec<DropEventRecord>> {
        let records = sqlx::query_as::<_, DropEventRecord>(
            r#"
            SELECT id, event_uid, symbol, trigger_price, trigger_timestamp, window_high,
                   drop_percent, config_drop_percent, lowest_price, lowest_price_timestamp,
                   window_seconds
            FROM backtest_events
            WHERE run_id = ?
            ORDER BY trigger_timestamp, id
            "#,
        )
        .bind(run_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Price points of an event, before-phase first, each phase in time order
    pub async fn get_price_points(&self, event_id: i64) -> DbResult<Vec<PricePointRecord>> {
        let records = sqlx::query_as::<_, PricePointRecord>(
            r#"
            SELECT phase, timestamp, price
            FROM backtest_price_points
            WHERE event_id = ?
            ORDER BY CASE phase WHEN 'before' THEN 0 ELSE 1 END, timestamp, id
            "#,
        )
        .bind(event_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
