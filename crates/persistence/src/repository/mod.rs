//! Repository implementations for database operations

pub mod backtest;
pub mod live;

pub use backtest::*;
pub use live::*;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};

use crate::DbResult;

/// Rows per multi-value INSERT for price points. Four binds per row keeps a
/// batch at 2000 parameters, well under SQLite's variable limit.
pub const PRICE_POINT_BATCH_SIZE: usize = 500;

/// Which side of the trigger a stored price point belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricePhase {
    Before,
    After,
}

impl PricePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricePhase::Before => "before",
            PricePhase::After => "after",
        }
    }
}

/// A stored price sample attached to an event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PricePointRecord {
    pub phase: String,
    pub timestamp: i64,
    pub price: String,
}

impl PricePointRecord {
    pub fn new(phase: PricePhase, timestamp: i64, price: String) -> Self {
        Self {
            phase: phase.as_str().to_string(),
            timestamp,
            price,
        }
    }
}

/// A completed drop event as stored (shared by backtest and live tables)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DropEventRecord {
    pub id: Option<i64>,
    pub event_uid: String,
    pub symbol: String,
    pub trigger_price: String,
    pub trigger_timestamp: i64,
    pub window_high: String,
    pub drop_percent: String,
    pub config_drop_percent: String,
    pub lowest_price: String,
    pub lowest_price_timestamp: i64,
    pub window_seconds: i64,
}

/// An event together with its before/after price points, ready to insert
#[derive(Debug, Clone)]
pub struct EventWithPoints {
    pub event: DropEventRecord,
    pub points: Vec<PricePointRecord>,
}

/// Insert an event's price points in bounded batches on an open connection
/// (normally a transaction).
pub(crate) async fn insert_price_points(
    conn: &mut SqliteConnection,
    table: &str,
    event_id: i64,
    points: &[PricePointRecord],
) -> DbResult<()> {
    for chunk in points.chunks(PRICE_POINT_BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {table} (event_id, phase, timestamp, price) "));
        builder.push_values(chunk, |mut row, point| {
            row.push_bind(event_id)
                .push_bind(point.phase.as_str())
                .push_bind(point.timestamp)
                .push_bind(point.price.as_str());
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}
