//! Live events repository: drop events captured from the exchange stream

use sqlx::SqlitePool;

use super::{insert_price_points, DropEventRecord, EventWithPoints};
use crate::DbResult;

/// Repository for events recorded by the live monitor
pub struct LiveEventRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LiveEventRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store one event and its price points atomically. Returns the row id.
    pub async fn save_event(&self, item: &EventWithPoints) -> DbResult<i64> {
        let event = &item.event;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO live_events (
                event_uid, symbol, trigger_price, trigger_timestamp, window_high,
                drop_percent, config_drop_percent, lowest_price, lowest_price_timestamp,
                window_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
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

        let event_id = inserted.last_insert_rowid();
        insert_price_points(&mut tx, "live_price_points", event_id, &item.points).await?;
        tx.commit().await?;

        Ok(event_id)
    }

    /// Most recent live events for a symbol
    pub async fn recent_events(&self, symbol: &str, limit: i64) -> DbResult<Vec<DropEventRecord>> {
        let records = sqlx::query_as::<_, DropEventRecord>(
            r#"
            SELECT id, event_uid, symbol, trigger_price, trigger_timestamp, window_high,
                   drop_percent, config_drop_percent, lowest_price, lowest_price_timestamp,
                   window_seconds
            FROM live_events
            WHERE symbol = ?
            ORDER BY trigger_timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{PricePhase, PricePointRecord};
    use crate::Database;

    fn live_event(uid: &str, trigger_timestamp: i64) -> EventWithPoints {
        EventWithPoints {
            event: DropEventRecord {
                id: None,
                event_uid: uid.to_string(),
                symbol: "SOLUSDT".to_string(),
                trigger_price: "145.2".to_string(),
                trigger_timestamp,
                window_high: "148.5".to_string(),
                drop_percent: "2.22".to_string(),
                config_drop_percent: "2".to_string(),
                lowest_price: "144.9".to_string(),
                lowest_price_timestamp: trigger_timestamp + 4_000,
                window_seconds: 60,
            },
            points: vec![
                PricePointRecord::new(PricePhase::Before, trigger_timestamp - 1_000, "148.5".into()),
                PricePointRecord::new(PricePhase::Before, trigger_timestamp, "145.2".into()),
                PricePointRecord::new(PricePhase::After, trigger_timestamp + 1_000, "144.9".into()),
            ],
        }
    }

    #[tokio::test]
    async fn test_save_and_read_back_live_event() {
        let db = Database::in_memory().await.unwrap();
        let repo = LiveEventRepository::new(db.pool());

        repo.save_event(&live_event("a", 10_000)).await.unwrap();
        let id = repo.save_event(&live_event("b", 20_000)).await.unwrap();

        let recent = repo.recent_events("SOLUSDT", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, Some(id));
        assert_eq!(recent[0].event_uid, "b");

        let (points,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM live_price_points WHERE event_id = ?")
                .bind(id)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(points, 3);
    }

    #[tokio::test]
    async fn test_duplicate_uid_leaves_no_partial_rows() {
        let db = Database::in_memory().await.unwrap();
        let repo = LiveEventRepository::new(db.pool());

        repo.save_event(&live_event("dup", 10_000)).await.unwrap();
        assert!(repo.save_event(&live_event("dup", 10_000)).await.is_err());

        let (points,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM live_price_points")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(points, 3);
    }
}
