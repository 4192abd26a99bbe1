//! Persistence layer for Drop Scout
//!
//! SQLite storage for backtest run summaries, their drop events and the
//! before/after price points, plus events captured by the live monitor.

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Applied to every new database. WAL lets `analyze` read while a backtest writes.
const PRAGMAS: [&str; 3] = [
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA foreign_keys=ON",
];

/// SQLite connection pool with the drop-scout schema applied
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Connection(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        Self::open(&format!("sqlite:{}?mode=rwc", path.display()), 5).await
    }

    /// Single-connection in-memory database, used by tests
    pub async fn in_memory() -> DbResult<Self> {
        Self::open("sqlite::memory:", 1).await
    }

    async fn open(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(format!("{url}: {e}")))?;

        for pragma in PRAGMAS {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(|e| DbError::Connection(format!("{pragma} failed: {e}")))?;
        }

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// Idempotent: every statement is `IF NOT EXISTS`
    async fn create_schema(&self) -> DbResult<()> {
        for sql in schema::statements() {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned handle for spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_creates_all_tables() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "backtest_events",
                "backtest_price_points",
                "backtest_runs",
                "live_events",
                "live_price_points",
            ]
        );
    }

    #[tokio::test]
    async fn test_schema_creation_is_rerunnable() {
        let db = Database::in_memory().await.unwrap();
        db.create_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_database_in_new_directory() {
        let dir = std::env::temp_dir().join(format!("drop-scout-db-{}", std::process::id()));
        let path = dir.join("nested").join("test.db");
        let db = Database::new(&path).await.unwrap();
        assert!(path.exists());
        drop(db);
        std::fs::remove_dir_all(&dir).ok();
    }
}
