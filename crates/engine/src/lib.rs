//! Drop Scout engine: rapid-drop detection and backtesting
//!
//! Provides:
//! - Rolling-window drop detector (trigger / record / complete)
//! - Per-day kline cache with completeness checks and atomic writes
//! - Binance REST client with throttling retry, and a cache downloader
//! - Backtest runner (extend-then-filter replay over cached days)
//! - Outcome aggregation, cross-run analysis and expectancy ranking
//! - Live monitor over the Binance 1s kline WebSocket

pub mod analysis;
pub mod api;
pub mod cache;
pub mod config;
pub mod detector;
pub mod downloader;
pub mod monitor;
pub mod outcome;
pub mod persist;
pub mod runner;
pub mod types;

// Re-exports for convenience
pub use analysis::{analyze_runs, expectancy, AnalysisError, ConfigAnalysis, RunSummary};
pub use api::{ApiError, BinanceClient, KlinePages, KlineSource, RetryPolicy};
pub use cache::{CacheError, CachedDay, KlineCache};
pub use config::{ConfigError, PatternConfigFile, PatternKind};
pub use detector::{DetectorState, DropDetector};
pub use downloader::{DownloadError, DownloadSummary, Downloader};
pub use monitor::{run_monitor, MonitorError, ReconnectPolicy, SymbolMonitor};
pub use outcome::{EventOutcome, RunAggregates};
pub use persist::{filter_new_configs, persist_report, PersistSummary};
pub use runner::{run_backtest, run_from_cache, trailing_seconds, BacktestReport};
pub use types::*;
