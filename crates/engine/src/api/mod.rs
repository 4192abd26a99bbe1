//! Exchange market data clients

pub mod binance;

pub use binance::{ApiError, BinanceClient, KlinePages, KlineSource, RetryPolicy};
