//! Fills kline cache gaps from a remote source, one UTC day at a time

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::binance::{ApiError, KlinePages, KlineSource, DEFAULT_PAGE_DELAY};
use crate::cache::{CacheError, KlineCache};
use crate::types::TimeRange;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What one `download_symbol` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub symbol: String,
    /// Days that were missing before the call
    pub missing: usize,
    /// (day, klines) written to the cache
    pub cached: Vec<(NaiveDate, usize)>,
    /// (day, klines received) rejected as incomplete; still missing afterwards
    pub incomplete: Vec<(NaiveDate, usize)>,
}

impl DownloadSummary {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// Downloads missing days from a [`KlineSource`] into a [`KlineCache`]
pub struct Downloader<'a, S: KlineSource + ?Sized> {
    source: &'a S,
    cache: &'a KlineCache,
    page_delay: Duration,
}

impl<'a, S: KlineSource + ?Sized> Downloader<'a, S> {
    pub fn new(source: &'a S, cache: &'a KlineCache) -> Self {
        Self {
            source,
            cache,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Download every day of `range` that the cache does not hold completely.
    ///
    /// Incomplete days are logged and reported but do not stop the download.
    /// API errors abort it.
    pub async fn download_symbol(
        &self,
        symbol: &str,
        range: TimeRange,
    ) -> Result<DownloadSummary, DownloadError> {
        let symbol = symbol.to_uppercase();
        let missing = self.cache.get_missing_days(&symbol, range)?;
        let mut summary = DownloadSummary {
            symbol: symbol.clone(),
            missing: missing.len(),
            ..Default::default()
        };

        if missing.is_empty() {
            info!(symbol = %symbol, "Cache complete, no downloads needed");
            return Ok(summary);
        }

        info!(symbol = %symbol, days = missing.len(), "Downloading missing days");

        for day in missing {
            let day_range = TimeRange::for_day(day);
            let klines = KlinePages::new(self.source, &symbol, day_range.from_ms, day_range.to_ms)
                .with_page_delay(self.page_delay)
                .collect_all()
                .await?;

            match self.cache.cache_day(&symbol, day, &klines) {
                Ok(()) => {
                    info!(symbol = %symbol, %day, klines = klines.len(), "Day cached");
                    summary.cached.push((day, klines.len()));
                }
                Err(CacheError::IncompleteData { got, expected, .. }) => {
                    warn!(symbol = %symbol, %day, got, expected, "Incomplete day, not cached");
                    summary.incomplete.push((day, got));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summary)
    }
}
