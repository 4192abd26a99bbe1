//! Binance public REST client for 1s klines (no authentication required)

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Kline;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
pub const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Pause between two successful pages
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(500);

const KLINE_INTERVAL: &str = "1s";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Binance API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Binance still throttling ({status}) after {attempts} attempts")]
    RetriesExhausted { status: u16, attempts: u32 },

    #[error("malformed kline: {0}")]
    Decode(String),
}

/// Backoff schedule for throttled requests (HTTP 429 / 503)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2_000),
            max_jitter: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// `2^attempt * base + jitter_sample * max_jitter`, with `jitter_sample` in [0, 1)
    pub fn backoff_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponential = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        exponential + self.max_jitter.mul_f64(jitter_sample.clamp(0.0, 1.0))
    }

    pub fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Anything that can serve one page of 1s klines for `[start_time, end_time]`
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, ApiError>;
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl TryFrom<RawKline> for Kline {
    type Error = ApiError;

    fn try_from(raw: RawKline) -> Result<Self, Self::Error> {
        let decimal = |s: &str| {
            Decimal::from_str(s).map_err(|e| ApiError::Decode(format!("{s:?} at {}: {e}", raw.0)))
        };
        Ok(Kline {
            open_time: raw.0,
            open: decimal(&raw.1)?,
            high: decimal(&raw.2)?,
            low: decimal(&raw.3)?,
            close: decimal(&raw.4)?,
            volume: decimal(&raw.5)?,
            close_time: raw.6,
        })
    }
}

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl BinanceClient {
    /// Client against the production endpoint
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch one page of 1s klines, retrying throttled requests
    pub async fn get_klines(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, ApiError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = limit.min(MAX_KLINES_PER_REQUEST).to_string();
        let start = start_time.to_string();
        let end = end_time.to_string();
        let query = [
            ("symbol", symbol),
            ("interval", KLINE_INTERVAL),
            ("startTime", start.as_str()),
            ("endTime", end.as_str()),
            ("limit", limit.as_str()),
        ];

        let mut attempt = 0;
        loop {
            debug!(symbol, start_time, end_time, attempt, "Fetching klines from Binance");
            let response = self.client.get(&url).query(&query).send().await?;
            let status = response.status();

            if status.is_success() {
                let raw: Vec<RawKline> = response.json().await?;
                let klines = raw
                    .into_iter()
                    .map(Kline::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                debug!(count = klines.len(), "Fetched klines");
                return Ok(klines);
            }

            if !RetryPolicy::is_retryable(status) {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                return Err(ApiError::RetriesExhausted {
                    status: status.as_u16(),
                    attempts: attempt,
                });
            }

            let delay = self
                .retry
                .backoff_delay(attempt - 1, rand::thread_rng().gen::<f64>());
            warn!(
                symbol,
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, ApiError> {
        self.get_klines(symbol, start_time, end_time, limit).await
    }
}

/// Pull-based pagination over `[start_time, end_time]`.
///
/// Each page starts at the previous page's last close time + 1. A short or
/// empty page ends the sequence.
pub struct KlinePages<'a, S: KlineSource + ?Sized> {
    source: &'a S,
    symbol: String,
    cursor: i64,
    end_time: i64,
    page_delay: Duration,
    pages: usize,
    exhausted: bool,
}

impl<'a, S: KlineSource + ?Sized> KlinePages<'a, S> {
    pub fn new(source: &'a S, symbol: &str, start_time: i64, end_time: i64) -> Self {
        Self {
            source,
            symbol: symbol.to_uppercase(),
            cursor: start_time,
            end_time,
            page_delay: DEFAULT_PAGE_DELAY,
            pages: 0,
            exhausted: false,
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Next page, or `None` once the range is covered
    pub async fn next_page(&mut self) -> Result<Option<Vec<Kline>>, ApiError> {
        if self.exhausted || self.cursor >= self.end_time {
            return Ok(None);
        }

        if self.pages > 0 && !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let klines = self
            .source
            .fetch_klines(&self.symbol, self.cursor, self.end_time, MAX_KLINES_PER_REQUEST)
            .await?;

        let Some(last) = klines.last() else {
            self.exhausted = true;
            return Ok(None);
        };

        self.cursor = last.close_time + 1;
        self.pages += 1;
        if klines.len() < MAX_KLINES_PER_REQUEST {
            self.exhausted = true;
        }

        Ok(Some(klines))
    }

    /// Drain every remaining page into one vector
    pub async fn collect_all(mut self) -> Result<Vec<Kline>, ApiError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::ops::Range;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// In-memory source producing one flat 1s candle per second, except for
    /// open times inside `gap`
    pub(crate) struct SyntheticSource {
        pub gap: Option<Range<i64>>,
        pub calls: AtomicUsize,
    }

    impl SyntheticSource {
        pub(crate) fn new() -> Self {
            Self {
                gap: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_gap(gap: Range<i64>) -> Self {
            Self {
                gap: Some(gap),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KlineSource for SyntheticSource {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            start_time: i64,
            end_time: i64,
            limit: usize,
        ) -> Result<Vec<Kline>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let first = (start_time + 999).div_euclid(1000) * 1000;
            Ok((first..=end_time)
                .step_by(1000)
                .filter(|t| self.gap.as_ref().map_or(true, |g| !g.contains(t)))
                .take(limit)
                .map(|t| Kline {
                    open_time: t,
                    open: dec!(100),
                    high: dec!(100),
                    low: dec!(100),
                    close: dec!(100),
                    volume: dec!(1),
                    close_time: t + 999,
                })
                .collect())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    fn kline_body() -> serde_json::Value {
        serde_json::json!([
            [1709251200000i64, "67321.01", "67330.00", "67300.50", "67310.25", "1.2345",
             1709251200999i64, "83100.5", 42, "0.6", "40000.1", "0"],
            [1709251201000i64, "67310.25", "67312.00", "67290.00", "67295.00", "0.5",
             1709251201999i64, "33600.0", 7, "0.2", "13000.0", "0"]
        ])
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0, 0.0), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(1, 0.0), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(3, 0.0), Duration::from_millis(16_000));
        assert_eq!(policy.backoff_delay(0, 0.5), Duration::from_millis(2_500));
        assert!(policy.backoff_delay(2, 0.999) < Duration::from_millis(9_000));
    }

    #[test]
    fn test_only_throttling_is_retryable() {
        assert!(RetryPolicy::is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!RetryPolicy::is_retryable(StatusCode::BAD_REQUEST));
        assert!(!RetryPolicy::is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_get_klines_parses_decimal_strings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("interval", "1s"))
            .and(query_param("startTime", "1709251200000"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(kline_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri()).unwrap();
        let klines = client
            .get_klines("BTCUSDT", 1_709_251_200_000, 1_709_337_599_999, 5_000)
            .await
            .unwrap();

        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].open, dec!(67321.01));
        assert_eq!(klines[0].close_time, 1_709_251_200_999);
        assert_eq!(klines[1].close, dec!(67295.00));
    }

    #[tokio::test]
    async fn test_throttled_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(kline_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri())
            .unwrap()
            .with_retry_policy(fast_retry());
        let klines = client.get_klines("BTCUSDT", 0, 10_000, 1000).await.unwrap();
        assert_eq!(klines.len(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_five_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(503))
            .expect(5)
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri())
            .unwrap()
            .with_retry_policy(fast_retry());
        let err = client.get_klines("BTCUSDT", 0, 10_000, 1000).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::RetriesExhausted { status: 503, attempts: 5 }
        ));
    }

    #[tokio::test]
    async fn test_other_status_is_fatal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri())
            .unwrap()
            .with_retry_policy(fast_retry());
        let err = client.get_klines("NOPE", 0, 10_000, 1000).await.unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("Invalid symbol"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pagination_covers_range_without_gaps_or_duplicates() {
        let source = SyntheticSource::new();
        let start = 1_709_251_200_000;
        let end = start + 2_499_999;

        let mut pages = KlinePages::new(&source, "btcusdt", start, end).with_page_delay(Duration::ZERO);
        let mut sizes = Vec::new();
        let mut all = Vec::new();
        while let Some(page) = pages.next_page().await.unwrap() {
            sizes.push(page.len());
            all.extend(page);
        }

        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(all.first().unwrap().open_time, start);
        assert_eq!(all.last().unwrap().close_time, end);
        assert!(all.windows(2).all(|w| w[1].open_time == w[0].open_time + 1000));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_cursor_past_range() {
        let source = SyntheticSource::new();
        let start = 0;
        let end = 1_999_999;

        let all = KlinePages::new(&source, "ETHUSDT", start, end)
            .with_page_delay(Duration::ZERO)
            .collect_all()
            .await
            .unwrap();

        assert_eq!(all.len(), 2000);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
