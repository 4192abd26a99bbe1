//! Live monitor: Binance 1s kline WebSocket streams feeding drop detectors
//!
//! One task per symbol owns that symbol's detectors. Completed events go
//! through a bounded channel to a single persistence task.

use std::str::FromStr;
use std::time::Duration;

use futures_util::StreamExt;
use persistence::repository::LiveEventRepository;
use persistence::SqlitePool;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::detector::DropDetector;
use crate::persist::event_to_record;
use crate::types::{DetectorConfig, DropEvent, PricePoint};

pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Completed events buffered between detectors and the database
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("WebSocket error: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed kline message: {0}")]
    Decode(String),
}

/// Binance kline stream message.
///
/// ```json
/// {
///   "e": "kline", "E": 1709251201001, "s": "BTCUSDT",
///   "k": { "t": 1709251200000, "T": 1709251200999, "s": "BTCUSDT", "i": "1s",
///          "o": "67321.01", "c": "67310.25", "h": "67330.00", "l": "67300.50",
///          "v": "1.2345", "x": true }
/// }
/// ```
#[derive(Debug, Deserialize)]
struct KlineMessage {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    /// Kline start time
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "c")]
    close: String,
    /// Is this kline closed?
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Price point of a closed candle; `None` for candles still forming
pub fn parse_kline_message(text: &str) -> Result<Option<PricePoint>, MonitorError> {
    let msg: KlineMessage =
        serde_json::from_str(text).map_err(|e| MonitorError::Decode(e.to_string()))?;

    if !msg.kline.is_closed {
        return Ok(None);
    }

    let price = Decimal::from_str(&msg.kline.close)
        .map_err(|e| MonitorError::Decode(format!("close {:?}: {e}", msg.kline.close)))?;

    Ok(Some(PricePoint {
        symbol: msg.symbol.to_uppercase(),
        timestamp: msg.kline.open_time,
        price,
    }))
}

/// Capped exponential backoff between reconnects
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// `initial * 2^attempt`, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Why a stream session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Server closed the socket; reconnect
    Disconnected,
    /// Event receiver is gone; stop for good
    ChannelClosed,
}

/// Detectors of one symbol plus the sender for their completed events
pub struct SymbolMonitor {
    symbol: String,
    detectors: Vec<DropDetector>,
    events: mpsc::Sender<DropEvent>,
    points_seen: u64,
}

impl SymbolMonitor {
    pub fn new(symbol: &str, configs: &[DetectorConfig], events: mpsc::Sender<DropEvent>) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            detectors: configs.iter().copied().map(DropDetector::new).collect(),
            events,
            points_seen: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Feed one point to every detector in config order and forward completed
    /// events. Returns false once the event receiver has been dropped.
    pub async fn handle_point(&mut self, point: PricePoint) -> bool {
        self.points_seen += 1;
        for detector in &mut self.detectors {
            let Some(event) = detector.feed(point.clone()) else {
                continue;
            };
            info!(
                symbol = %event.symbol,
                drop_percent = %event.drop_percent.round_dp(2),
                window_seconds = event.window_seconds,
                before = event.prices_before.len(),
                after = event.prices_after.len(),
                "Rapid drop recorded"
            );
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Stream until the event channel closes, reconnecting with backoff
    pub async fn run(mut self, ws_base: String, policy: ReconnectPolicy) {
        let url = format!(
            "{}/{}@kline_1s",
            ws_base.trim_end_matches('/'),
            self.symbol.to_lowercase()
        );
        let mut attempt = 0u32;

        info!(
            symbol = %self.symbol,
            detectors = self.detectors.len(),
            configs = %self
                .detectors
                .iter()
                .map(|d| d.config().label())
                .collect::<Vec<_>>()
                .join(", "),
            "Starting live monitor"
        );

        loop {
            let seen_before = self.points_seen;
            match self.stream_session(&url).await {
                Ok(SessionEnd::ChannelClosed) => {
                    info!(symbol = %self.symbol, "Event channel closed, stopping monitor");
                    return;
                }
                Ok(SessionEnd::Disconnected) => {
                    warn!(symbol = %self.symbol, "WebSocket closed by server");
                }
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "WebSocket stream error");
                }
            }

            if self.points_seen > seen_before {
                attempt = 0;
            }
            let delay = policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(symbol = %self.symbol, delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_session(&mut self, url: &str) -> Result<SessionEnd, MonitorError> {
        info!(symbol = %self.symbol, url, "Connecting to kline stream");
        let (mut ws, _) = connect_async(url).await?;
        info!(symbol = %self.symbol, "Connected");

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => match parse_kline_message(&text) {
                    Ok(Some(point)) => {
                        if !self.handle_point(point).await {
                            return Ok(SessionEnd::ChannelClosed);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(symbol = %self.symbol, error = %e, "Skipping message"),
                },
                Message::Close(frame) => {
                    debug!(symbol = %self.symbol, ?frame, "Close frame received");
                    return Ok(SessionEnd::Disconnected);
                }
                _ => {}
            }
        }

        Ok(SessionEnd::Disconnected)
    }
}

/// Store events from `rx` until every sender is dropped. Returns the number
/// stored. A failed insert is logged and the next event is processed.
pub async fn persist_live_events(pool: SqlitePool, mut rx: mpsc::Receiver<DropEvent>) -> usize {
    let repo = LiveEventRepository::new(&pool);
    let mut stored = 0;

    while let Some(event) = rx.recv().await {
        let record = event_to_record(&event);
        match repo.save_event(&record).await {
            Ok(id) => {
                stored += 1;
                info!(
                    id,
                    event = %event.id,
                    points = record.points.len(),
                    "Live event persisted"
                );
            }
            Err(e) => warn!(event = %event.id, error = %e, "Failed to persist live event"),
        }
    }

    stored
}

/// Run one monitor per symbol and, when a pool is given, the persistence
/// task. Returns only if all monitors stop.
pub async fn run_monitor(
    symbols: &[String],
    configs: &[DetectorConfig],
    pool: Option<SqlitePool>,
    ws_base: &str,
    policy: ReconnectPolicy,
) {
    let (tx, mut rx) = mpsc::channel::<DropEvent>(EVENT_CHANNEL_CAPACITY);

    let sink = match pool {
        Some(pool) => tokio::spawn(persist_live_events(pool, rx)),
        None => tokio::spawn(async move {
            let mut seen = 0;
            while rx.recv().await.is_some() {
                seen += 1;
            }
            seen
        }),
    };

    let mut monitors = JoinSet::new();
    for symbol in symbols {
        let monitor = SymbolMonitor::new(symbol, configs, tx.clone());
        monitors.spawn(monitor.run(ws_base.to_string(), policy));
    }
    drop(tx);

    while let Some(joined) = monitors.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Monitor task failed");
        }
    }

    match sink.await {
        Ok(count) => info!(events = count, "Live monitor stopped"),
        Err(e) => error!(error = %e, "Event sink task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::Database;
    use rust_decimal_macros::dec;

    fn message(t: i64, close: &str, closed: bool) -> String {
        serde_json::json!({
            "e": "kline", "E": t + 1001, "s": "BTCUSDT",
            "k": { "t": t, "T": t + 999, "s": "BTCUSDT", "i": "1s",
                   "o": close, "c": close, "h": close, "l": close, "v": "1.0", "x": closed }
        })
        .to_string()
    }

    fn point(seconds: i64, price: Decimal) -> PricePoint {
        PricePoint {
            symbol: "BTCUSDT".to_string(),
            timestamp: seconds * 1000,
            price,
        }
    }

    #[test]
    fn test_closed_kline_becomes_point() {
        let p = parse_kline_message(&message(1_709_251_200_000, "67310.25", true))
            .unwrap()
            .unwrap();
        assert_eq!(p.symbol, "BTCUSDT");
        assert_eq!(p.timestamp, 1_709_251_200_000);
        assert_eq!(p.price, dec!(67310.25));
    }

    #[test]
    fn test_open_kline_is_ignored() {
        assert_eq!(parse_kline_message(&message(0, "1", false)).unwrap(), None);
    }

    #[test]
    fn test_malformed_message_is_decode_error() {
        assert!(matches!(
            parse_kline_message(r#"{"result":null,"id":1}"#),
            Err(MonitorError::Decode(_))
        ));
        assert!(matches!(
            parse_kline_message(&message(0, "abc", true)),
            Err(MonitorError::Decode(_))
        ));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_events_flow_to_channel_in_config_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let configs = [
            DetectorConfig {
                window_seconds: 60,
                drop_percent: dec!(2),
                record_after_seconds: 5,
                cooldown_seconds: 300,
            },
            DetectorConfig {
                window_seconds: 30,
                drop_percent: dec!(1),
                record_after_seconds: 5,
                cooldown_seconds: 300,
            },
        ];
        let mut monitor = SymbolMonitor::new("btcusdt", &configs, tx);

        assert!(monitor.handle_point(point(0, dec!(100))).await);
        assert!(monitor.handle_point(point(1, dec!(97))).await);
        for s in 2..=6 {
            assert!(monitor.handle_point(point(s, dec!(97))).await);
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.window_seconds, 60);
        assert_eq!(second.window_seconds, 30);
        assert_eq!(first.prices_after.len(), 5);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_monitor() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let config = DetectorConfig {
            record_after_seconds: 1,
            ..Default::default()
        };
        let mut monitor = SymbolMonitor::new("ETHUSDT", &[config], tx);

        assert!(monitor.handle_point(point(0, dec!(100))).await);
        assert!(monitor.handle_point(point(1, dec!(90))).await);
        assert!(!monitor.handle_point(point(2, dec!(90))).await);
    }

    #[tokio::test]
    async fn test_live_events_are_persisted() {
        let db = Database::in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let sink = tokio::spawn(persist_live_events(db.pool_clone(), rx));

        let config = DetectorConfig {
            record_after_seconds: 2,
            ..Default::default()
        };
        let mut monitor = SymbolMonitor::new("SOLUSDT", &[config], tx);
        for (s, price) in [(0, dec!(150)), (1, dec!(145)), (2, dec!(144)), (3, dec!(146))] {
            let mut p = point(s, price);
            p.symbol = "SOLUSDT".to_string();
            monitor.handle_point(p).await;
        }
        drop(monitor);

        assert_eq!(sink.await.unwrap(), 1);
        let stored = LiveEventRepository::new(db.pool())
            .recent_events("SOLUSDT", 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].trigger_price, "145");
        assert_eq!(stored[0].lowest_price, "144");
    }
}
