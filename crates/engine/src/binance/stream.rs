use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use common::{Candle, Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Binance kline WebSocket stream for one pair and interval.
///
/// Parses kline events into `Candle`s, provisional and final, and forwards
/// them on a bounded channel. A full channel makes the stream wait rather
/// than drop candles. Reconnects with exponential backoff and exits once
/// the receiver is gone.
pub struct BinanceStream {
    pair: String,
    interval: String,
    candle_tx: mpsc::Sender<Candle>,
}

impl BinanceStream {
    pub fn new(
        pair: impl Into<String>,
        interval: impl Into<String>,
        candle_tx: mpsc::Sender<Candle>,
    ) -> Self {
        Self {
            pair: pair.into(),
            interval: interval.into(),
            candle_tx,
        }
    }

    /// Run the stream loop until the receiving side is dropped.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);

        while !self.candle_tx.is_closed() {
            info!(pair = %self.pair, interval = %self.interval, "Connecting to Binance WebSocket stream");
            match self.connect_once().await {
                Ok(()) => {
                    if self.candle_tx.is_closed() {
                        break;
                    }
                    info!(pair = %self.pair, "WebSocket stream closed cleanly");
                    // Binance ends sessions after 24h; reconnect promptly.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(pair = %self.pair, error = %e, backoff = ?backoff, "WebSocket error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        debug!(pair = %self.pair, "Candle receiver dropped, stream task exiting");
    }

    fn url(&self) -> Result<Url> {
        let url = format!(
            "wss://stream.binance.com:9443/ws/{}@kline_{}",
            self.pair.to_lowercase(),
            self.interval
        );
        Url::parse(&url).map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn connect_once(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url()?)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (_, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;

            if let Message::Text(text) = msg {
                match parse_kline_event(&text) {
                    Ok(Some(candle)) => {
                        if self.candle_tx.send(candle).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {} // non-kline message
                    Err(e) => warn!(error = %e, "Failed to parse kline event"),
                }
            }
        }

        Ok(())
    }
}

// ─── Binance kline JSON parsing ──────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    k: Option<KlineData>,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
    #[serde(rename = "T")]
    close_time_ms: i64,
}

fn parse_kline_event(text: &str) -> Result<Option<Candle>> {
    let event: KlineEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        // subscription acks and other payloads without an "e" field
        Err(_) => return Ok(None),
    };
    if event.event_type != "kline" {
        return Ok(None);
    }
    let Some(k) = event.k else { return Ok(None) };

    let num = |name: &str, s: &str| -> Result<f64> {
        s.parse::<f64>()
            .map_err(|e| Error::WebSocket(format!("kline {name} '{s}': {e}")))
    };

    Ok(Some(Candle {
        open: num("open", &k.open)?,
        high: num("high", &k.high)?,
        low: num("low", &k.low)?,
        close: num("close", &k.close)?,
        volume: num("volume", &k.volume)?,
        close_time: k.close_time_ms,
        is_final: k.is_closed,
    }))
}
