use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info};

use common::{Candle, Error, ExchangeClient, Fill, MarketDataSource, Order, Result};

use super::stream::BinanceStream;

const BASE_URL: &str = "https://api.binance.com";

/// Largest page the klines endpoint returns.
pub const PAGE_SIZE: usize = 1000;

/// Buffered live candles per subscription. The stream task waits when full.
const STREAM_BUFFER: usize = 256;

fn http_client() -> Result<Client> {
    Client::builder()
        .use_rustls_tls()
        .build()
        .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Signed REST client for Binance spot. Used for balances and market orders.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    http: Client,
}

impl BinanceClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            secret: secret.into(),
            http: http_client()?,
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Exchange(format!("invalid API secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = now_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<String> {
        let url = format!("{BASE_URL}{path}?{}", self.signed_query(params)?);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<String> {
        let body = self.signed_query(params)?;
        let url = format!("{BASE_URL}{path}");

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn balance(&self, asset: &str) -> Result<f64> {
        let body = self.signed_get("/api/v3/account", "").await?;
        let account: AccountResponse = serde_json::from_str(&body)?;

        let entry = account
            .balances
            .into_iter()
            .find(|b| b.asset == asset)
            .ok_or_else(|| Error::BalanceUnavailable(format!("asset {asset} not in account")))?;

        entry
            .free
            .parse::<f64>()
            .map_err(|e| Error::BalanceUnavailable(format!("{asset} free balance: {e}")))
    }

    async fn place_market_order(&self, order: &Order) -> Result<Fill> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={:.6}&newClientOrderId={}",
            order.pair, order.side, order.quantity, order.id
        );

        debug!(pair = %order.pair, side = %order.side, qty = order.quantity, "Submitting order to Binance");
        let body = self.signed_post("/api/v3/order", &params).await?;
        let resp: OrderResponse = serde_json::from_str(&body)?;

        let filled_quantity = resp.executed_qty.parse::<f64>().unwrap_or(0.0);
        info!(pair = %order.pair, order_id = resp.order_id, filled = filled_quantity, "Binance order filled");

        Ok(Fill {
            order_id: resp.order_id.to_string(),
            pair: order.pair.clone(),
            side: order.side,
            filled_quantity,
            timestamp: Utc::now(),
        })
    }
}

/// Public kline endpoints plus the WebSocket stream, as a candle source.
pub struct BinanceMarketData {
    http: Client,
}

impl BinanceMarketData {
    pub fn new() -> Result<Self> {
        Ok(Self { http: http_client()? })
    }

    async fn klines(&self, query: &str) -> Result<Vec<Candle>> {
        let url = format!("{BASE_URL}/api/v3/klines?{query}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        parse_klines(&body, now_ms())
    }
}

#[async_trait]
impl MarketDataSource for BinanceMarketData {
    async fn fetch_history(
        &self,
        pair: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let mut candles: Vec<Candle> = Vec::new();
        let mut start = start_ms;

        while start <= end_ms {
            let query = format!(
                "symbol={pair}&interval={interval}&startTime={start}&endTime={end_ms}&limit={PAGE_SIZE}"
            );
            let page = self.klines(&query).await?;
            let Some(last) = page.last() else { break };
            start = last.close_time + 1;

            debug!(pair, interval, fetched = page.len(), next_start = start, "Fetched kline page");
            candles.extend(page);
        }

        if candles.is_empty() {
            return Err(Error::DataGap {
                pair: pair.to_string(),
                start_ms,
                end_ms,
            });
        }
        info!(pair, interval, candles = candles.len(), "History fetched");
        Ok(candles)
    }

    async fn recent(&self, pair: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        // One extra row for the still-open candle, which is dropped.
        let limit = (limit + 1).min(PAGE_SIZE);
        let query = format!("symbol={pair}&interval={interval}&limit={limit}");
        let candles = self.klines(&query).await?;
        Ok(candles.into_iter().filter(|c| c.is_final).collect())
    }

    async fn subscribe(&self, pair: &str, interval: &str) -> Result<mpsc::Receiver<Candle>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stream = BinanceStream::new(pair, interval, tx);
        tokio::spawn(stream.run());
        Ok(rx)
    }
}

/// Decode a klines response. Rows are positional arrays:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_klines(body: &str, now_ms: i64) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    rows.iter().map(|row| parse_kline_row(row, now_ms)).collect()
}

fn parse_kline_row(row: &[Value], now_ms: i64) -> Result<Candle> {
    let number = |idx: usize| -> Result<f64> {
        row.get(idx)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| Error::Exchange(format!("kline field {idx} missing or not numeric")))
    };
    let close_time = row
        .get(6)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Exchange("kline close time missing".into()))?;

    Ok(Candle {
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
        close_time,
        is_final: close_time < now_ms,
    })
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    executed_qty: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Deserialize)]
struct Balance {
    asset: String,
    free: String,
}
