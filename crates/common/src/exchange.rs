use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Candle, Fill, Order, Result};

/// Abstraction over the execution venue.
///
/// `BinanceClient` implements this for live trading.
/// `PaperClient` implements this for backtests and paper trading.
///
/// Only `OrderExecutor` in `crates/engine` should hold a reference to a
/// `dyn ExchangeClient`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Available (free) quantity of an asset.
    async fn balance(&self, asset: &str) -> Result<f64>;

    /// Submit a market order and return the fill confirmation.
    async fn place_market_order(&self, order: &Order) -> Result<Fill>;

    /// Latest close seen by the run loop. Simulated venues fill at this price.
    async fn observe_price(&self, _pair: &str, _price: f64) {}

    /// Overwrite a balance from a restored checkpoint. Real venues own their
    /// balances and ignore this.
    async fn sync_balance(&self, _asset: &str, _amount: f64) {}
}

/// Abstraction over the market data feed.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Ordered candles closing within `[start_ms, end_ms]`, paged internally.
    async fn fetch_history(
        &self,
        pair: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>>;

    /// The most recent `limit` final candles, oldest first.
    async fn recent(&self, pair: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Stream of candle updates, provisional and final. Consumers filter on
    /// `Candle::is_final`.
    async fn subscribe(&self, pair: &str, interval: &str) -> Result<mpsc::Receiver<Candle>>;
}
