use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{Error, ExchangeClient, Fill, Instrument, Order, OrderSide, Result};

/// Simulated execution venue for backtests and paper trading.
///
/// Fills are simulated at the latest observed price with configurable
/// slippage, and settle immediately against in-memory asset balances.
/// No real orders are ever sent to Binance.
pub struct PaperClient {
    instrument: Instrument,
    /// Free balance per asset.
    balances: Arc<RwLock<HashMap<String, f64>>>,
    /// Latest known price per pair, updated via `observe_price`.
    prices: Arc<RwLock<HashMap<String, f64>>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
}

impl PaperClient {
    pub fn new(instrument: Instrument, base: f64, quote: f64, slippage_bps: f64) -> Self {
        info!(
            pair = %instrument.symbol,
            base = base,
            quote = quote,
            slippage_bps = slippage_bps,
            "PaperClient initialized"
        );
        let balances = HashMap::from([
            (instrument.base.clone(), base),
            (instrument.quote.clone(), quote),
        ]);
        Self {
            instrument,
            balances: Arc::new(RwLock::new(balances)),
            prices: Arc::new(RwLock::new(HashMap::new())),
            slippage_bps,
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn balance(&self, asset: &str) -> Result<f64> {
        self.balances
            .read()
            .await
            .get(asset)
            .copied()
            .ok_or_else(|| Error::BalanceUnavailable(format!("no paper balance for {asset}")))
    }

    async fn place_market_order(&self, order: &Order) -> Result<Fill> {
        if order.pair != self.instrument.symbol {
            return Err(Error::OrderRejected(format!(
                "PaperClient trades {} only, got order for {}",
                self.instrument.symbol, order.pair
            )));
        }
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(Error::OrderRejected(format!("invalid quantity {}", order.quantity)));
        }

        let mid_price = self.prices.read().await.get(&order.pair).copied().ok_or_else(|| {
            Error::OrderRejected(format!(
                "PaperClient has no price for pair '{}'. Ensure candles are flowing.",
                order.pair
            ))
        })?;

        // Apply slippage: buys pay more, sells receive less
        let fill_price = match order.side {
            OrderSide::Buy => mid_price * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => mid_price * (1.0 - self.slippage_bps / 10_000.0),
        };
        let notional = fill_price * order.quantity;

        let mut balances = self.balances.write().await;
        let base = balances.get(&self.instrument.base).copied().unwrap_or(0.0);
        let quote = balances.get(&self.instrument.quote).copied().unwrap_or(0.0);

        let (new_base, new_quote) = match order.side {
            OrderSide::Buy => {
                if notional > quote {
                    return Err(Error::OrderRejected(format!(
                        "insufficient {}: need {notional:.8}, have {quote:.8}",
                        self.instrument.quote
                    )));
                }
                (base + order.quantity, quote - notional)
            }
            OrderSide::Sell => {
                if order.quantity > base {
                    return Err(Error::OrderRejected(format!(
                        "insufficient {}: need {:.8}, have {base:.8}",
                        self.instrument.base, order.quantity
                    )));
                }
                (base - order.quantity, quote + notional)
            }
        };
        balances.insert(self.instrument.base.clone(), new_base);
        balances.insert(self.instrument.quote.clone(), new_quote);

        debug!(
            pair = %order.pair,
            side = ?order.side,
            mid = mid_price,
            fill = fill_price,
            qty = order.quantity,
            "Paper fill simulated"
        );

        Ok(Fill {
            order_id: order.id.clone(),
            pair: order.pair.clone(),
            side: order.side,
            filled_quantity: order.quantity,
            timestamp: Utc::now(),
        })
    }

    async fn observe_price(&self, pair: &str, price: f64) {
        self.prices.write().await.insert(pair.to_string(), price);
    }

    async fn sync_balance(&self, asset: &str, amount: f64) {
        self.balances.write().await.insert(asset.to_string(), amount);
    }
}
