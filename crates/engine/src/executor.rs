use std::sync::Arc;

use tracing::{error, info};

use common::{Error, ExchangeClient, Fill, Instrument, Order, OrderSide, Result};

/// Quantity step accepted by the venue.
const QTY_DECIMALS: f64 = 1_000_000.0;

/// Round a quantity down to the venue's 6-decimal step.
pub fn floor_quantity(qty: f64) -> f64 {
    ((qty * QTY_DECIMALS) + 1e-9).floor() / QTY_DECIMALS
}

/// Sizes and submits market orders for one instrument.
///
/// This is the ONLY component that calls `ExchangeClient::place_market_order`.
/// Balances are queried from the venue at transition time, never cached.
pub struct OrderExecutor {
    client: Arc<dyn ExchangeClient>,
    instrument: Instrument,
    fraction: f64,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, instrument: Instrument, fraction: f64) -> Self {
        Self {
            client,
            instrument,
            fraction,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    async fn available(&self, asset: &str) -> Result<f64> {
        match self.client.balance(asset).await {
            Ok(amount) if amount.is_finite() => Ok(amount),
            Ok(amount) => Err(Error::BalanceUnavailable(format!("{asset} balance is {amount}"))),
            Err(Error::BalanceUnavailable(msg)) => Err(Error::BalanceUnavailable(msg)),
            Err(e) => Err(Error::BalanceUnavailable(format!("{asset}: {e}"))),
        }
    }

    /// Quantity for opening a long at `price`: a fraction of free quote
    /// balance converted to base.
    pub async fn long_quantity(&self, price: f64) -> Result<f64> {
        let quote = self.available(&self.instrument.quote).await?;
        if price.is_nan() || price <= 0.0 {
            return Err(Error::BalanceUnavailable(format!("cannot size at price {price}")));
        }
        non_zero(floor_quantity(quote * self.fraction / price), &self.instrument.quote, quote)
    }

    /// Quantity for opening a short: a fraction of free base balance.
    pub async fn short_quantity(&self) -> Result<f64> {
        let base = self.available(&self.instrument.base).await?;
        non_zero(floor_quantity(base * self.fraction), &self.instrument.base, base)
    }

    /// Submit a market order. Any venue failure surfaces as `OrderRejected`.
    pub async fn market(&self, side: OrderSide, quantity: f64) -> Result<Fill> {
        let order = Order::market(&self.instrument.symbol, side, quantity);
        info!(pair = %order.pair, side = %side, qty = quantity, "Executing order");

        match self.client.place_market_order(&order).await {
            Ok(fill) => {
                info!(pair = %fill.pair, order_id = %fill.order_id, qty = fill.filled_quantity, "Order filled");
                Ok(fill)
            }
            Err(e) => {
                error!(pair = %order.pair, side = %side, error = %e, "Order submission failed");
                match e {
                    Error::OrderRejected(msg) => Err(Error::OrderRejected(msg)),
                    other => Err(Error::OrderRejected(other.to_string())),
                }
            }
        }
    }

    pub async fn observe_price(&self, price: f64) {
        self.client.observe_price(&self.instrument.symbol, price).await;
    }

    /// Current (base, quote) balances, for checkpoints.
    pub async fn balances(&self) -> Result<(f64, f64)> {
        let base = self.available(&self.instrument.base).await?;
        let quote = self.available(&self.instrument.quote).await?;
        Ok((base, quote))
    }

    /// Push checkpointed balances back into the venue.
    pub async fn restore_balances(&self, base: f64, quote: f64) {
        self.client.sync_balance(&self.instrument.base, base).await;
        self.client.sync_balance(&self.instrument.quote, quote).await;
    }
}

fn non_zero(qty: f64, asset: &str, available: f64) -> Result<f64> {
    if qty > 0.0 {
        Ok(qty)
    } else {
        Err(Error::BalanceUnavailable(format!(
            "{asset} balance {available} too small to size an order"
        )))
    }
}
