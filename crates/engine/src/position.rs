use chrono::{DateTime, Utc};
use tracing::{info, warn};

use common::{Error, Fill, OrderSide, Position, PositionSide, Result, Transaction};
use strategy::Decision;

use crate::executor::OrderExecutor;

/// Market context a transition executes in.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Close of the candle the decision was made at.
    pub price: f64,
    pub time: DateTime<Utc>,
    /// Candle index (backtest) or close-time (live).
    pub cursor: i64,
}

/// Ledger entries produced by one transition, in execution order, plus the
/// error that cut it short, if any.
#[derive(Debug, Default)]
pub struct TransitionOutcome {
    pub transactions: Vec<Transaction>,
    pub skipped: Option<Error>,
}

impl TransitionOutcome {
    fn skipped(err: Error) -> Self {
        Self {
            transactions: Vec::new(),
            skipped: Some(err),
        }
    }
}

/// FLAT / LONG / SHORT lifecycle of the run's single position.
///
/// A reversal signal while holding is a flip: the close leg executes first
/// and the opposite position opens in the same tick. Venue failures never
/// propagate; they come back in `TransitionOutcome::skipped` with the
/// position left as it was before the failed leg.
#[derive(Debug, Default)]
pub struct PositionStateMachine {
    position: Option<Position>,
}

impl PositionStateMachine {
    pub fn new(position: Option<Position>) -> Self {
        Self { position }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn side(&self) -> Option<PositionSide> {
        self.position.as_ref().map(|p| p.side)
    }

    pub async fn apply(
        &mut self,
        decision: Decision,
        tick: &Tick,
        executor: &OrderExecutor,
    ) -> TransitionOutcome {
        let target = match decision {
            Decision::Long => PositionSide::Long,
            Decision::Short => PositionSide::Short,
            Decision::Hold => return TransitionOutcome::default(),
        };

        let mut transactions = Vec::new();
        let mut open_leg = 0;

        if let Some(current) = self.position.clone() {
            if current.side == target {
                return TransitionOutcome::default();
            }
            match self.close(&current, tick, executor).await {
                Ok(tx) => transactions.push(tx),
                Err(e) => return TransitionOutcome::skipped(e),
            }
            open_leg = 1;
        }

        match self.open(target, tick, open_leg, executor).await {
            Ok(tx) => transactions.push(tx),
            Err(e) => {
                return TransitionOutcome {
                    transactions,
                    skipped: Some(e),
                }
            }
        }

        TransitionOutcome {
            transactions,
            skipped: None,
        }
    }

    async fn close(
        &mut self,
        position: &Position,
        tick: &Tick,
        executor: &OrderExecutor,
    ) -> Result<Transaction> {
        let side = position.side.exit_side();
        let fill = executor.market(side, position.quantity).await?;
        let profit = position.realized_profit(tick.price);
        self.position = None;

        info!(
            side = %position.side,
            entry = position.entry_price,
            exit = tick.price,
            profit = profit,
            "Position closed"
        );
        Ok(record(side, position.quantity, &fill, tick, Some(profit), 0))
    }

    async fn open(
        &mut self,
        side: PositionSide,
        tick: &Tick,
        leg: u8,
        executor: &OrderExecutor,
    ) -> Result<Transaction> {
        let requested = match side {
            PositionSide::Long => executor.long_quantity(tick.price).await?,
            PositionSide::Short => executor.short_quantity().await?,
        };
        let fill = executor.market(side.entry_side(), requested).await?;
        let quantity = if fill.filled_quantity > 0.0 {
            fill.filled_quantity
        } else {
            warn!(order_id = %fill.order_id, "Venue reported zero fill, using requested quantity");
            requested
        };

        self.position = Some(Position {
            side,
            entry_price: tick.price,
            entry_time: tick.time,
            quantity,
        });
        info!(side = %side, price = tick.price, qty = quantity, "Position opened");
        Ok(record(side.entry_side(), quantity, &fill, tick, None, leg))
    }
}

fn record(
    side: OrderSide,
    quantity: f64,
    fill: &Fill,
    tick: &Tick,
    profit: Option<f64>,
    leg: u8,
) -> Transaction {
    Transaction {
        side,
        price: tick.price,
        quantity,
        notional: tick.price * quantity,
        order_id: fill.order_id.clone(),
        timestamp: tick.time,
        is_closing: profit.is_some(),
        profit,
        cursor: tick.cursor,
        leg,
    }
}
