use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One OHLCV candle from the market data source.
///
/// Provisional candles (`is_final == false`) may be revised until the
/// interval closes; only final candles enter a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close time in epoch milliseconds.
    pub close_time: i64,
    pub is_final: bool,
}

impl Candle {
    /// Prices strictly positive, volume non-negative, everything finite.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

/// A tradable pair and the two assets it is quoted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Asset being bought and sold, e.g. "BTC".
    pub base: String,
    /// Asset prices are quoted in, e.g. "USDT".
    pub quote: String,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            base: base.into(),
            quote: quote.into(),
        }
    }
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A market order to be submitted to the execution venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub quantity: f64,
}

impl Order {
    pub fn market(pair: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.into(),
            side,
            quantity,
        }
    }
}

/// Confirmation of a filled order returned by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub filled_quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_side(self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// The single open position of a run, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: f64,
}

impl Position {
    /// Profit realized by closing the whole position at `exit_price`.
    pub fn realized_profit(&self, exit_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

/// Immutable ledger entry for one executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// `price * quantity` in quote currency.
    pub notional: f64,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    /// Present only on closing transactions.
    pub profit: Option<f64>,
    pub is_closing: bool,
    /// Candle index (backtest) or candle close-time (live) that produced it.
    pub cursor: i64,
    /// 0 for a plain open or a closing leg, 1 for the opening leg of a flip.
    pub leg: u8,
}

/// Identity of a run; checkpoints and ledger entries are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunKey {
    Backtest {
        pair: String,
        interval: String,
        year: i32,
        month: u32,
    },
    Live {
        bot_id: String,
        pair: String,
        interval: String,
    },
}

impl RunKey {
    pub fn id(&self) -> String {
        match self {
            RunKey::Backtest {
                pair,
                interval,
                year,
                month,
            } => format!("backtest:{pair}:{interval}:{year:04}-{month:02}"),
            RunKey::Live { bot_id, .. } => format!("live:{bot_id}"),
        }
    }

    pub fn pair(&self) -> &str {
        match self {
            RunKey::Backtest { pair, .. } | RunKey::Live { pair, .. } => pair,
        }
    }

    pub fn interval(&self) -> &str {
        match self {
            RunKey::Backtest { interval, .. } | RunKey::Live { interval, .. } => interval,
        }
    }

    /// Calendar period of a backtest run; `None` for live runs.
    pub fn period(&self) -> Option<(i32, u32)> {
        match self {
            RunKey::Backtest { year, month, .. } => Some((*year, *month)),
            RunKey::Live { .. } => None,
        }
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}

/// Persisted resume point for a run. Upserted in place on each write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: RunKey,
    /// Last processed index (backtest) or close-time (live); -1 when nothing
    /// has been processed yet.
    pub cursor: i64,
    pub balance_base: f64,
    pub balance_quote: f64,
    pub position: Option<Position>,
    /// Rolling window snapshot. Always empty for backtests.
    pub window: Vec<Candle>,
    pub completed: bool,
    pub report: Option<RunReport>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of scoring a run's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    /// Percentage in [0, 100]; 0 when there were no trades.
    pub win_rate: f64,
    /// Net profit/loss in quote currency.
    pub total_profit: f64,
    pub initial_base_balance: f64,
    pub final_base_balance: f64,
}

/// Which venue the bot trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Whether the run replays a historical month or follows the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Backtest,
    Live,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Backtest => write!(f, "backtest"),
            RunMode::Live => write!(f, "live"),
        }
    }
}

/// Current state of the trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Epoch-millisecond bounds of a calendar month in UTC: first day
/// 00:00:00.000 through last day 23:59:59.000.
pub fn month_range(year: i32, month: u32) -> Result<(i64, i64)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::Config(format!("invalid backtest period {year}-{month:02}")))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| Error::Config(format!("invalid backtest period {year}-{month:02}")))?;
    let last = next.pred_opt().unwrap_or(first);

    let start = first
        .and_hms_opt(0, 0, 0)
        .map(|t| Utc.from_utc_datetime(&t).timestamp_millis());
    let end = last
        .and_hms_opt(23, 59, 59)
        .map(|t| Utc.from_utc_datetime(&t).timestamp_millis());

    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(Error::Config(format!("invalid backtest period {year}-{month:02}"))),
    }
}

/// Convert an epoch-millisecond timestamp to a UTC datetime.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
