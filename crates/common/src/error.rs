use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Indicator input shorter than its lookback requires.
    #[error("Insufficient data: need {required} values, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Invalid indicator period: {0}")]
    InvalidPeriod(String),

    #[error("Balance unavailable: {0}")]
    BalanceUnavailable(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The market data source returned nothing for a requested window.
    #[error("No candles for {pair} between {start_ms} and {end_ms}")]
    DataGap {
        pair: String,
        start_ms: i64,
        end_ms: i64,
    },

    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the run loop holds state and moves to the next tick.
    pub fn is_per_tick(&self) -> bool {
        matches!(
            self,
            Error::InsufficientData { .. }
                | Error::BalanceUnavailable(_)
                | Error::OrderRejected(_)
                | Error::Persistence(_)
                | Error::Database(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
