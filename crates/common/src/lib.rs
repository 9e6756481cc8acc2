pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use config::{venue_mode, Config};
pub use error::{Error, Result};
pub use exchange::{ExchangeClient, MarketDataSource};
pub use types::*;
