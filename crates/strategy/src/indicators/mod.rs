pub mod macd;
pub mod rsi;

pub use macd::{MacdIndicator, MacdPoint};
pub use rsi::RsiIndicator;
