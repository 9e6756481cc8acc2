mod rest;
mod stream;

pub use rest::{BinanceClient, BinanceMarketData, PAGE_SIZE};
pub use stream::BinanceStream;
