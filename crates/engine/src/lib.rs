pub mod binance;
pub mod executor;
pub mod lifecycle;
pub mod position;
pub mod runner;
pub mod window;

pub use binance::{BinanceClient, BinanceMarketData};
pub use executor::OrderExecutor;
pub use lifecycle::{Engine, EngineHandle, RunOutcome};
pub use position::{PositionStateMachine, Tick, TransitionOutcome};
pub use runner::{BacktestOutcome, RunContext};
pub use window::RollingWindow;
