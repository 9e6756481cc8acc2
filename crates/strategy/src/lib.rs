pub mod config;
pub mod indicators;
pub mod scorer;
pub mod signal;

pub use config::{
    BacktestConfig, IndicatorConfig, InstrumentConfig, LiveConfig, ScoringConfig, SizingConfig,
    StrategyFileConfig,
};
pub use scorer::score;
pub use signal::{trend_score, Decision, Evaluation, TrendAnalyzer};
