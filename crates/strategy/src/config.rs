use serde::{Deserialize, Serialize};

use common::{Error, Instrument, Result, RunKey};

/// Strategy config file (TOML). Every section has defaults.
///
/// Example `config/strategy.toml`:
/// ```toml
/// [instrument]
/// symbol = "BTCUSDT"
/// base = "BTC"
/// quote = "USDT"
/// interval = "5m"
///
/// [indicators]
/// rsi_period = 14
/// macd_fast = 12
/// macd_slow = 26
/// macd_signal = 9
///
/// [backtest]
/// year = 2024
/// month = 8
/// initial_base = 0.0104
/// initial_quote = 500.0
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyFileConfig {
    pub instrument: InstrumentConfig,
    pub indicators: IndicatorConfig,
    pub sizing: SizingConfig,
    pub scoring: ScoringConfig,
    pub backtest: BacktestConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Trading pair, e.g. "BTCUSDT".
    pub symbol: String,
    pub base: String,
    pub quote: String,
    /// Candle interval in exchange notation, e.g. "5m".
    pub interval: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            interval: "5m".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
        }
    }
}

impl IndicatorConfig {
    /// Closes needed before RSI and MACD both produce a value.
    pub fn lookback(&self) -> usize {
        (self.rsi_period + 1).max(self.macd_slow + self.macd_signal - 1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Share of the available balance committed when opening a position.
    pub fraction: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self { fraction: 0.9 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Fee charged on each side of a round-trip, e.g. 0.001 = 0.1%.
    pub fee_rate: f64,
    /// Multiplier applied to winning round-trips.
    pub reward_risk: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            reward_risk: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub year: i32,
    pub month: u32,
    /// First candle index evaluated on a fresh start.
    pub warmup: usize,
    /// Checkpoint every this many indices.
    pub checkpoint_every: usize,
    pub initial_base: f64,
    pub initial_quote: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            year: 2024,
            month: 8,
            warmup: 50,
            checkpoint_every: 100,
            initial_base: 0.0104,
            initial_quote: 500.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LiveConfig {
    pub bot_id: String,
    /// Number of final candles kept in the rolling window.
    pub window_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            bot_id: "main".into(),
            window_capacity: 100,
        }
    }
}

impl StrategyFileConfig {
    /// Load from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read strategy config at '{path}': {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse strategy config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let ind = &self.indicators;
        if ind.rsi_period < 2 || ind.macd_fast == 0 || ind.macd_signal == 0 {
            return Err(Error::Config("indicator periods must be positive (rsi_period >= 2)".into()));
        }
        if ind.macd_fast >= ind.macd_slow {
            return Err(Error::Config("indicators.macd_fast must be less than macd_slow".into()));
        }

        let lookback = ind.lookback();
        if self.backtest.warmup < lookback {
            return Err(Error::Config(format!(
                "backtest.warmup ({}) must cover the indicator lookback ({lookback})",
                self.backtest.warmup
            )));
        }
        if self.backtest.checkpoint_every == 0 {
            return Err(Error::Config("backtest.checkpoint_every must be > 0".into()));
        }
        if !(self.sizing.fraction > 0.0 && self.sizing.fraction <= 1.0) {
            return Err(Error::Config("sizing.fraction must be in (0, 1]".into()));
        }
        if self.live.window_capacity < lookback {
            return Err(Error::Config(format!(
                "live.window_capacity ({}) must cover the indicator lookback ({lookback})",
                self.live.window_capacity
            )));
        }
        if self.backtest.initial_base < 0.0 || self.backtest.initial_quote < 0.0 {
            return Err(Error::Config("backtest balances must be non-negative".into()));
        }
        Ok(())
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(
            &self.instrument.symbol,
            &self.instrument.base,
            &self.instrument.quote,
        )
    }

    pub fn backtest_key(&self) -> RunKey {
        RunKey::Backtest {
            pair: self.instrument.symbol.clone(),
            interval: self.instrument.interval.clone(),
            year: self.backtest.year,
            month: self.backtest.month,
        }
    }

    pub fn live_key(&self) -> RunKey {
        RunKey::Live {
            bot_id: self.live.bot_id.clone(),
            pair: self.instrument.symbol.clone(),
            interval: self.instrument.interval.clone(),
        }
    }
}
