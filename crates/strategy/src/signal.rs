use serde::{Deserialize, Serialize};

use common::Result;

use crate::config::IndicatorConfig;
use crate::indicators::{MacdIndicator, MacdPoint, RsiIndicator};

pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;

/// Absolute score at which a position is opened or flipped.
pub const ENTRY_THRESHOLD: i32 = 2;

/// Reduce the latest RSI and MACD readings to a trend score in [-2, 2].
///
/// RSI votes +1 below 30, -1 above 70 and abstains in between. MACD always
/// votes: +1 when the line is above its signal, -1 otherwise.
pub fn trend_score(rsi: f64, macd: f64, signal: f64) -> i32 {
    let mut score = 0;

    if rsi < RSI_OVERSOLD {
        score += 1;
    } else if rsi > RSI_OVERBOUGHT {
        score -= 1;
    }

    if macd > signal {
        score += 1;
    } else {
        score -= 1;
    }

    score
}

/// Action implied by a trend score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Long,
    Short,
    Hold,
}

impl Decision {
    pub fn from_score(score: i32) -> Self {
        if score >= ENTRY_THRESHOLD {
            Decision::Long
        } else if score <= -ENTRY_THRESHOLD {
            Decision::Short
        } else {
            Decision::Hold
        }
    }
}

/// Indicator readings and the decision derived from them for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub rsi: f64,
    pub macd: MacdPoint,
    pub score: i32,
    pub decision: Decision,
}

/// RSI + MACD pair configured for one run.
#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    rsi: RsiIndicator,
    macd: MacdIndicator,
}

impl TrendAnalyzer {
    pub fn new(cfg: &IndicatorConfig) -> Result<Self> {
        Ok(Self {
            rsi: RsiIndicator::new(cfg.rsi_period)?,
            macd: MacdIndicator::new(cfg.macd_fast, cfg.macd_slow, cfg.macd_signal)?,
        })
    }

    /// Closes required before both indicators produce a value.
    pub fn lookback(&self) -> usize {
        self.rsi.required_len().max(self.macd.required_len())
    }

    /// Evaluate the latest close of `closes`. Fails with
    /// `Error::InsufficientData` while either indicator is still warming up.
    pub fn evaluate(&self, closes: &[f64]) -> Result<Evaluation> {
        let rsi = self.rsi.latest(closes)?;
        let macd = self.macd.latest(closes)?;
        let score = trend_score(rsi, macd.macd, macd.signal);
        Ok(Evaluation {
            rsi,
            macd,
            score,
            decision: Decision::from_score(score),
        })
    }
}
