use common::{Error, Result};

/// MACD (Moving Average Convergence/Divergence) indicator.
///
/// MACD line = EMA(fast) − EMA(slow), signal = EMA(macd_line, signal_period),
/// histogram = MACD − signal. Every EMA is seeded with the SMA of its first
/// `period` inputs.
#[derive(Debug, Clone)]
pub struct MacdIndicator {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

/// One MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl MacdIndicator {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        if fast == 0 || signal == 0 {
            return Err(Error::InvalidPeriod("MACD periods must be non-zero".into()));
        }
        if fast >= slow {
            return Err(Error::InvalidPeriod(format!(
                "MACD fast period ({fast}) must be less than slow period ({slow})"
            )));
        }
        Ok(Self { fast, slow, signal })
    }

    /// Minimum number of closes needed for one point with a defined signal.
    pub fn required_len(&self) -> usize {
        self.slow + self.signal - 1
    }

    /// Compute MACD points from close prices (oldest first).
    ///
    /// One point per close where the signal line is defined; output length is
    /// `closes.len() - slow - signal + 2`.
    pub fn compute(&self, closes: &[f64]) -> Result<Vec<MacdPoint>> {
        if closes.len() < self.required_len() {
            return Err(Error::InsufficientData {
                required: self.required_len(),
                actual: closes.len(),
            });
        }

        let fast = ema_series(closes, self.fast);
        let slow = ema_series(closes, self.slow);

        // fast[j] belongs to close index j + fast - 1; align both on slow's start
        let offset = self.slow - self.fast;
        let macd_line: Vec<f64> = slow
            .iter()
            .enumerate()
            .map(|(j, s)| fast[j + offset] - s)
            .collect();

        let signal_line = ema_series(&macd_line, self.signal);
        let lead = self.signal - 1;

        Ok(signal_line
            .iter()
            .enumerate()
            .map(|(j, &signal)| {
                let macd = macd_line[j + lead];
                MacdPoint {
                    macd,
                    signal,
                    histogram: macd - signal,
                }
            })
            .collect())
    }

    /// The MACD reading of the most recent close.
    pub fn latest(&self, closes: &[f64]) -> Result<MacdPoint> {
        let series = self.compute(closes)?;
        series.last().copied().ok_or(Error::InsufficientData {
            required: self.required_len(),
            actual: closes.len(),
        })
    }
}

/// EMA series of `data`, one value per index from `period - 1` onward.
/// Empty when `data` is shorter than `period`.
fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);

    let mut ema_val = data[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(data.len() - period + 1);
    out.push(ema_val);

    for &price in &data[period..] {
        ema_val = price * k + ema_val * (1.0 - k);
        out.push(ema_val);
    }
    out
}
