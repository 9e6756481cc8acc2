use common::{Error, Result};

/// RSI (Relative Strength Index) indicator.
///
/// Uses Wilder's smoothed moving average (same as TradingView / standard RSI).
/// Produces one value per close from index `period` onward.
#[derive(Debug, Clone)]
pub struct RsiIndicator {
    pub period: usize,
}

impl RsiIndicator {
    pub fn new(period: usize) -> Result<Self> {
        if period < 2 {
            return Err(Error::InvalidPeriod(format!("RSI period must be >= 2, got {period}")));
        }
        Ok(Self { period })
    }

    /// Minimum number of closes needed for one RSI value.
    pub fn required_len(&self) -> usize {
        self.period + 1
    }

    /// Compute the RSI series from close prices (oldest first).
    ///
    /// Output length is `closes.len() - period`.
    pub fn compute(&self, closes: &[f64]) -> Result<Vec<f64>> {
        if closes.len() < self.required_len() {
            return Err(Error::InsufficientData {
                required: self.required_len(),
                actual: closes.len(),
            });
        }

        let period = self.period as f64;
        let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
        let initial = &changes[..self.period];

        // First average gain/loss is the plain mean of the first `period` changes
        let mut avg_gain = initial.iter().filter(|&&c| c > 0.0).sum::<f64>() / period;
        let mut avg_loss = initial.iter().filter(|&&c| c < 0.0).map(|c| c.abs()).sum::<f64>() / period;

        let mut out = Vec::with_capacity(closes.len() - self.period);
        out.push(rsi_value(avg_gain, avg_loss));

        // Wilder smoothing over remaining changes
        for &change in &changes[self.period..] {
            let gain = if change > 0.0 { change } else { 0.0 };
            let loss = if change < 0.0 { change.abs() } else { 0.0 };
            avg_gain = (avg_gain * (period - 1.0) + gain) / period;
            avg_loss = (avg_loss * (period - 1.0) + loss) / period;
            out.push(rsi_value(avg_gain, avg_loss));
        }

        Ok(out)
    }

    /// The RSI of the most recent close.
    pub fn latest(&self, closes: &[f64]) -> Result<f64> {
        let series = self.compute(closes)?;
        series.last().copied().ok_or(Error::InsufficientData {
            required: self.required_len(),
            actual: closes.len(),
        })
    }
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
