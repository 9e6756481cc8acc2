use std::collections::VecDeque;

use common::Candle;

/// The most recent final candles, oldest first, bounded by `capacity`.
///
/// Only final candles whose close-time is after the newest held candle are
/// admitted, so the window stays strictly ordered.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuild from a checkpoint snapshot, keeping the newest `capacity`
    /// admissible candles.
    pub fn restore(capacity: usize, snapshot: Vec<Candle>) -> Self {
        let mut window = Self::new(capacity);
        for candle in snapshot {
            window.push(candle);
        }
        window
    }

    /// Admit `candle`, evicting the oldest on overflow. Returns `false` for
    /// provisional or stale candles, which leave the window untouched.
    pub fn push(&mut self, candle: Candle) -> bool {
        if self.capacity == 0 || !candle.is_final {
            return false;
        }
        if let Some(last) = self.candles.back() {
            if candle.close_time <= last.close_time {
                return false;
            }
        }
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        true
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn last_close_time(&self) -> Option<i64> {
        self.candles.back().map(|c| c.close_time)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
