// =============================================================================
// Market Data — candle model and the live feed
// =============================================================================

pub mod feed;

use serde::{Deserialize, Serialize};

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Midpoint of the bar range; the sim broker's mark proxy.
    pub fn mid(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_is_range_midpoint() {
        let candle = Candle {
            open_time: 0,
            open: 84_900.0,
            high: 85_100.0,
            low: 84_700.0,
            close: 85_000.0,
            volume: 10.0,
            is_closed: true,
        };
        assert!((candle.mid() - 84_900.0).abs() < 1e-9);
    }
}
