// =============================================================================
// Volatility Primitives — ATR, realized vol, and the spike detector
// =============================================================================
//
// ATR (execution layer — grid spacing, stop buffers, re-anchor offsets):
//   TR  = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR = SMA(TR, atr_len)
//
// Realized vol (judgment layer — regime filtering, preset selection):
//   r  = ln(close / prevClose)
//   RV = std(r, rv_len) * sqrt(bars_per_year)
//
// Spike detector (NORMAL -> DEFENSIVE signal):
//   spike when ATR > ATR_MA * spike_mult, clears when ATR < ATR_MA *
//   clear_mult, with a cooldown that blocks rapid re-trigger. Spike state is
//   sticky until cleared.
//
// All three update on bar close and publish a read-only snapshot.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::VolatilityConfig;

/// Read-only volatility snapshot handed to triggers and the grid generator.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VolSnapshot {
    pub atr: f64,
    pub rv: f64,
    pub atr_ma: f64,
    pub is_spike: bool,
    /// True once `atr_len` bars have been seen; until then ATR is "cold".
    pub atr_ready: bool,
}

// ---------------------------------------------------------------------------
// ATR
// ---------------------------------------------------------------------------

/// Streaming ATR over closed bars.
#[derive(Debug)]
pub struct AtrCalculator {
    period: usize,
    tr_history: VecDeque<f64>,
    prev_close: Option<f64>,
    current: f64,
}

impl AtrCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            tr_history: VecDeque::with_capacity(period.max(1) * 2),
            prev_close: None,
            current: 0.0,
        }
    }

    /// Feed one closed bar; returns the updated ATR.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            None => high - low,
            Some(prev) => (high - low).max((high - prev).abs()).max((low - prev).abs()),
        };

        self.tr_history.push_back(tr);
        while self.tr_history.len() > self.period.max(1) {
            self.tr_history.pop_front();
        }
        self.prev_close = Some(close);

        if !self.tr_history.is_empty() {
            self.current = self.tr_history.iter().sum::<f64>() / self.tr_history.len() as f64;
        }
        self.current
    }

    pub fn value(&self) -> f64 {
        self.current
    }

    pub fn ready(&self) -> bool {
        self.tr_history.len() >= self.period
    }
}

// ---------------------------------------------------------------------------
// Realized volatility
// ---------------------------------------------------------------------------

/// Annualized realized volatility from log returns of closes.
#[derive(Debug)]
pub struct RvCalculator {
    period: usize,
    bars_per_year: f64,
    returns: VecDeque<f64>,
    prev_close: Option<f64>,
    current: f64,
}

impl RvCalculator {
    pub fn new(period: usize, bar_minutes: f64) -> Self {
        Self {
            period,
            bars_per_year: 365.0 * 24.0 * 60.0 / bar_minutes.max(1.0),
            returns: VecDeque::with_capacity(period.max(1) * 2),
            prev_close: None,
            current: 0.0,
        }
    }

    pub fn update(&mut self, close: f64) -> f64 {
        if let Some(prev) = self.prev_close {
            if prev > 0.0 && close > 0.0 {
                self.returns.push_back((close / prev).ln());
                while self.returns.len() > self.period.max(1) {
                    self.returns.pop_front();
                }

                if self.returns.len() >= self.period {
                    let n = self.returns.len() as f64;
                    let mean = self.returns.iter().sum::<f64>() / n;
                    let var = self
                        .returns
                        .iter()
                        .map(|r| (r - mean) * (r - mean))
                        .sum::<f64>()
                        / n;
                    self.current = var.sqrt() * self.bars_per_year.sqrt();
                }
            }
        }
        self.prev_close = Some(close);
        self.current
    }

    pub fn value(&self) -> f64 {
        self.current
    }
}

// ---------------------------------------------------------------------------
// Spike detector
// ---------------------------------------------------------------------------

/// Sticky ATR-vs-its-own-mean spike detector with hysteresis and cooldown.
#[derive(Debug)]
pub struct VolSpikeDetector {
    atr_ma_len: usize,
    spike_mult: f64,
    clear_mult: f64,
    cooldown: Duration,

    atr_history: VecDeque<f64>,
    is_spike: bool,
    last_clear: Option<DateTime<Utc>>,
}

impl VolSpikeDetector {
    pub fn new(atr_ma_len: usize, spike_mult: f64, clear_mult: f64, cooldown_minutes: i64) -> Self {
        Self {
            atr_ma_len,
            spike_mult,
            clear_mult,
            cooldown: Duration::minutes(cooldown_minutes),
            atr_history: VecDeque::with_capacity(atr_ma_len.max(1) * 2),
            is_spike: false,
            last_clear: None,
        }
    }

    /// Feed the latest ATR value; returns the (possibly changed) spike state.
    pub fn update(&mut self, atr: f64, now: DateTime<Utc>) -> bool {
        self.atr_history.push_back(atr);
        while self.atr_history.len() > self.atr_ma_len.max(1) {
            self.atr_history.pop_front();
        }

        let ma = self.atr_ma();
        if ma <= 0.0 {
            return self.is_spike;
        }

        // Cooldown after a clear blocks rapid re-trigger.
        if let Some(cleared_at) = self.last_clear {
            if now - cleared_at < self.cooldown {
                return self.is_spike;
            }
        }

        if !self.is_spike {
            if atr > ma * self.spike_mult {
                self.is_spike = true;
                debug!(atr, atr_ma = ma, mult = self.spike_mult, "volatility spike detected");
            }
        } else if atr < ma * self.clear_mult {
            self.is_spike = false;
            self.last_clear = Some(now);
            debug!(atr, atr_ma = ma, mult = self.clear_mult, "volatility spike cleared");
        }

        self.is_spike
    }

    pub fn is_spike(&self) -> bool {
        self.is_spike
    }

    pub fn atr_ma(&self) -> f64 {
        if self.atr_history.is_empty() {
            return 0.0;
        }
        self.atr_history.iter().sum::<f64>() / self.atr_history.len() as f64
    }

    pub fn spike_ratio(&self) -> f64 {
        let ma = self.atr_ma();
        if ma <= 0.0 {
            return 0.0;
        }
        self.atr_history.back().copied().unwrap_or(0.0) / ma
    }
}

// ---------------------------------------------------------------------------
// Combined model
// ---------------------------------------------------------------------------

/// The three primitives bundled behind one bar-close update.
pub struct VolatilityModel {
    atr: AtrCalculator,
    rv: RvCalculator,
    spike: VolSpikeDetector,
}

impl VolatilityModel {
    pub fn new(config: &VolatilityConfig, atr_ma_len: usize, bar_minutes: f64) -> Self {
        Self {
            atr: AtrCalculator::new(config.atr_len),
            rv: RvCalculator::new(config.rv_len, bar_minutes),
            spike: VolSpikeDetector::new(
                atr_ma_len,
                config.spike_mult,
                config.clear_mult,
                config.cooldown_minutes,
            ),
        }
    }

    /// Update all primitives from one closed bar.
    pub fn on_bar_close(&mut self, high: f64, low: f64, close: f64, now: DateTime<Utc>) {
        let atr = self.atr.update(high, low, close);
        self.rv.update(close);
        self.spike.update(atr, now);
    }

    pub fn snapshot(&self) -> VolSnapshot {
        VolSnapshot {
            atr: self.atr.value(),
            rv: self.rv.value(),
            atr_ma: self.spike.atr_ma(),
            is_spike: self.spike.is_spike(),
            atr_ready: self.atr.ready(),
        }
    }

    pub fn spike_ratio(&self) -> f64 {
        self.spike.spike_ratio()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_constant_range_converges() {
        let mut atr = AtrCalculator::new(14);
        // All bars share the same 10-point range, close at midpoint.
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            atr.update(base + 5.0, base - 5.0, base);
        }
        assert!(atr.ready());
        assert!(
            (atr.value() - 10.0).abs() < 1.0,
            "expected ATR near 10.0, got {}",
            atr.value()
        );
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        let mut atr = AtrCalculator::new(3);
        atr.update(105.0, 95.0, 95.0); // close at low
        // Gap up: |115 - 95| = 20 dominates the 7-point bar range.
        atr.update(115.0, 108.0, 112.0);
        atr.update(118.0, 110.0, 115.0);
        atr.update(120.0, 113.0, 118.0);
        assert!(atr.value() > 7.0, "ATR should reflect the gap, got {}", atr.value());
    }

    #[test]
    fn atr_not_ready_until_period_filled() {
        let mut atr = AtrCalculator::new(14);
        for _ in 0..5 {
            atr.update(101.0, 99.0, 100.0);
        }
        assert!(!atr.ready());
    }

    #[test]
    fn rv_zero_for_flat_prices() {
        let mut rv = RvCalculator::new(20, 1.0);
        for _ in 0..50 {
            rv.update(100.0);
        }
        assert!(rv.value().abs() < 1e-12);
    }

    #[test]
    fn rv_positive_for_oscillating_prices() {
        let mut rv = RvCalculator::new(20, 1.0);
        for i in 0..50 {
            let price = if i % 2 == 0 { 100.0 } else { 101.0 };
            rv.update(price);
        }
        assert!(rv.value() > 0.0);
    }

    #[test]
    fn spike_triggers_and_clears_with_hysteresis() {
        let mut det = VolSpikeDetector::new(10, 2.0, 1.3, 0);
        let t0 = Utc::now();

        // Build a calm baseline.
        for i in 0..10 {
            det.update(1.0, t0 + Duration::minutes(i));
        }
        assert!(!det.is_spike());

        // 3x the mean: spike.
        det.update(3.0, t0 + Duration::minutes(11));
        assert!(det.is_spike());

        // 1.5x the (now raised) mean: still spiking, hysteresis holds.
        let between = det.atr_ma() * 1.5;
        det.update(between, t0 + Duration::minutes(12));
        assert!(det.is_spike());

        // Well below clear_mult * mean: clears.
        det.update(0.1, t0 + Duration::minutes(13));
        assert!(!det.is_spike());
    }

    #[test]
    fn spike_cooldown_blocks_rapid_retrigger() {
        let mut det = VolSpikeDetector::new(10, 2.0, 1.3, 60);
        let t0 = Utc::now();

        for i in 0..10 {
            det.update(1.0, t0 + Duration::minutes(i));
        }
        det.update(5.0, t0 + Duration::minutes(10));
        assert!(det.is_spike());
        det.update(0.1, t0 + Duration::minutes(11));
        assert!(!det.is_spike());

        // Within the 60-minute cooldown: even a huge ATR does not re-arm.
        det.update(50.0, t0 + Duration::minutes(12));
        assert!(!det.is_spike());

        // After the cooldown it can trigger again.
        det.update(50.0, t0 + Duration::minutes(80));
        assert!(det.is_spike());
    }

    #[test]
    fn model_snapshot_reflects_state() {
        let config = VolatilityConfig::default();
        let mut model = VolatilityModel::new(&config, 480, 1.0);
        let t0 = Utc::now();
        for i in 0..20 {
            let base = 85_000.0 + (i as f64) * 2.0;
            model.on_bar_close(base + 50.0, base - 50.0, base, t0 + Duration::minutes(i));
        }
        let snap = model.snapshot();
        assert!(snap.atr > 0.0);
        assert!(snap.atr_ready);
        assert!(!snap.is_spike);
    }
}
