// =============================================================================
// Core Zone — where the fills actually happen
// =============================================================================
//
// Fills are binned by price (bin_size units) over the trailing t_zone_hours.
// Bins are ranked by volume descending and the smallest set covering
// zone_cover of total volume defines the zone, clipped to the outer range.
// Hysteresis: a new zone whose width differs from the current one by less
// than zone_change_threshold (relative) is discarded. With no fill data the
// zone equals the outer range.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::ZoneConfig;

/// Fill-density histogram with time-windowed pruning.
#[derive(Debug)]
pub struct FillDensity {
    bin_size: f64,
    window: Duration,
    records: HashMap<i64, Vec<(DateTime<Utc>, f64)>>,
}

impl FillDensity {
    pub fn new(bin_size: f64, window_hours: i64) -> Self {
        Self {
            bin_size,
            window: Duration::hours(window_hours),
            records: HashMap::new(),
        }
    }

    fn bin_of(&self, price: f64) -> i64 {
        (price / self.bin_size).floor() as i64
    }

    pub fn record_fill(&mut self, ts: DateTime<Utc>, price: f64, qty: f64) {
        self.records
            .entry(self.bin_of(price))
            .or_default()
            .push((ts, qty));
    }

    /// Per-bin volume within the window.
    pub fn density(&self, now: DateTime<Utc>) -> HashMap<i64, f64> {
        let cutoff = now - self.window;
        let mut out = HashMap::new();
        for (bin, records) in &self.records {
            let qty: f64 = records
                .iter()
                .filter(|(ts, _)| *ts > cutoff)
                .map(|(_, q)| *q)
                .sum();
            if qty > 0.0 {
                out.insert(*bin, qty);
            }
        }
        out
    }

    /// Drop records that have aged out of the window.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.records.retain(|_, records| {
            records.retain(|(ts, _)| *ts > cutoff);
            !records.is_empty()
        });
    }
}

/// Core-zone extraction with hysteresis.
#[derive(Debug)]
pub struct CoreZoneCalculator {
    bin_size: f64,
    zone_cover: f64,
    zone_change_threshold: f64,
    density: FillDensity,
    current: Option<(f64, f64)>,
}

impl CoreZoneCalculator {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            bin_size: config.bin_size,
            zone_cover: config.zone_cover,
            zone_change_threshold: config.zone_change_threshold,
            density: FillDensity::new(config.bin_size, config.t_zone_hours),
            current: None,
        }
    }

    pub fn record_fill(&mut self, ts: DateTime<Utc>, price: f64, qty: f64) {
        self.density.record_fill(ts, price, qty);
    }

    /// The last computed zone, if any.
    pub fn zone(&self) -> Option<(f64, f64)> {
        self.current
    }

    /// Recompute the zone from the windowed histogram. Only the control tick
    /// calls this; boundaries never move between ticks.
    pub fn recompute(
        &mut self,
        now: DateTime<Utc>,
        outer_low: f64,
        outer_high: f64,
    ) -> (f64, f64) {
        self.density.cleanup(now);
        let density = self.density.density(now);

        let total: f64 = density.values().sum();
        if density.is_empty() || total <= 0.0 {
            return (outer_low, outer_high);
        }

        // Rank bins by volume and accept the smallest covering set.
        let mut ranked: Vec<(i64, f64)> = density.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut covered = 0.0;
        let mut selected: Vec<i64> = Vec::new();
        for (bin, qty) in ranked {
            selected.push(bin);
            covered += qty;
            if covered / total >= self.zone_cover {
                break;
            }
        }

        let min_bin = *selected.iter().min().expect("selected is non-empty");
        let max_bin = *selected.iter().max().expect("selected is non-empty");

        let new_low = (min_bin as f64 * self.bin_size).max(outer_low);
        let new_high = ((max_bin + 1) as f64 * self.bin_size).min(outer_high);

        // Hysteresis on the zone width.
        if let Some((old_low, old_high)) = self.current {
            let old_width = old_high - old_low;
            let new_width = new_high - new_low;
            if old_width > 0.0 {
                let change = (new_width - old_width).abs() / old_width;
                if change < self.zone_change_threshold {
                    return (old_low, old_high);
                }
            }
        }

        debug!(new_low, new_high, "core zone updated");
        self.current = Some((new_low, new_high));
        (new_low, new_high)
    }

    /// Density component of the per-price advantage score, normalized so a
    /// bin holding 10% of windowed volume saturates.
    pub fn density_score(&self, price: f64, now: DateTime<Utc>) -> f64 {
        let density = self.density.density(now);
        let total: f64 = density.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let bin = (price / self.bin_size).floor() as i64;
        let qty = density.get(&bin).copied().unwrap_or(0.0);
        (qty / (total * 0.1)).min(1.0)
    }
}
