//! Confidence Calibration
//!
//! A fitted calibrator is a monotonic map from raw consensus score to
//! reported confidence, learned from historical signal -> outcome pairs
//! (train + validation only; the test set never touches a fit). Until a fit
//! exists the identity map applies and signals are tagged `raw`.
//!
//! Curves are immutable after fit; replacements install via pointer swap so
//! the consensus hot path never takes a lock.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::CalibrationTag;

const DEFAULT_BINS: usize = 10;
const MIN_BIN_SAMPLES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurveBin {
    lo: f64,
    hi: f64,
    fitted: f64,
    samples: u32,
}

/// Immutable fitted curve. An empty bin list is the identity map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationCurve {
    version: String,
    bins: Vec<CurveBin>,
    pub sample_size: u32,
    pub fitted_at: Option<DateTime<Utc>>,
}

impl CalibrationCurve {
    pub fn identity() -> Self {
        Self {
            version: "identity".to_string(),
            bins: Vec::new(),
            sample_size: 0,
            fitted_at: None,
        }
    }

    /// Fit from (raw_score, won) pairs: per-bin win rates pooled to be
    /// non-decreasing (pool-adjacent-violators), so the map is monotonic.
    pub fn fit(pairs: &[(f64, bool)], fitted_at: DateTime<Utc>, version: &str) -> Self {
        if pairs.is_empty() {
            return Self::identity();
        }

        let step = 1.0 / DEFAULT_BINS as f64;
        let mut wins = vec![0u32; DEFAULT_BINS];
        let mut totals = vec![0u32; DEFAULT_BINS];
        for (raw, won) in pairs {
            let idx = ((raw / step) as usize).min(DEFAULT_BINS - 1);
            totals[idx] += 1;
            if *won {
                wins[idx] += 1;
            }
        }

        // Per-bin means; sparse bins fall back to the bin midpoint so the
        // pooled sequence stays anchored to the identity.
        let mut means: Vec<f64> = (0..DEFAULT_BINS)
            .map(|i| {
                if totals[i] >= MIN_BIN_SAMPLES {
                    wins[i] as f64 / totals[i] as f64
                } else {
                    (i as f64 + 0.5) * step
                }
            })
            .collect();
        let weights: Vec<f64> = totals
            .iter()
            .map(|t| (*t).max(MIN_BIN_SAMPLES) as f64)
            .collect();

        pool_adjacent_violators(&mut means, &weights);

        let bins = (0..DEFAULT_BINS)
            .map(|i| CurveBin {
                lo: i as f64 * step,
                hi: if i == DEFAULT_BINS - 1 { 1.0 + f64::EPSILON } else { (i + 1) as f64 * step },
                fitted: means[i].clamp(0.01, 0.99),
                samples: totals[i],
            })
            .collect();

        Self {
            version: version.to_string(),
            bins,
            sample_size: pairs.len() as u32,
            fitted_at: Some(fitted_at),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn apply(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);
        if self.bins.is_empty() {
            return raw;
        }
        self.bins
            .iter()
            .find(|b| raw >= b.lo && raw < b.hi)
            .map(|b| b.fitted)
            .unwrap_or(raw)
    }

    pub fn tag(&self) -> CalibrationTag {
        if self.is_identity() {
            CalibrationTag::Raw
        } else {
            CalibrationTag::Fitted {
                version: self.version.clone(),
            }
        }
    }
}

/// Weighted PAV pass enforcing a non-decreasing sequence.
fn pool_adjacent_violators(values: &mut [f64], weights: &[f64]) {
    let n = values.len();
    if n < 2 {
        return;
    }

    // (mean, weight, run length) blocks merged left-to-right.
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(n);
    for i in 0..n {
        blocks.push((values[i], weights[i], 1));
        while blocks.len() >= 2 {
            let last = blocks[blocks.len() - 1];
            let prev = blocks[blocks.len() - 2];
            if prev.0 <= last.0 {
                break;
            }
            let w = prev.1 + last.1;
            let mean = (prev.0 * prev.1 + last.0 * last.1) / w;
            let len = prev.2 + last.2;
            blocks.truncate(blocks.len() - 2);
            blocks.push((mean, w, len));
        }
    }

    let mut idx = 0;
    for (mean, _, len) in blocks {
        for _ in 0..len {
            values[idx] = mean;
            idx += 1;
        }
    }
}

/// Shared handle: read on every consensus evaluation, swapped on refit.
pub struct CalibratorHandle {
    curve: ArcSwap<CalibrationCurve>,
}

impl CalibratorHandle {
    pub fn identity() -> Self {
        Self {
            curve: ArcSwap::from_pointee(CalibrationCurve::identity()),
        }
    }

    pub fn with_curve(curve: CalibrationCurve) -> Self {
        Self {
            curve: ArcSwap::from_pointee(curve),
        }
    }

    pub fn current(&self) -> Arc<CalibrationCurve> {
        self.curve.load_full()
    }

    /// Hot-swap: installs the new immutable curve atomically.
    pub fn install(&self, curve: CalibrationCurve) {
        self.curve.store(Arc::new(curve));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn identity_until_fitted() {
        let handle = CalibratorHandle::identity();
        let curve = handle.current();
        assert!(curve.is_identity());
        assert_eq!(curve.apply(0.73), 0.73);
        assert_eq!(curve.tag(), CalibrationTag::Raw);
    }

    #[test]
    fn fitted_curve_is_monotonic() {
        // Overconfident generator: realized win rate lags the raw score.
        let mut pairs = Vec::new();
        for i in 0..200 {
            let raw = (i % 10) as f64 / 10.0 + 0.05;
            let won = (i * 7) % 10 < ((raw * 8.0) as usize);
            pairs.push((raw, won));
        }
        let curve = CalibrationCurve::fit(&pairs, now(), "cal-v1");
        assert!(!curve.is_identity());

        let mut prev = 0.0;
        for i in 0..=20 {
            let v = curve.apply(i as f64 / 20.0);
            assert!(v >= prev - 1e-12, "non-monotonic at {}: {} < {}", i, v, prev);
            prev = v;
        }
    }

    #[test]
    fn hot_swap_replaces_curve() {
        let handle = CalibratorHandle::identity();
        let pairs: Vec<(f64, bool)> = (0..100)
            .map(|i| ((i % 10) as f64 / 10.0 + 0.05, i % 3 == 0))
            .collect();
        handle.install(CalibrationCurve::fit(&pairs, now(), "cal-v2"));

        let curve = handle.current();
        assert_eq!(curve.version(), "cal-v2");
        assert!(matches!(curve.tag(), CalibrationTag::Fitted { .. }));
    }

    #[test]
    fn pav_pools_violations() {
        let mut values = vec![0.2, 0.5, 0.3, 0.8];
        let weights = vec![1.0, 1.0, 1.0, 1.0];
        pool_adjacent_violators(&mut values, &weights);
        assert!(values.windows(2).all(|w| w[0] <= w[1] + 1e-12));
        assert!((values[1] - 0.4).abs() < 1e-9);
        assert!((values[2] - 0.4).abs() < 1e-9);
    }
}
