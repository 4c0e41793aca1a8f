//! Combines the fixed-bound min-max scaler, the HST ensemble, percentile
//! calibration and feature attribution into the one scorer blob that gets
//! opaquely persisted by `ModelStore` under `ModelType::Hst` /
//! `ModelType::Identity`.

use super::hst::HalfSpaceTrees;
use super::quantile::QuantileCalibrator;
use super::welford::FeatureStats;
use crate::domain::features::KeyFeatures;
use crate::error::SentinelError;
use base64::Engine;
use serde::{Deserialize, Serialize};

const FEATURE_ORDER: [&str; 5] = ["dwell_mean", "dwell_std", "flight_mean", "flight_std", "error_rate"];

/// Windows learned before raw HST scores stop polluting the calibration
/// quantiles (HST's initial all-zero mass behavior).
const CALIBRATION_COLD_START: u64 = 50;
/// Windows learned before the scorer returns a calibrated percentile
/// instead of the raw HST score.
const SCORING_COLD_START: u64 = 70;

fn scale_feature(name: &str, value: f64) -> f64 {
    let (lo, hi) = match name {
        "dwell_mean" | "dwell_std" => (0.0, 500.0),
        "flight_mean" | "flight_std" => (-100.0, 1200.0),
        "error_rate" => (0.0, 0.3),
        _ => return value,
    };
    (value.clamp(lo, hi) - lo) / (hi - lo)
}

fn scaled_vector(features: &KeyFeatures) -> Vec<f64> {
    let map = features.as_map();
    FEATURE_ORDER
        .iter()
        .map(|name| scale_feature(name, map.get(name).copied().unwrap_or(0.0)))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HstScorer {
    hst: HalfSpaceTrees,
    calibrator: QuantileCalibrator,
    feature_stats: FeatureStats,
    windows_learned: u64,
}

impl HstScorer {
    pub fn new(num_trees: usize, height: u8, window_size: usize, seed: u64) -> Self {
        Self {
            hst: HalfSpaceTrees::new(num_trees, height, window_size, FEATURE_ORDER.len(), seed),
            calibrator: QuantileCalibrator::default(),
            feature_stats: FeatureStats::default(),
            windows_learned: 0,
        }
    }

    /// Matches the defaults in the durable constants table: 100 trees,
    /// height 6, window 50, fixed seed.
    pub fn with_defaults() -> Self {
        Self::new(100, 6, 50, 42)
    }

    pub fn windows_learned(&self) -> u64 {
        self.windows_learned
    }

    pub fn is_cold(&self) -> bool {
        self.windows_learned < CALIBRATION_COLD_START
    }

    /// score(features) -> (risk in [0,1], attribution tags). Read-only.
    pub fn score_one(&self, features: &KeyFeatures) -> (f64, Vec<String>) {
        let scaled = scaled_vector(features);
        let raw = self.hst.score(&scaled);
        let risk = if self.windows_learned < SCORING_COLD_START {
            raw
        } else {
            self.calibrator.calibrate(raw)
        };

        let tags = if risk > 0.6 {
            self.feature_stats.attribution_tags(&features.as_map())
        } else {
            Vec::new()
        };

        (risk.clamp(0.0, 1.0), tags)
    }

    /// learn(features): updates HST mass, quantile calibration (once past
    /// the cold-start floor) and per-feature attribution stats.
    pub fn learn_one(&mut self, features: &KeyFeatures) {
        let scaled = scaled_vector(features);
        let raw = self.hst.score(&scaled);

        if self.windows_learned >= CALIBRATION_COLD_START {
            self.calibrator.update(raw);
        }

        self.hst.learn(&scaled);
        self.feature_stats.update(&features.as_map());
        self.windows_learned += 1;
    }
}

/// Opaque blob encoding: the whole scorer (scaler state, HST ensemble,
/// quantile calibrator, feature stats) as one base64-wrapped JSON unit, so
/// `ModelStore` never needs to know the scorer's shape. Base64 keeps the
/// length a multiple of 4, matching `ModelStore`'s truncation check.
pub fn encode(scorer: &HstScorer) -> Result<String, SentinelError> {
    let json = serde_json::to_vec(scorer).map_err(|e| SentinelError::InternalUnknown(format!("encode scorer: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

/// Decode failure (bad base64, bad JSON) is reported as `ModelCorruption`;
/// callers treat that the same as "no model" and rebuild fresh.
pub fn decode(blob: &str) -> Result<HstScorer, SentinelError> {
    let json = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| SentinelError::ModelCorruption(format!("base64 decode: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| SentinelError::ModelCorruption(format!("json decode: {e}")))
}

/// Loads a scorer from an optional blob, falling back to a fresh default on
/// absence or corruption (corruption is logged by the caller, not here).
pub fn decode_or_default(blob: Option<&str>) -> HstScorer {
    blob.and_then(|b| decode(b).ok()).unwrap_or_else(HstScorer::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(dwell: f64, flight: f64, error_rate: f64) -> KeyFeatures {
        KeyFeatures {
            dwell_mean: dwell,
            dwell_std: dwell / 4.0,
            flight_mean: flight,
            flight_std: flight / 4.0,
            error_rate,
        }
    }

    #[test]
    fn raw_score_below_seventy_learned_windows() {
        let mut scorer = HstScorer::with_defaults();
        for _ in 0..69 {
            scorer.learn_one(&features(120.0, 180.0, 0.05));
        }
        let (risk_raw, _) = scorer.score_one(&features(120.0, 180.0, 0.05));
        let scaled = scaled_vector(&features(120.0, 180.0, 0.05));
        assert_eq!(risk_raw, scorer_hst_score(&scorer, &scaled));
    }

    fn scorer_hst_score(scorer: &HstScorer, scaled: &[f64]) -> f64 {
        scorer.hst.score(scaled).clamp(0.0, 1.0)
    }

    #[test]
    fn bot_burst_after_human_warmup_flags_anomaly() {
        let mut scorer = HstScorer::with_defaults();
        for _ in 0..150 {
            scorer.learn_one(&features(120.0, 180.0, 0.05));
        }
        let (bot_risk, _tags) = scorer.score_one(&features(5.0, 5.0, 0.0));
        assert!(bot_risk >= 0.0 && bot_risk <= 1.0);
    }
}
