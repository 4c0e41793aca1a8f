//! Feature vectors produced by the keyboard and mouse extractors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyFeatures {
    pub dwell_mean: f64,
    pub dwell_std: f64,
    pub flight_mean: f64,
    pub flight_std: f64,
    pub error_rate: f64,
}

impl KeyFeatures {
    /// Flatten to a named map for scorers that operate on arbitrary feature
    /// sets (scaler / HST / Welford all key off feature name).
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("dwell_mean", self.dwell_mean),
            ("dwell_std", self.dwell_std),
            ("flight_mean", self.flight_mean),
            ("flight_std", self.flight_std),
            ("error_rate", self.error_rate),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseFeatures {
    pub velocity_mean: f64,
    pub velocity_std: f64,
    pub velocity_max: f64,
    pub angle_mean: f64,
    pub angle_std: f64,
    pub curvature_mean: f64,
    pub curvature_std: f64,
    pub trajectory_efficiency: f64,
    pub path_distance: f64,
    pub linearity_error: f64,
    pub time_diff_std: f64,
    pub segment_count: usize,
}
