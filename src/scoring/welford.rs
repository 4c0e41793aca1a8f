//! Online mean/variance per Welford's algorithm, used for feature
//! attribution (z-score tagging) in `HstScorer`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WelfordStat {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Default for WelfordStat {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl WelfordStat {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation; 0 until at least two samples.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    pub fn z_score(&self, value: f64) -> Option<f64> {
        let sigma = self.std_dev();
        if sigma > 0.0 {
            Some((value - self.mean) / sigma)
        } else {
            None
        }
    }
}

/// Per-feature-name Welford stats, keyed the way `KeyFeatures::as_map` names
/// its entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureStats {
    stats: BTreeMap<String, WelfordStat>,
}

impl FeatureStats {
    pub fn update(&mut self, features: &BTreeMap<&'static str, f64>) {
        for (name, value) in features {
            self.stats.entry(name.to_string()).or_default().update(*value);
        }
    }

    /// z > 2.0 -> `<name>_high`; z < -2.0 -> `<name>_low`.
    pub fn attribution_tags(&self, features: &BTreeMap<&'static str, f64>) -> Vec<String> {
        let mut tags = Vec::new();
        for (name, value) in features {
            if let Some(stat) = self.stats.get(*name) {
                if let Some(z) = stat.z_score(*value) {
                    if z > 2.0 {
                        tags.push(format!("{name}_high"));
                    } else if z < -2.0 {
                        tags.push(format!("{name}_low"));
                    }
                }
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_dev_zero_until_two_samples() {
        let mut stat = WelfordStat::default();
        assert_eq!(stat.std_dev(), 0.0);
        stat.update(5.0);
        assert_eq!(stat.std_dev(), 0.0);
        stat.update(7.0);
        assert!(stat.std_dev() > 0.0);
    }

    #[test]
    fn attribution_flags_high_and_low_outliers() {
        let mut stats = FeatureStats::default();
        for v in [10.0, 10.0, 10.0, 10.0, 11.0, 9.0] {
            let mut map = BTreeMap::new();
            map.insert("x", v);
            stats.update(&map);
        }
        let mut probe = BTreeMap::new();
        probe.insert("x", 100.0);
        let tags = stats.attribution_tags(&probe);
        assert!(tags.contains(&"x_high".to_string()));
    }
}
