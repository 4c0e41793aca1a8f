//! Deterministic, stateless tiered mouse bot detection. A pure function of
//! its feature vector — no model, no persistence, no randomness.

use crate::domain::features::MouseFeatures;

pub const TELEPORT_VELOCITY: f64 = 9.0;
pub const INHUMAN_PATH_MIN: f64 = 300.0;
pub const INHUMAN_LINEARITY_MAX: f64 = 0.2;
pub const REGULAR_TIMING_MIN_SEGMENTS: usize = 20;
pub const REGULAR_TIMING_STD_MAX: f64 = 0.02;
pub const LOW_JITTER_STD_MAX: f64 = 0.01;
pub const EXCESSIVE_LINEARITY_PATH_MIN: f64 = 150.0;
pub const EXCESSIVE_LINEARITY_MAX: f64 = 0.5;
pub const ACCUMULATION_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsVerdict {
    pub risk: f64,
    pub tags: Vec<String>,
}

pub struct PhysicsScorer;

impl PhysicsScorer {
    /// Tier 1 hard failures short-circuit to risk=1. Tier 2 is additive;
    /// tier 3 collapses the accumulated score to a binary verdict — physics
    /// risk is always exactly 0 or 1, never fractional.
    pub fn score(features: &MouseFeatures) -> PhysicsVerdict {
        if features.velocity_max > TELEPORT_VELOCITY {
            return PhysicsVerdict {
                risk: 1.0,
                tags: vec!["teleport_speed".to_string()],
            };
        }
        if features.path_distance > INHUMAN_PATH_MIN && features.linearity_error < INHUMAN_LINEARITY_MAX {
            return PhysicsVerdict {
                risk: 1.0,
                tags: vec!["inhuman_linearity".to_string()],
            };
        }

        let mut accumulated = 0.0;
        let mut tags = Vec::new();

        if features.segment_count >= REGULAR_TIMING_MIN_SEGMENTS
            && features.time_diff_std < REGULAR_TIMING_STD_MAX
        {
            accumulated += 0.35;
            tags.push("overly_regular_timing".to_string());
        }
        if features.velocity_std < LOW_JITTER_STD_MAX {
            accumulated += 0.25;
            tags.push("low_velocity_jitter".to_string());
        }
        if features.path_distance > EXCESSIVE_LINEARITY_PATH_MIN
            && features.linearity_error < EXCESSIVE_LINEARITY_MAX
        {
            accumulated += 0.25;
            tags.push("excessive_linearity".to_string());
        }

        if accumulated >= ACCUMULATION_THRESHOLD {
            PhysicsVerdict { risk: 1.0, tags }
        } else {
            PhysicsVerdict {
                risk: 0.0,
                tags: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_features() -> MouseFeatures {
        MouseFeatures {
            velocity_mean: 1.0,
            velocity_std: 0.5,
            velocity_max: 2.0,
            angle_mean: 0.0,
            angle_std: 0.2,
            curvature_mean: 0.1,
            curvature_std: 0.05,
            trajectory_efficiency: 0.6,
            path_distance: 100.0,
            linearity_error: 1.0,
            time_diff_std: 1.0,
            segment_count: 15,
        }
    }

    #[test]
    fn teleport_speed_is_hard_block() {
        let mut f = base_features();
        f.velocity_max = 15.0;
        f.path_distance = 200.0;
        let verdict = PhysicsScorer::score(&f);
        assert_eq!(verdict.risk, 1.0);
        assert!(verdict.tags.contains(&"teleport_speed".to_string()));
    }

    #[test]
    fn inhuman_linearity_is_hard_block() {
        let mut f = base_features();
        f.path_distance = 301.0;
        f.linearity_error = 0.1;
        let verdict = PhysicsScorer::score(&f);
        assert_eq!(verdict.risk, 1.0);
        assert!(verdict.tags.contains(&"inhuman_linearity".to_string()));
    }

    #[test]
    fn below_accumulation_threshold_is_clean() {
        let f = base_features();
        let verdict = PhysicsScorer::score(&f);
        assert_eq!(verdict.risk, 0.0);
        assert!(verdict.tags.is_empty());
    }

    #[test]
    fn accumulated_tiers_reach_block_threshold() {
        let mut f = base_features();
        f.segment_count = 25;
        f.time_diff_std = 0.01; // +0.35
        f.velocity_std = 0.005; // +0.25
        f.path_distance = 160.0;
        f.linearity_error = 0.3; // +0.25 => 0.85 total
        let verdict = PhysicsScorer::score(&f);
        assert_eq!(verdict.risk, 1.0);
        assert_eq!(verdict.tags.len(), 3);
    }
}
