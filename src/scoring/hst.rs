//! Streaming Half-Space-Trees: an ensemble of random-split binary trees over
//! `[0,1]`-normalized features, scored by the mass each leaf accumulated in
//! the previous window (isolation-forest style: sparse, shallow paths are
//! anomalous).
//!
//! Represented as a plain value type so the whole ensemble can be serialized
//! and blobbed opaquely by `ModelStore`. Scoring is read-only; `learn`
//! mutates the mass counters and rolls the window.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HstNode {
    feature_idx: usize,
    split: f64,
    left: Option<Box<HstNode>>,
    right: Option<Box<HstNode>>,
    r_mass: u64,
    l_mass: u64,
}

impl HstNode {
    fn build(rng: &mut StdRng, num_features: usize, depth: u8, height: u8) -> Self {
        let feature_idx = rng.gen_range(0..num_features.max(1));
        let split = rng.gen_range(0.0..1.0);
        let (left, right) = if depth < height {
            (
                Some(Box::new(Self::build(rng, num_features, depth + 1, height))),
                Some(Box::new(Self::build(rng, num_features, depth + 1, height))),
            )
        } else {
            (None, None)
        };
        Self {
            feature_idx,
            split,
            left,
            right,
            r_mass: 0,
            l_mass: 0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    fn child_for(&self, features: &[f64]) -> bool {
        let value = features.get(self.feature_idx).copied().unwrap_or(0.5);
        value < self.split
    }

    fn read_path_score(&self, features: &[f64], depth: u8, path_score: &mut f64) {
        *path_score += self.r_mass as f64 * 2f64.powi(depth as i32);
        if self.is_leaf() {
            return;
        }
        if self.child_for(features) {
            self.left.as_ref().unwrap().read_path_score(features, depth + 1, path_score);
        } else {
            self.right.as_ref().unwrap().read_path_score(features, depth + 1, path_score);
        }
    }

    fn insert(&mut self, features: &[f64], depth: u8) {
        self.l_mass += 1;
        if self.is_leaf() {
            return;
        }
        if self.child_for(features) {
            self.left.as_mut().unwrap().insert(features, depth + 1);
        } else {
            self.right.as_mut().unwrap().insert(features, depth + 1);
        }
    }

    fn roll_window(&mut self) {
        self.r_mass = self.l_mass;
        self.l_mass = 0;
        if let Some(left) = &mut self.left {
            left.roll_window();
        }
        if let Some(right) = &mut self.right {
            right.roll_window();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfSpaceTrees {
    trees: Vec<HstNode>,
    window_size: usize,
    seen_in_window: usize,
    num_features: usize,
}

impl HalfSpaceTrees {
    pub fn new(num_trees: usize, height: u8, window_size: usize, num_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trees = (0..num_trees)
            .map(|_| HstNode::build(&mut rng, num_features, 0, height))
            .collect();
        Self {
            trees,
            window_size,
            seen_in_window: 0,
            num_features,
        }
    }

    /// Raw (uncalibrated) anomaly score in `(0, 1]`: higher means sparser,
    /// shallower paths, i.e. more anomalous. Read-only.
    pub fn score(&self, features: &[f64]) -> f64 {
        let mut total = 0.0;
        for tree in &self.trees {
            let mut path_score = 0.0;
            tree.read_path_score(features, 0, &mut path_score);
            total += path_score;
        }
        let avg = total / self.trees.len().max(1) as f64;
        1.0 / (1.0 + avg)
    }

    /// Insert this instance's mass and roll the window once `window_size`
    /// instances have been seen since the last roll.
    pub fn learn(&mut self, features: &[f64]) {
        for tree in &mut self.trees {
            tree.insert(features, 0);
        }
        self.seen_in_window += 1;
        if self.seen_in_window >= self.window_size {
            for tree in &mut self.trees {
                tree.roll_window();
            }
            self.seen_in_window = 0;
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_fixed_seed() {
        let a = HalfSpaceTrees::new(10, 4, 50, 3, 42);
        let b = HalfSpaceTrees::new(10, 4, 50, 3, 42);
        let features = [0.2, 0.5, 0.8];
        assert_eq!(a.score(&features), b.score(&features));
    }

    #[test]
    fn window_rolls_after_window_size_instances() {
        let mut hst = HalfSpaceTrees::new(5, 3, 10, 2, 1);
        for _ in 0..10 {
            hst.learn(&[0.3, 0.6]);
        }
        assert_eq!(hst.seen_in_window, 0);
    }

    #[test]
    fn score_is_bounded_unit_interval() {
        let mut hst = HalfSpaceTrees::new(20, 5, 20, 2, 7);
        for _ in 0..40 {
            let f = [0.1, 0.9];
            let s = hst.score(&f);
            assert!(s > 0.0 && s <= 1.0);
            hst.learn(&f);
        }
    }
}
