//! P² streaming quantile estimator (Jain & Chlamtac, 1985): O(1) memory,
//! five markers per quantile. Used to calibrate raw HST scores into a
//! percentile risk.

use serde::{Deserialize, Serialize};

/// A single streaming estimator for one quantile target `p`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2Quantile {
    p: f64,
    init_buffer: Vec<f64>,
    n: [f64; 5],
    np: [f64; 5],
    dn: [f64; 5],
    q: [f64; 5],
    initialized: bool,
}

impl P2Quantile {
    pub fn new(p: f64) -> Self {
        Self {
            p,
            init_buffer: Vec::with_capacity(5),
            n: [0.0; 5],
            np: [0.0; 5],
            dn: [0.0; 5],
            q: [0.0; 5],
            initialized: false,
        }
    }

    pub fn update(&mut self, x: f64) {
        if !self.initialized {
            self.init_buffer.push(x);
            if self.init_buffer.len() == 5 {
                self.init_buffer
                    .sort_by(|a, b| a.partial_cmp(b).unwrap());
                for i in 0..5 {
                    self.q[i] = self.init_buffer[i];
                    self.n[i] = (i + 1) as f64;
                }
                self.np = [
                    1.0,
                    1.0 + 2.0 * self.p,
                    1.0 + 4.0 * self.p,
                    3.0 + 2.0 * self.p,
                    5.0,
                ];
                self.dn = [0.0, self.p / 2.0, self.p, (1.0 + self.p) / 2.0, 1.0];
                self.initialized = true;
            }
            return;
        }

        let k = if x < self.q[0] {
            self.q[0] = x;
            0
        } else if x >= self.q[4] {
            self.q[4] = x;
            3
        } else {
            let mut found = 3;
            for i in 0..4 {
                if x >= self.q[i] && x < self.q[i + 1] {
                    found = i;
                    break;
                }
            }
            found
        };

        for i in (k + 1)..5 {
            self.n[i] += 1.0;
        }
        for i in 0..5 {
            self.np[i] += self.dn[i];
        }

        for i in 1..4 {
            let d = self.np[i] - self.n[i];
            if (d >= 1.0 && self.n[i + 1] - self.n[i] > 1.0)
                || (d <= -1.0 && self.n[i - 1] - self.n[i] < -1.0)
            {
                let sign = if d >= 0.0 { 1.0 } else { -1.0 };
                let parabolic = self.parabolic(i, sign);
                self.q[i] = if self.q[i - 1] < parabolic && parabolic < self.q[i + 1] {
                    parabolic
                } else {
                    self.linear(i, sign)
                };
                self.n[i] += sign;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let (n, q) = (self.n, self.q);
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let (n, q) = (self.n, self.q);
        let j = (i as f64 + d) as usize;
        q[i] + d * (q[j] - q[i]) / (n[j] - n[i])
    }

    /// The estimate for `p`; meaningless until at least 5 samples observed.
    pub fn value(&self) -> f64 {
        if self.initialized {
            self.q[2]
        } else if let Some(last) = self.init_buffer.last() {
            *last
        } else {
            0.0
        }
    }

    pub fn is_ready(&self) -> bool {
        self.initialized
    }
}

/// The five anchors {.50, .75, .90, .95, .99} used for percentile
/// calibration of the raw HST score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantileCalibrator {
    anchors: [P2Quantile; 5],
}

const ANCHOR_PS: [f64; 5] = [0.50, 0.75, 0.90, 0.95, 0.99];

impl Default for QuantileCalibrator {
    fn default() -> Self {
        Self {
            anchors: ANCHOR_PS
                .map(P2Quantile::new),
        }
    }
}

impl QuantileCalibrator {
    pub fn update(&mut self, raw_score: f64) {
        for anchor in &mut self.anchors {
            anchor.update(raw_score);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.anchors.iter().all(|a| a.is_ready())
    }

    /// Piecewise-linear interpolate `raw_score` through the five anchors;
    /// below Q50 -> linear to 0, above Q99 -> clamp to 1.
    pub fn calibrate(&self, raw_score: f64) -> f64 {
        let q: Vec<f64> = self.anchors.iter().map(|a| a.value()).collect();
        let p = ANCHOR_PS;

        if raw_score <= q[0] {
            if q[0] > 0.0 {
                return (raw_score / q[0] * p[0]).clamp(0.0, p[0]);
            }
            return 0.0;
        }
        if raw_score >= q[4] {
            return 1.0;
        }
        for i in 0..4 {
            if raw_score >= q[i] && raw_score <= q[i + 1] {
                if (q[i + 1] - q[i]).abs() < f64::EPSILON {
                    return p[i];
                }
                let t = (raw_score - q[i]) / (q[i + 1] - q[i]);
                return p[i] + t * (p[i + 1] - p[i]);
            }
        }
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_roughly_to_median() {
        let mut q = P2Quantile::new(0.5);
        for i in 1..=1001 {
            q.update(i as f64);
        }
        assert!((q.value() - 501.0).abs() < 50.0);
    }

    #[test]
    fn calibrator_clamps_extremes() {
        let mut cal = QuantileCalibrator::default();
        for i in 1..=200 {
            cal.update(i as f64);
        }
        assert!(cal.is_ready());
        assert_eq!(cal.calibrate(10_000.0), 1.0);
    }
}
