//! Pairs DOWN/UP events into presses and emits a dwell/flight/error feature
//! vector every `stride` DOWN events once `window` presses are available.
//!
//! A fresh extractor is built per stream batch: the orchestrator replays
//! stored pending events through it before feeding new ones, so this type
//! carries no persisted state of its own (see `orchestrator::stream`).

use crate::domain::events::{KeyEvent, KeyEventKind};
use crate::domain::features::KeyFeatures;
use std::collections::{HashMap, VecDeque};

pub const WINDOW: usize = 50;
pub const STRIDE: usize = 5;
pub const COFFEE_BREAK_MS: i64 = 2000;
const ERROR_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct KeyboardExtractor {
    window: usize,
    stride: usize,
    coffee_break_ms: i64,
    pending_down: HashMap<String, VecDeque<i64>>,
    completed_presses: VecDeque<(String, i64, i64)>,
    recent_down: VecDeque<String>,
    down_count: u64,
}

impl Default for KeyboardExtractor {
    fn default() -> Self {
        Self::new(WINDOW, STRIDE, COFFEE_BREAK_MS)
    }
}

impl KeyboardExtractor {
    pub fn new(window: usize, stride: usize, coffee_break_ms: i64) -> Self {
        Self {
            window,
            stride,
            coffee_break_ms,
            pending_down: HashMap::new(),
            completed_presses: VecDeque::new(),
            recent_down: VecDeque::new(),
            down_count: 0,
        }
    }

    /// Feed one raw event. Returns a feature vector when a window boundary
    /// is crossed.
    pub fn step(&mut self, event: &KeyEvent) -> Option<KeyFeatures> {
        match event.kind {
            KeyEventKind::Down => {
                self.pending_down
                    .entry(event.key.clone())
                    .or_default()
                    .push_back(event.ts);
                self.recent_down.push_back(event.key.clone());
                if self.recent_down.len() > ERROR_WINDOW {
                    self.recent_down.pop_front();
                }
                self.down_count += 1;

                let w = self.window as u64;
                let s = self.stride as u64;
                let should_emit = self.down_count >= w && (self.down_count - w) % s == 0;
                if should_emit {
                    Some(self.compute_features())
                } else {
                    None
                }
            }
            KeyEventKind::Up => {
                if let Some(queue) = self.pending_down.get_mut(&event.key) {
                    if let Some(t_down) = queue.pop_front() {
                        self.completed_presses
                            .push_back((event.key.clone(), t_down, event.ts));
                        if self.completed_presses.len() > self.window {
                            self.completed_presses.pop_front();
                        }
                    }
                }
                None
            }
        }
    }

    fn compute_features(&self) -> KeyFeatures {
        let dwell: Vec<f64> = self
            .completed_presses
            .iter()
            .map(|(_, down, up)| (up - down) as f64)
            .filter(|d| *d >= 0.0)
            .collect();

        let mut flight: Vec<f64> = Vec::new();
        let presses: Vec<_> = self.completed_presses.iter().collect();
        for pair in presses.windows(2) {
            let (_, _, t_up_i) = pair[0];
            let (_, t_down_next, _) = pair[1];
            let gap = (t_down_next - t_up_i) as f64;
            if gap <= self.coffee_break_ms as f64 {
                flight.push(gap);
            }
        }

        let error_count = self
            .recent_down
            .iter()
            .filter(|k| k.as_str() == "Backspace" || k.as_str() == "Delete")
            .count();
        let error_rate = if self.recent_down.is_empty() {
            0.0
        } else {
            error_count as f64 / self.recent_down.len() as f64
        };

        let (dwell_mean, dwell_std) = mean_and_pop_std(&dwell);
        let (flight_mean, flight_std) = mean_and_pop_std(&flight);

        KeyFeatures {
            dwell_mean,
            dwell_std,
            flight_mean,
            flight_std,
            error_rate,
        }
    }
}

fn mean_and_pop_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(key: &str, ts: i64) -> KeyEvent {
        KeyEvent {
            key: key.to_string(),
            kind: KeyEventKind::Down,
            ts,
        }
    }

    fn up(key: &str, ts: i64) -> KeyEvent {
        KeyEvent {
            key: key.to_string(),
            kind: KeyEventKind::Up,
            ts,
        }
    }

    /// First emission at the 50th DOWN, thereafter every 5th.
    #[test]
    fn emits_at_window_then_every_stride() {
        let mut extractor = KeyboardExtractor::default();
        let mut emissions = 0;
        let mut ts = 0i64;
        for i in 0..120 {
            ts += 100;
            if extractor.step(&down(&format!("k{i}"), ts)).is_some() {
                emissions += 1;
            }
            ts += 50;
            extractor.step(&up(&format!("k{i}"), ts));
        }
        // 120 DOWN events: first emit at 50, then 55,60,...,120 -> (120-50)/5 + 1 = 15
        assert_eq!(emissions, 15);
    }

    #[test]
    fn discards_negative_dwell_and_long_flight() {
        let mut extractor = KeyboardExtractor::new(2, 1, 2000);
        extractor.step(&down("a", 1000));
        extractor.step(&up("a", 1010));
        let features = extractor.step(&down("b", 5000)).or_else(|| {
            extractor.step(&up("b", 5005))
        });
        assert!(features.is_some());
        let f = features.unwrap();
        // flight gap 5000 - 1010 = 3990 > 2000ms coffee break, excluded -> 0
        assert_eq!(f.flight_mean, 0.0);
    }

    #[test]
    fn error_rate_counts_backspace_and_delete() {
        let mut extractor = KeyboardExtractor::new(3, 1, 2000);
        extractor.step(&down("Backspace", 0));
        extractor.step(&up("Backspace", 10));
        extractor.step(&down("a", 20));
        extractor.step(&up("a", 30));
        let f = extractor.step(&down("Delete", 40)).unwrap();
        extractor.step(&up("Delete", 50));
        assert!((f.error_rate - (2.0 / 3.0)).abs() < 1e-9);
    }
}
