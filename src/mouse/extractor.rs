//! Segments raw mouse events into strokes terminated by CLICK or a pause,
//! dropping inter-event segments that fail the physical-plausibility filter.
//!
//! Like `KeyboardExtractor`, a fresh instance is built per batch and replayed
//! through stored pending events before new ones are applied.

use crate::domain::events::{MouseEvent, MouseEventKind};
use crate::domain::features::MouseFeatures;
use std::f64::consts::PI;

pub const MIN_SEGMENT_DISTANCE_PX: f64 = 3.0;
pub const MIN_SEGMENT_DT_MS: f64 = 4.0;
pub const MAX_SEGMENT_DT_MS: f64 = 2000.0;
pub const MAX_SEGMENT_VELOCITY: f64 = 8.0;
pub const PAUSE_THRESHOLD_MS: f64 = 500.0;
pub const MIN_STROKE_SEGMENTS: usize = 10;
pub const MIN_STROKE_PATH_DISTANCE: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct Segment {
    distance: f64,
    dt: f64,
    velocity: f64,
    angle: f64,
}

#[derive(Debug, Clone)]
pub struct MouseExtractor {
    last_event: Option<(f64, f64, i64)>,
    segments: Vec<Segment>,
    points: Vec<(f64, f64)>,
}

impl Default for MouseExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MouseExtractor {
    pub fn new() -> Self {
        Self {
            last_event: None,
            segments: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Feed one raw event. Returns the accepted stroke's features, if this
    /// event terminated a stroke that met the minimum segment/distance bar.
    pub fn step(&mut self, event: &MouseEvent) -> Option<MouseFeatures> {
        let (x, y, ts) = (event.x as f64, event.y as f64, event.ts);

        let mut terminated = None;

        if let Some((lx, ly, lts)) = self.last_event {
            let dt = (ts - lts) as f64;

            if dt > PAUSE_THRESHOLD_MS {
                // Pause: terminate whatever stroke we had, without scoring a
                // segment across the gap. This event starts a fresh stroke.
                terminated = self.terminate();
                self.points.clear();
                self.points.push((x, y));
            } else {
                let dx = x - lx;
                let dy = y - ly;
                let distance = (dx * dx + dy * dy).sqrt();
                let velocity = if dt > 0.0 { distance / dt } else { f64::INFINITY };

                if distance >= MIN_SEGMENT_DISTANCE_PX
                    && dt >= MIN_SEGMENT_DT_MS
                    && dt <= MAX_SEGMENT_DT_MS
                    && velocity <= MAX_SEGMENT_VELOCITY
                {
                    if self.points.is_empty() {
                        self.points.push((lx, ly));
                    }
                    self.segments.push(Segment {
                        distance,
                        dt,
                        velocity,
                        angle: dy.atan2(dx),
                    });
                    self.points.push((x, y));
                }
                // Invalid segments are silently dropped; the stroke keeps
                // accumulating and this event still becomes `last_event`.
            }
        } else {
            self.points.push((x, y));
        }

        self.last_event = Some((x, y, ts));

        if event.kind == MouseEventKind::Click {
            let click_terminated = self.terminate();
            self.points.clear();
            self.points.push((x, y));
            terminated = terminated.or(click_terminated);
        }

        terminated
    }

    /// Evaluate the accumulated stroke for acceptance and reset for the next
    /// one. Returns `Some(features)` iff the stroke met the minimum bar.
    fn terminate(&mut self) -> Option<MouseFeatures> {
        let segments = std::mem::take(&mut self.segments);
        let points = std::mem::take(&mut self.points);

        if segments.len() < MIN_STROKE_SEGMENTS {
            return None;
        }
        let path_distance: f64 = segments.iter().map(|s| s.distance).sum();
        if path_distance < MIN_STROKE_PATH_DISTANCE {
            return None;
        }

        Some(compute_features(&segments, &points, path_distance))
    }

    /// Force-evaluate any in-flight stroke, e.g. at end of a batch before
    /// persisting remaining pending state. Does not reset `last_event`.
    pub fn flush(&mut self) -> Option<MouseFeatures> {
        self.terminate()
    }
}

fn compute_features(segments: &[Segment], points: &[(f64, f64)], path_distance: f64) -> MouseFeatures {
    let velocities: Vec<f64> = segments.iter().map(|s| s.velocity).collect();
    let angles: Vec<f64> = segments.iter().map(|s| s.angle).collect();
    let dts: Vec<f64> = segments.iter().map(|s| s.dt).collect();

    let (velocity_mean, velocity_std) = mean_and_pop_std(&velocities);
    let velocity_max = percentile_95(&velocities);
    let (angle_mean, angle_std) = circular_mean_std(&angles);
    let (_dt_mean, time_diff_std) = mean_and_pop_std(&dts);

    let curvatures: Vec<f64> = angles
        .windows(2)
        .map(|pair| angular_diff(pair[0], pair[1]).abs())
        .collect();
    let (curvature_mean, curvature_std) = mean_and_pop_std(&curvatures);

    let trajectory_efficiency = if let (Some(&start), Some(&end)) = (points.first(), points.last()) {
        if path_distance > 0.0 {
            (straight_distance(start, end) / path_distance).clamp(0.0, 1.0)
        } else {
            0.0
        }
    } else {
        0.0
    };

    let linearity_error = if points.len() > 2 {
        let start = points[0];
        let end = *points.last().unwrap();
        let intermediate = &points[1..points.len() - 1];
        let distances: Vec<f64> = intermediate
            .iter()
            .map(|p| perpendicular_distance(*p, start, end))
            .collect();
        distances.iter().sum::<f64>() / distances.len() as f64
    } else {
        0.0
    };

    MouseFeatures {
        velocity_mean,
        velocity_std,
        velocity_max,
        angle_mean,
        angle_std,
        curvature_mean,
        curvature_std,
        trajectory_efficiency,
        path_distance,
        linearity_error,
        time_diff_std,
        segment_count: segments.len(),
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

fn percentile_95(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = (0.95 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn circular_mean_std(angles: &[f64]) -> (f64, f64) {
    if angles.is_empty() {
        return (0.0, 0.0);
    }
    let n = angles.len() as f64;
    let sum_sin: f64 = angles.iter().map(|a| a.sin()).sum();
    let sum_cos: f64 = angles.iter().map(|a| a.cos()).sum();
    let mean = sum_sin.atan2(sum_cos);
    let r = ((sum_sin * sum_sin + sum_cos * sum_cos).sqrt() / n).clamp(0.0, 1.0);
    let std = (-2.0 * r.ln()).max(0.0).sqrt();
    (mean, std)
}

fn angular_diff(a: f64, b: f64) -> f64 {
    let mut diff = b - a;
    while diff > PI {
        diff -= 2.0 * PI;
    }
    while diff < -PI {
        diff += 2.0 * PI;
    }
    diff
}

fn straight_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt()
}

fn perpendicular_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (x0, y0) = p;
    let (x1, y1) = a;
    let (x2, y2) = b;
    let chord_len = straight_distance(a, b);
    if chord_len == 0.0 {
        return straight_distance(p, a);
    }
    ((y2 - y1) * x0 - (x2 - x1) * y0 + x2 * y1 - y2 * x1).abs() / chord_len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(x: i32, y: i32, ts: i64) -> MouseEvent {
        MouseEvent {
            x,
            y,
            kind: MouseEventKind::Move,
            ts,
        }
    }

    fn click(x: i32, y: i32, ts: i64) -> MouseEvent {
        MouseEvent {
            x,
            y,
            kind: MouseEventKind::Click,
            ts,
        }
    }

    #[test]
    fn accepts_stroke_meeting_segment_and_distance_bar() {
        let mut extractor = MouseExtractor::new();
        let mut ts = 0i64;
        let mut features = None;
        for i in 0..12 {
            ts += 20;
            let ev = mv(i * 10, 0, ts);
            if let Some(f) = extractor.step(&ev) {
                features = Some(f);
            }
        }
        let done = extractor.step(&click(120, 0, ts + 20));
        let features = features.or(done);
        assert!(features.is_some());
        let f = features.unwrap();
        assert!(f.segment_count >= MIN_STROKE_SEGMENTS);
        assert!(f.path_distance >= MIN_STROKE_PATH_DISTANCE);
    }

    #[test]
    fn discards_short_stroke() {
        let mut extractor = MouseExtractor::new();
        extractor.step(&mv(0, 0, 0));
        extractor.step(&mv(10, 0, 20));
        let result = extractor.step(&click(20, 0, 40));
        assert!(result.is_none());
    }

    #[test]
    fn drops_implausibly_fast_segment() {
        let mut extractor = MouseExtractor::new();
        extractor.step(&mv(0, 0, 0));
        // velocity = 1000px / 10ms = 100 px/ms, far above the 8 px/ms ceiling
        let result = extractor.step(&mv(1000, 0, 10));
        assert!(result.is_none());
    }

    #[test]
    fn pause_terminates_without_scoring_the_gap_segment() {
        let mut extractor = MouseExtractor::new();
        let mut ts = 0i64;
        for i in 0..12 {
            ts += 20;
            extractor.step(&mv(i * 10, 0, ts));
        }
        // long pause before the next event
        let result = extractor.step(&mv(500, 500, ts + 1000));
        assert!(result.is_some());
    }
}
