//! Per-session and per-modality persisted state.
//!
//! Session + modality state live as three separate store keys but form one
//! logical transaction; `SessionStore::update_keyboard_atomic` /
//! `update_mouse_atomic` are the only places that write more than one key.

use super::decision::Decision;
use super::features::{KeyFeatures, MouseFeatures};
use serde::{Deserialize, Serialize};

pub const SESSION_TTL_SECS: i64 = 1800;
pub const PENDING_EVENTS_CAP: usize = 50;
pub const COMPLETED_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Normal,
    Challenge,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub mode: Mode,
    pub strikes: f64,
    pub consecutive_allows: u32,

    pub last_activity: i64,
    pub last_verified: Option<i64>,
    pub last_strike_decay: i64,
    pub challenge_entered: Option<i64>,
    pub last_context_change: i64,
    pub learning_suspended_until: Option<i64>,
    pub last_clean_activity: Option<i64>,

    pub last_keyboard_batch_id: i64,
    pub last_mouse_batch_id: i64,

    pub trust_score: f64,
    pub keyboard_window_count: u64,
    pub keyboard_first_window_ts: Option<i64>,
    pub identity_ready: bool,

    pub last_decision: Option<Decision>,
    pub last_risk: Option<f64>,
    pub last_eval_id: Option<String>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            mode: Mode::Normal,
            strikes: 0.0,
            consecutive_allows: 0,
            last_activity: now_ms,
            last_verified: None,
            last_strike_decay: now_ms,
            challenge_entered: None,
            last_context_change: now_ms,
            learning_suspended_until: None,
            last_clean_activity: None,
            last_keyboard_batch_id: 0,
            last_mouse_batch_id: 0,
            trust_score: 0.0,
            keyboard_window_count: 0,
            keyboard_first_window_ts: None,
            identity_ready: false,
            last_decision: None,
            last_risk: None,
            last_eval_id: None,
        }
    }

    pub fn is_learning_suspended(&self, now_ms: i64) -> bool {
        matches!(self.learning_suspended_until, Some(until) if now_ms < until)
    }
}

/// A completed keyboard feature window with its scored risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredWindow {
    pub features: KeyFeatures,
    pub risk: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredStroke {
    pub features: MouseFeatures,
    pub risk: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeyboardState {
    pub pending_events: Vec<super::events::KeyEvent>,
    pub completed_windows: Vec<ScoredWindow>,
    pub last_score: f64,
    pub last_event_ts: i64,
}

impl KeyboardState {
    pub fn push_window(&mut self, window: ScoredWindow) {
        self.completed_windows.push(window);
        if self.completed_windows.len() > COMPLETED_CAP {
            let overflow = self.completed_windows.len() - COMPLETED_CAP;
            self.completed_windows.drain(0..overflow);
        }
    }

    pub fn cap_pending(&mut self) {
        if self.pending_events.len() > PENDING_EVENTS_CAP {
            let overflow = self.pending_events.len() - PENDING_EVENTS_CAP;
            self.pending_events.drain(0..overflow);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MouseState {
    pub pending_events: Vec<super::events::MouseEvent>,
    pub completed_strokes: Vec<ScoredStroke>,
    pub last_score: f64,
    pub last_event_ts: i64,
    /// MouseSessionTracker strike count; once >= 3 the session is permanently flagged.
    pub bot_strikes: u32,
    pub flagged: bool,
}

impl MouseState {
    pub fn push_stroke(&mut self, stroke: ScoredStroke) {
        self.completed_strokes.push(stroke);
        if self.completed_strokes.len() > COMPLETED_CAP {
            let overflow = self.completed_strokes.len() - COMPLETED_CAP;
            self.completed_strokes.drain(0..overflow);
        }
    }

    pub fn cap_pending(&mut self) {
        if self.pending_events.len() > PENDING_EVENTS_CAP {
            let overflow = self.pending_events.len() - PENDING_EVENTS_CAP;
            self.pending_events.drain(0..overflow);
        }
    }

    /// +1 per risk=1 stroke, -1 per risk=0 stroke (floor 0); >=3 flags permanently.
    pub fn record_stroke_risk(&mut self, risk: f64) {
        if risk >= 1.0 {
            self.bot_strikes += 1;
        } else if risk <= 0.0 && self.bot_strikes > 0 {
            self.bot_strikes -= 1;
        }
        if self.bot_strikes >= 3 {
            self.flagged = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_completed_windows_at_twenty() {
        let mut state = KeyboardState::default();
        for i in 0..25 {
            state.push_window(ScoredWindow {
                features: KeyFeatures {
                    dwell_mean: 0.0,
                    dwell_std: 0.0,
                    flight_mean: 0.0,
                    flight_std: 0.0,
                    error_rate: 0.0,
                },
                risk: 0.0,
                ts: i,
            });
        }
        assert_eq!(state.completed_windows.len(), COMPLETED_CAP);
        assert_eq!(state.completed_windows.last().unwrap().ts, 24);
    }

    #[test]
    fn mouse_tracker_flags_after_three_bot_strokes() {
        let mut state = MouseState::default();
        for _ in 0..3 {
            state.record_stroke_risk(1.0);
        }
        assert!(state.flagged);
    }

    #[test]
    fn mouse_tracker_strikes_floor_at_zero() {
        let mut state = MouseState::default();
        state.record_stroke_risk(0.0);
        assert_eq!(state.bot_strikes, 0);
    }
}
