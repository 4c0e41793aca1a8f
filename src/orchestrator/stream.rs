//! Shared stream-ingest skeleton for both keyboard and mouse endpoints:
//! enforce the batch high-water mark, replay stored pending events through a
//! fresh extractor (capturing any window/stroke the replay itself completes),
//! score what emerges against the user's persisted HST model (read-only —
//! learning happens later out of `ModelStore`), apply score decay, and commit
//! the session + modality state atomically.

use super::Orchestrator;
use crate::domain::events::{KeyEvent, MouseEvent};
use crate::domain::features::{KeyFeatures, MouseFeatures};
use crate::domain::model::ModelType;
use crate::domain::session::{KeyboardState, MouseState, ScoredStroke, ScoredWindow};
use crate::error::SentinelError;
use crate::keyboard::KeyboardExtractor;
use crate::mouse::MouseExtractor;
use crate::scoring::hst_scorer;

/// Score decay time constant (§4.10 step 5): `prev_score * exp(-Δt/τ)`.
const DECAY_TAU_SECS: f64 = 45.0;
/// Batch id gap beyond which a modality's state is reset rather than replayed.
const GAP_TOLERANCE: i64 = 10;
/// Strike added when a gap reset fires.
const GAP_RESET_STRIKE: f64 = 0.5;

pub struct KeyboardStreamRequest {
    pub session_id: String,
    pub user_id: String,
    pub batch_id: i64,
    pub events: Vec<KeyEvent>,
}

pub struct MouseStreamRequest {
    pub session_id: String,
    pub user_id: String,
    pub batch_id: i64,
    pub events: Vec<MouseEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub accepted: bool,
}

fn decay(prev_score: f64, delta_t_ms: i64, suspended: bool) -> f64 {
    if suspended || delta_t_ms <= 0 {
        return prev_score;
    }
    prev_score * (-(delta_t_ms as f64 / 1000.0) / DECAY_TAU_SECS).exp()
}

/// Replays `pending` (oldest-to-newest) through a fresh extractor, capturing
/// every emission, then continues stepping the same extractor over
/// `new_events` — the emission cut tracks position across *both* loops, not
/// just the replay loop, since a window/stroke just as easily completes on a
/// freshly arrived event as on a replayed one. Returns (all features emitted
/// this call, the suffix of `pending ++ new_events` following the last
/// emission — the only events still owed to the next batch).
fn replay_keyboard(pending: &[KeyEvent], new_events: &[KeyEvent]) -> (Vec<KeyFeatures>, Vec<KeyEvent>) {
    let mut extractor = KeyboardExtractor::default();
    let mut emitted = Vec::new();
    let mut last_emit_index = 0usize;
    let mut seen = 0usize;
    for ev in pending.iter().chain(new_events.iter()) {
        seen += 1;
        if let Some(features) = extractor.step(ev) {
            emitted.push(features);
            last_emit_index = seen;
        }
    }
    let remaining: Vec<KeyEvent> = pending
        .iter()
        .chain(new_events.iter())
        .skip(last_emit_index)
        .cloned()
        .collect();
    (emitted, remaining)
}

fn replay_mouse(pending: &[MouseEvent], new_events: &[MouseEvent]) -> (Vec<MouseFeatures>, Vec<MouseEvent>) {
    let mut extractor = MouseExtractor::default();
    let mut emitted = Vec::new();
    let mut last_emit_index = 0usize;
    let mut seen = 0usize;
    for ev in pending.iter().chain(new_events.iter()) {
        seen += 1;
        if let Some(features) = extractor.step(ev) {
            emitted.push(features);
            last_emit_index = seen;
        }
    }
    let remaining: Vec<MouseEvent> = pending
        .iter()
        .chain(new_events.iter())
        .skip(last_emit_index)
        .cloned()
        .collect();
    (emitted, remaining)
}

impl Orchestrator {
    pub async fn ingest_keyboard(&self, req: KeyboardStreamRequest, now_ms: i64) -> Result<StreamOutcome, SentinelError> {
        if req.batch_id < 1 {
            return Err(SentinelError::ValidationError("batch_id must be >= 1".to_string()));
        }
        if self.sessions.check_stream_rate_limit(&req.session_id, now_ms).await {
            return Err(SentinelError::RateLimited);
        }

        let session = self.sessions.get_or_create_session(&req.session_id, now_ms).await?;
        if req.batch_id <= session.last_keyboard_batch_id {
            return Err(SentinelError::ReplayAttack(format!(
                "batch_id {} <= last seen {}",
                req.batch_id, session.last_keyboard_batch_id
            )));
        }
        let gap = req.batch_id - session.last_keyboard_batch_id;

        let mut keyboard_state = self.sessions.get_keyboard_state(&req.session_id).await?;
        if gap > GAP_TOLERANCE {
            keyboard_state = KeyboardState::default();
            let _ = self
                .sessions
                .update_session_atomic(&req.session_id, &mut |s| {
                    s.strikes += GAP_RESET_STRIKE;
                    s.keyboard_window_count = 0;
                })
                .await;
        }

        let (emitted, remaining_pending) = replay_keyboard(&keyboard_state.pending_events, &req.events);

        let stored_model = self.models.load(&req.user_id, ModelType::Hst).await.unwrap_or(None);
        let scorer = hst_scorer::decode_or_default(stored_model.as_ref().map(|m| m.blob.as_str()));

        let suspended = session.is_learning_suspended(now_ms);
        let mut last_score = decay(keyboard_state.last_score, now_ms - keyboard_state.last_event_ts, suspended);
        for features in &emitted {
            let (risk, _tags) = scorer.score_one(features);
            last_score = last_score.max(risk);
            keyboard_state.push_window(ScoredWindow {
                features: features.clone(),
                risk,
                ts: now_ms,
            });
        }
        keyboard_state.last_score = last_score;
        keyboard_state.last_event_ts = now_ms;

        keyboard_state.pending_events = remaining_pending;
        keyboard_state.cap_pending();

        let window_delta = emitted.len() as u64;
        let commit = self
            .sessions
            .update_keyboard_atomic(&req.session_id, &mut |state| {
                *state = keyboard_state.clone();
            })
            .await;
        if let Err(e) = commit {
            log_advisory_failure("keyboard stream commit", &e);
        }

        let session_commit = self
            .sessions
            .update_session_atomic(&req.session_id, &mut |s| {
                s.last_activity = now_ms;
                s.last_keyboard_batch_id = req.batch_id;
                s.keyboard_window_count += window_delta;
                if s.keyboard_first_window_ts.is_none() && window_delta > 0 {
                    s.keyboard_first_window_ts = Some(now_ms);
                }
            })
            .await;
        if let Err(e) = session_commit {
            log_advisory_failure("keyboard session commit", &e);
        }

        Ok(StreamOutcome { accepted: true })
    }

    pub async fn ingest_mouse(&self, req: MouseStreamRequest, now_ms: i64) -> Result<StreamOutcome, SentinelError> {
        if req.batch_id < 1 {
            return Err(SentinelError::ValidationError("batch_id must be >= 1".to_string()));
        }
        if self.sessions.check_stream_rate_limit(&req.session_id, now_ms).await {
            return Err(SentinelError::RateLimited);
        }

        let session = self.sessions.get_or_create_session(&req.session_id, now_ms).await?;
        if req.batch_id <= session.last_mouse_batch_id {
            return Err(SentinelError::ReplayAttack(format!(
                "batch_id {} <= last seen {}",
                req.batch_id, session.last_mouse_batch_id
            )));
        }
        let gap = req.batch_id - session.last_mouse_batch_id;

        let mut mouse_state = self.sessions.get_mouse_state(&req.session_id).await?;
        if gap > GAP_TOLERANCE {
            mouse_state = MouseState::default();
            let _ = self
                .sessions
                .update_session_atomic(&req.session_id, &mut |s| {
                    s.strikes += GAP_RESET_STRIKE;
                })
                .await;
        }

        let (emitted, remaining_pending) = replay_mouse(&mouse_state.pending_events, &req.events);

        let suspended = session.is_learning_suspended(now_ms);
        let mut last_score = decay(mouse_state.last_score, now_ms - mouse_state.last_event_ts, suspended);
        for features in &emitted {
            let verdict = crate::scoring::PhysicsScorer::score(features);
            last_score = last_score.max(verdict.risk);
            mouse_state.record_stroke_risk(verdict.risk);
            mouse_state.push_stroke(ScoredStroke {
                features: features.clone(),
                risk: verdict.risk,
                ts: now_ms,
            });
        }
        mouse_state.last_score = last_score;
        mouse_state.last_event_ts = now_ms;

        mouse_state.pending_events = remaining_pending;
        mouse_state.cap_pending();

        let commit = self
            .sessions
            .update_mouse_atomic(&req.session_id, &mut |state| {
                *state = mouse_state.clone();
            })
            .await;
        if let Err(e) = commit {
            log_advisory_failure("mouse stream commit", &e);
        }

        let session_commit = self
            .sessions
            .update_session_atomic(&req.session_id, &mut |s| {
                s.last_activity = now_ms;
                s.last_mouse_batch_id = req.batch_id;
            })
            .await;
        if let Err(e) = session_commit {
            log_advisory_failure("mouse session commit", &e);
        }

        Ok(StreamOutcome { accepted: true })
    }
}

/// Stream writes are advisory: a dropped CAS or an unreachable store must
/// never surface to the client. Log and move on.
fn log_advisory_failure(where_: &str, err: &SentinelError) {
    tracing::warn!(stage = where_, error = %err, "stream commit dropped, advisory only");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::KeyEventKind;
    use crate::store::{InMemoryModelStore, InMemorySessionStore, InMemoryTrustedContextStore};
    use std::sync::Arc;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryModelStore::new()),
            Arc::new(InMemoryTrustedContextStore::new()),
        )
    }

    fn down_up(key: &str, t_down: i64, t_up: i64) -> Vec<KeyEvent> {
        vec![
            KeyEvent { key: key.to_string(), kind: KeyEventKind::Down, ts: t_down },
            KeyEvent { key: key.to_string(), kind: KeyEventKind::Up, ts: t_up },
        ]
    }

    #[tokio::test]
    async fn rejects_replayed_batch_id() {
        let orch = orchestrator();
        let req = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 5,
            events: down_up("a", 0, 50),
        };
        orch.ingest_keyboard(req, 1_000).await.unwrap();

        let replay = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 5,
            events: down_up("a", 0, 50),
        };
        let result = orch.ingest_keyboard(replay, 2_000).await;
        assert!(matches!(result, Err(SentinelError::ReplayAttack(_))));
    }

    #[tokio::test]
    async fn accepts_monotonically_increasing_batch_ids() {
        let orch = orchestrator();
        for batch_id in 1..=3 {
            let req = KeyboardStreamRequest {
                session_id: "s1".to_string(),
                user_id: "u1".to_string(),
                batch_id,
                events: down_up("a", batch_id * 100, batch_id * 100 + 50),
            };
            let outcome = orch.ingest_keyboard(req, 1_000 * batch_id).await.unwrap();
            assert!(outcome.accepted);
        }
    }

    #[tokio::test]
    async fn gap_beyond_tolerance_adds_half_strike() {
        let orch = orchestrator();
        let first = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 1,
            events: down_up("a", 0, 50),
        };
        orch.ingest_keyboard(first, 1_000).await.unwrap();

        let jump = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 50,
            events: down_up("a", 5_000, 5_050),
        };
        orch.ingest_keyboard(jump, 6_000).await.unwrap();

        let session = orch.sessions.get_or_create_session("s1", 7_000).await.unwrap();
        assert_eq!(session.strikes, 0.5);
    }

    /// A batch of exactly 50 DOWN/UP pairs crosses the window boundary on its
    /// very last DOWN, inside the new-events phase rather than the replay
    /// phase. The window must not be retained for replay, and the next
    /// batch must not re-emit (and re-score) it.
    #[tokio::test]
    async fn replay_does_not_double_emit_on_new_event_boundary() {
        let orch = orchestrator();
        let mut events = Vec::new();
        let mut ts = 0i64;
        for i in 0..50 {
            events.push(KeyEvent { key: format!("k{i}"), kind: KeyEventKind::Down, ts });
            ts += 10;
            events.push(KeyEvent { key: format!("k{i}"), kind: KeyEventKind::Up, ts });
            ts += 10;
        }
        let first = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 1,
            events,
        };
        orch.ingest_keyboard(first, 1_000).await.unwrap();

        let session_after_first = orch.sessions.get_or_create_session("s1", 1_000).await.unwrap();
        assert_eq!(session_after_first.keyboard_window_count, 1);

        let second = KeyboardStreamRequest {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            batch_id: 2,
            events: down_up("z", ts + 100, ts + 150),
        };
        orch.ingest_keyboard(second, 2_000).await.unwrap();

        let session_after_second = orch.sessions.get_or_create_session("s1", 2_000).await.unwrap();
        assert_eq!(
            session_after_second.keyboard_window_count, 1,
            "the 50-event window emitted on the first batch must not replay and re-emit on the second"
        );
    }
}
