//! The `/evaluate` pipeline: idempotency, TOFU, learning-suspension upkeep,
//! strike decay, keyboard/trust confidence scaling, identity risk, the
//! hard-block cascade, weighted fusion, the cold-start HST override, and the
//! finalize step that updates mode/trust/strikes and trains the per-user
//! models under their safety gates.

use super::Orchestrator;
use crate::context::{ContextMetrics, RequestContext};
use crate::domain::decision::{Decision, EvaluateResponse};
use crate::domain::model::ModelType;
use crate::domain::session::Mode;
use crate::error::SentinelError;
use crate::policy::PolicyEngine;
use crate::scoring::hst_scorer;
use crate::store::trusted_context_store::TrustedContext;
use serde::Deserialize;

const STRIKE_DECAY_INTERVAL_MS: i64 = 10_000;
const STRIKE_DECAY_PER_INTERVAL: f64 = 0.5;
const STRIKE_DECAY_MAX_INTERVALS: i64 = 6;
const LEARNING_SUSPENSION_MS: i64 = 30_000;
const LEARNING_RECOVERY_MS: i64 = 60_000;
const TRUST_HALF_LIFE_SECS: f64 = 300.0;
const IDENTITY_MATURITY_WINDOWS: f64 = 150.0;
const KEYBOARD_MATURITY_MS: f64 = 20_000.0;
const KEYBOARD_MATURITY_COUNT: f64 = 15.0;
const HARD_BLOCK_MOUSE_EPSILON: f64 = 1e-9;
const IDENTITY_CONTRADICTION_RISK: f64 = 0.95;
const IDENTITY_IMMATURE_RISK: f64 = 0.98;
const IDENTITY_CONTRADICTION_CONFIDENCE: f64 = 0.6;
const TRUST_STABILIZER_BLOCK_IDENTITY_RISK: f64 = 0.9;
const TRUST_STABILIZER_GAIN: f64 = 0.12;
const TRUST_PROMOTION_THRESHOLD: f64 = 0.75;
const IDENTITY_LEARN_MIN_WINDOWS: usize = 3;
const IDENTITY_LEARN_MAX_WINDOWS: usize = 5;
const IDENTITY_LEARN_TRUST_MIN: f64 = 0.65;
const IDENTITY_LEARN_CONSECUTIVE_ALLOWS_MIN: u32 = 5;
const CONTEXT_STABILITY_MS: i64 = 30_000;
const HST_COLD_START_WINDOWS: u64 = 50;
const PROVISIONAL_BAN_ON_BLOCK: bool = true;

struct ModeParams {
    keyboard_weight: f64,
    mouse_weight: f64,
    navigator_weight: f64,
    identity_weight: f64,
    allow_threshold: f64,
    challenge_threshold: f64,
}

fn mode_params(mode: Mode) -> ModeParams {
    match mode {
        Mode::Normal => ModeParams {
            keyboard_weight: 0.70,
            mouse_weight: 0.90,
            navigator_weight: 1.00,
            identity_weight: 0.65,
            allow_threshold: 0.50,
            challenge_threshold: 0.85,
        },
        Mode::Challenge => ModeParams {
            keyboard_weight: 0.85,
            mouse_weight: 1.00,
            navigator_weight: 1.00,
            identity_weight: 0.85,
            allow_threshold: 0.40,
            challenge_threshold: 0.75,
        },
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestContextWire {
    pub ip_address: String,
    pub user_agent: String,
    pub endpoint: String,
    pub method: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusinessContext {
    pub service: String,
    pub action_type: String,
    pub resource_target: String,
    pub transaction_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientFingerprint {
    pub device_id: String,
    pub ja3_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    pub session_id: String,
    pub eval_id: Option<String>,
    pub request_context: RequestContextWire,
    pub business_context: BusinessContext,
    pub role: String,
    pub mfa_status: String,
    pub session_start_time: i64,
    pub client_fingerprint: Option<ClientFingerprint>,
}

pub type EvaluateOutcome = EvaluateResponse;

impl Orchestrator {
    pub async fn evaluate(&self, req: EvaluateRequest, now_ms: i64) -> Result<EvaluateOutcome, SentinelError> {
        if self.sessions.check_eval_rate_limit(&req.session_id, now_ms).await {
            return Err(SentinelError::RateLimited);
        }

        // 1. Idempotency: a previously processed eval_id short-circuits
        // everything else and returns the exact same payload.
        if let Some(eval_id) = req.eval_id.as_deref() {
            if self.sessions.is_eval_processed(eval_id).await.unwrap_or(false) {
                if let Ok(session) = self.sessions.get_or_create_session(&req.session_id, now_ms).await {
                    if session.last_eval_id.as_deref() == Some(eval_id) {
                        if let (Some(decision), Some(risk)) = (session.last_decision, session.last_risk) {
                            return Ok(EvaluateResponse { decision, risk, mode: session.mode });
                        }
                    }
                }
            }
        }

        // 2. Load session; a store failure here is the one case the whole
        // evaluate degrades to a fixed defensive response.
        let session = match self.sessions.get_or_create_session(&req.session_id, now_ms).await {
            Ok(s) => s,
            Err(_) => {
                return Ok(EvaluateResponse {
                    decision: Decision::Challenge,
                    risk: 0.5,
                    mode: Mode::Normal,
                })
            }
        };

        // 3. TTL refresh happens implicitly: every atomic session write below
        // re-sets the store's TTL.
        let keyboard_state = self.sessions.get_keyboard_state(&req.session_id).await.unwrap_or_default();
        let mouse_state = self.sessions.get_mouse_state(&req.session_id).await.unwrap_or_default();

        // 4. Context + policy.
        let trusted_ctx = self
            .trusted
            .get_trusted_context(&req.request_context.user_id)
            .await
            .unwrap_or_default();
        let known_devices = trusted_ctx.known_device_set();
        let device_id = req.client_fingerprint.as_ref().map(|f| f.device_id.clone());

        let request_ctx = RequestContext {
            ip_address: req.request_context.ip_address.clone(),
            user_agent: req.request_context.user_agent.clone(),
            role: req.role.clone(),
            resource_target: req.business_context.resource_target.clone(),
            device_id,
            // Geo-IP resolution is an out-of-scope external collaborator;
            // without it there are no current coordinates to compare.
            current_coords: None,
            simultaneous_sessions: 1,
            time_since_last_seen_ms: now_ms - session.last_activity,
        };
        let delta_t_ms = trusted_ctx.last_seen_ms.map(|last| now_ms - last).unwrap_or(i64::MAX);
        let metrics: ContextMetrics = self.context_deriver.derive(&request_ctx, trusted_ctx.last_coords, delta_t_ms, &known_devices);
        let policy_verdict = PolicyEngine::evaluate(&metrics);
        let nav_decision = policy_verdict.decision;
        let mut navigator_risk = policy_verdict.risk;

        // 5. TOFU: a brand-new user whose only risk driver was the
        // new-device flag (the neutral 0.5 default) is not penalized.
        let has_trusted_history = !trusted_ctx.known_devices.is_empty() || trusted_ctx.last_seen_ms.is_some();
        if !has_trusted_history && navigator_risk == 0.5 {
            navigator_risk = 0.0;
        }

        // 6. Learning-suspension update.
        let mut learning_suspended_until = session.learning_suspended_until;
        let mut last_clean_activity = session.last_clean_activity;
        if navigator_risk >= 0.85 {
            learning_suspended_until = Some(now_ms + LEARNING_SUSPENSION_MS);
            last_clean_activity = None;
        } else if navigator_risk < 0.5 {
            let streak_start = last_clean_activity.unwrap_or(now_ms);
            if last_clean_activity.is_none() {
                last_clean_activity = Some(now_ms);
            }
            if now_ms - streak_start >= LEARNING_RECOVERY_MS {
                learning_suspended_until = None;
            }
        } else {
            last_clean_activity = None;
        }

        // 7. Strike decay.
        let decay_intervals = ((now_ms - session.last_strike_decay) / STRIKE_DECAY_INTERVAL_MS)
            .clamp(0, STRIKE_DECAY_MAX_INTERVALS);
        let mut strikes = (session.strikes - STRIKE_DECAY_PER_INTERVAL * decay_intervals as f64).max(0.0);
        let last_strike_decay = if decay_intervals > 0 {
            session.last_strike_decay + decay_intervals * STRIKE_DECAY_INTERVAL_MS
        } else {
            session.last_strike_decay
        };

        // 8. Keyboard confidence scaling.
        let dt_since_first_window = session.keyboard_first_window_ts.map(|t| now_ms - t).unwrap_or(0);
        let keyboard_confidence = {
            let dt_component = (dt_since_first_window as f64 / KEYBOARD_MATURITY_MS).clamp(0.0, 1.0);
            let count_component = (session.keyboard_window_count as f64 / KEYBOARD_MATURITY_COUNT).clamp(0.0, 1.0);
            (dt_component * count_component).sqrt()
        };
        let keyboard_risk = keyboard_state.last_score * keyboard_confidence;

        // 9. Trust inactivity decay.
        let dt_since_verified = session.last_verified.map(|lv| now_ms - lv).unwrap_or(0);
        let mut trust_score = session.trust_score * (-(dt_since_verified as f64 / 1000.0) / TRUST_HALF_LIFE_SECS).exp();

        // 10. Identity risk.
        let identity_model = self.models.load(&req.request_context.user_id, ModelType::Identity).await.unwrap_or(None);
        let windows_snapshot = keyboard_state.completed_windows.clone();
        let recent_windows: Vec<_> = windows_snapshot.iter().rev().take(IDENTITY_LEARN_MAX_WINDOWS).collect();
        let (identity_risk, identity_confidence) = match &identity_model {
            Some(row) if recent_windows.len() >= IDENTITY_LEARN_MIN_WINDOWS => {
                let confidence = (row.feature_window_count as f64 / IDENTITY_MATURITY_WINDOWS).min(1.0);
                if confidence <= 0.0 {
                    (0.0, 0.0)
                } else {
                    let scorer = hst_scorer::decode_or_default(Some(row.blob.as_str()));
                    let scores: Vec<f64> = recent_windows.iter().map(|w| scorer.score_one(&w.features).0).collect();
                    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
                    (avg, confidence)
                }
            }
            _ => (0.0, 0.0),
        };

        // 11. Hard-block cascade, short-circuit, in order.
        let mut hard_decision: Option<(Decision, f64)> = None;
        if strikes >= 3.0 {
            hard_decision = Some((Decision::Block, 1.0));
            trust_score = 0.0;
        } else if mouse_state.last_score >= 1.0 - HARD_BLOCK_MOUSE_EPSILON || mouse_state.flagged {
            hard_decision = Some((Decision::Block, 1.0));
            trust_score = 0.0;
        } else if nav_decision == Decision::Block {
            hard_decision = Some((Decision::Block, navigator_risk.max(crate::policy::BLOCK_THRESHOLD)));
            trust_score = 0.0;
        } else if identity_confidence >= IDENTITY_CONTRADICTION_CONFIDENCE && identity_risk >= IDENTITY_CONTRADICTION_RISK {
            hard_decision = Some((Decision::Block, identity_risk));
            trust_score = 0.0;
        } else if session.identity_ready
            && identity_confidence < IDENTITY_CONTRADICTION_CONFIDENCE
            && identity_risk >= IDENTITY_IMMATURE_RISK
        {
            hard_decision = Some((Decision::Challenge, identity_risk));
        }

        // 12. Fusion.
        let trusted = trust_score >= TRUST_PROMOTION_THRESHOLD;
        let mut params = mode_params(session.mode);
        if trusted {
            params.allow_threshold = 0.60;
            params.challenge_threshold = 0.92;
            params.keyboard_weight *= 0.8;
            params.identity_weight *= 0.6;
        }
        let effective_identity_risk = identity_risk * identity_confidence;
        let identity_weight = params.identity_weight * identity_confidence.sqrt();
        let fused_risk = (keyboard_risk * params.keyboard_weight)
            .max(mouse_state.last_score * params.mouse_weight)
            .max(navigator_risk * params.navigator_weight)
            .max(effective_identity_risk * identity_weight)
            .clamp(0.0, 1.0);

        let (mut decision, mut risk) = match hard_decision {
            Some((d, r)) => (d, r),
            None => {
                let d = if fused_risk >= params.challenge_threshold {
                    Decision::Block
                } else if fused_risk >= params.allow_threshold {
                    Decision::Challenge
                } else {
                    Decision::Allow
                };
                (d, fused_risk)
            }
        };

        // 13. Cold-start HST override.
        let hst_model = self.models.load(&req.request_context.user_id, ModelType::Hst).await.unwrap_or(None);
        let hst_window_count = hst_model.as_ref().map(|m| m.feature_window_count).unwrap_or(0);
        let hst_cold = hst_window_count < HST_COLD_START_WINDOWS;
        if hst_cold && decision == Decision::Allow && windows_snapshot.is_empty() {
            decision = Decision::Challenge;
            risk = risk.max(params.allow_threshold);
        }

        // --- Finalize ---
        let mut consecutive_allows = session.consecutive_allows;
        match decision {
            Decision::Block => {
                strikes += 2.0;
                consecutive_allows = 0;
                trust_score = 0.0;
            }
            Decision::Challenge => {
                strikes += 1.0;
                consecutive_allows = 0;
            }
            Decision::Allow => {
                consecutive_allows += 1;
            }
        }

        let mut mode = session.mode;
        let mut challenge_entered = session.challenge_entered;
        match mode {
            Mode::Normal => {
                if decision != Decision::Allow {
                    mode = Mode::Challenge;
                    challenge_entered = Some(now_ms);
                    consecutive_allows = 0;
                }
            }
            Mode::Challenge => {
                let (h_allows, h_time) = if trusted { (3, 10_000) } else { (5, 20_000) };
                let time_in_challenge = challenge_entered.map(|t| now_ms - t).unwrap_or(0);
                if consecutive_allows >= h_allows && time_in_challenge >= h_time {
                    mode = Mode::Normal;
                    challenge_entered = None;
                }
            }
        }

        if identity_risk >= TRUST_STABILIZER_BLOCK_IDENTITY_RISK {
            trust_score = 0.0;
        } else {
            trust_score = (trust_score + TRUST_STABILIZER_GAIN * (0.5 - risk)).clamp(0.0, 1.0);
        }
        if decision == Decision::Block {
            trust_score = 0.0;
        }

        let suspended_now = learning_suspended_until.map(|u| now_ms < u).unwrap_or(false);
        let should_learn_hst = decision == Decision::Allow
            && (mode == Mode::Normal || hst_cold)
            && !suspended_now
            && !windows_snapshot.is_empty();
        let should_bootstrap_hst = decision == Decision::Challenge && hst_cold && !windows_snapshot.is_empty();

        let mut keyboard_window_delta = 0u64;
        if should_learn_hst || should_bootstrap_hst {
            let windows = windows_snapshot.clone();
            let count_delta = windows.len() as u64;
            let _ = self
                .models
                .learn_with_retry(&req.request_context.user_id, ModelType::Hst, &mut |blob, window_count| {
                    let mut scorer = if blob.is_empty() {
                        crate::scoring::HstScorer::with_defaults()
                    } else {
                        hst_scorer::decode_or_default(Some(blob.as_str()))
                    };
                    for w in &windows {
                        scorer.learn_one(&w.features);
                    }
                    let encoded = hst_scorer::encode(&scorer).unwrap_or_else(|_| blob.clone());
                    (encoded, window_count + count_delta)
                })
                .await;
            keyboard_window_delta = count_delta;
        }

        let should_learn_identity = decision == Decision::Allow
            && mode == Mode::Normal
            && !suspended_now
            && navigator_risk < 0.5
            && trust_score >= IDENTITY_LEARN_TRUST_MIN
            && consecutive_allows >= IDENTITY_LEARN_CONSECUTIVE_ALLOWS_MIN
            && (now_ms - session.last_context_change) >= CONTEXT_STABILITY_MS;
        if should_learn_identity {
            let recent: Vec<_> = windows_snapshot.iter().rev().take(IDENTITY_LEARN_MAX_WINDOWS).cloned().collect();
            if recent.len() >= IDENTITY_LEARN_MIN_WINDOWS {
                let count_delta = recent.len() as u64;
                let _ = self
                    .models
                    .learn_with_retry(&req.request_context.user_id, ModelType::Identity, &mut |blob, window_count| {
                        let mut scorer = if blob.is_empty() {
                            crate::scoring::HstScorer::with_defaults()
                        } else {
                            hst_scorer::decode_or_default(Some(blob.as_str()))
                        };
                        for w in &recent {
                            scorer.learn_one(&w.features);
                        }
                        let encoded = hst_scorer::encode(&scorer).unwrap_or_else(|_| blob.clone());
                        (encoded, window_count + count_delta)
                    })
                    .await;
            }
        }
        let identity_ready = session.identity_ready || should_learn_identity;

        if decision == Decision::Allow && mode == Mode::Normal {
            if let Some(fp) = &req.client_fingerprint {
                let mut ctx: TrustedContext = trusted_ctx.clone();
                ctx.remember_device(&fp.device_id);
                ctx.last_ip = Some(req.request_context.ip_address.clone());
                ctx.last_coords = metrics.current_geo_data.or(ctx.last_coords);
                ctx.last_seen_ms = Some(now_ms);
                let _ = self.trusted.save_trusted_context(&req.request_context.user_id, &ctx).await;
            }
        }

        if should_learn_hst || should_bootstrap_hst {
            let _ = self
                .sessions
                .update_keyboard_atomic(&req.session_id, &mut |s| {
                    s.completed_windows.clear();
                    s.last_score = 0.0;
                })
                .await;
        }

        let eval_id_for_session = req.eval_id.clone();
        let final_decision = decision;
        let final_risk = risk;
        let _ = self
            .sessions
            .update_session_atomic(&req.session_id, &mut |s| {
                s.mode = mode;
                s.strikes = strikes;
                s.consecutive_allows = consecutive_allows;
                s.trust_score = trust_score;
                s.last_verified = Some(now_ms);
                s.last_strike_decay = last_strike_decay;
                s.challenge_entered = challenge_entered;
                s.learning_suspended_until = learning_suspended_until;
                s.last_clean_activity = last_clean_activity;
                s.last_decision = Some(final_decision);
                s.last_risk = Some(final_risk);
                s.last_eval_id = eval_id_for_session.clone();
                s.identity_ready = identity_ready;
                s.keyboard_window_count += keyboard_window_delta;
                if final_decision == Decision::Block {
                    s.trust_score = 0.0;
                }
            })
            .await;

        if let Some(eval_id) = &req.eval_id {
            let _ = self.sessions.mark_eval_processed(eval_id, now_ms).await;
        }

        if PROVISIONAL_BAN_ON_BLOCK && decision == Decision::Block {
            let _ = self.sessions.mark_provisional_ban(&req.request_context.user_id, now_ms).await;
        }

        tracing::info!(
            correlation_id = req.eval_id.as_deref().unwrap_or(""),
            session_id = %req.session_id,
            user_id = %req.request_context.user_id,
            decision = ?decision,
            risk,
            mode = mode.as_wire(),
            anomaly_vectors = ?policy_verdict.anomaly_vectors,
            "evaluate decision"
        );

        Ok(EvaluateResponse { decision, risk, mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryModelStore, InMemorySessionStore, InMemoryTrustedContextStore};
    use std::sync::Arc;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryModelStore::new()),
            Arc::new(InMemoryTrustedContextStore::new()),
        )
    }

    fn request(session_id: &str, user_id: &str, eval_id: Option<&str>) -> EvaluateRequest {
        EvaluateRequest {
            session_id: session_id.to_string(),
            eval_id: eval_id.map(|s| s.to_string()),
            request_context: RequestContextWire {
                ip_address: "192.168.1.10".to_string(),
                user_agent: "Mozilla/5.0 (Windows NT 10.0)".to_string(),
                endpoint: "/transfer".to_string(),
                method: "POST".to_string(),
                user_id: user_id.to_string(),
            },
            business_context: BusinessContext {
                service: "payments".to_string(),
                action_type: "transfer".to_string(),
                resource_target: "account-123".to_string(),
                transaction_details: None,
            },
            role: "analyst".to_string(),
            mfa_status: "verified".to_string(),
            session_start_time: 0,
            client_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn cold_start_never_seen_user_challenges() {
        let orch = orchestrator();
        let response = orch.evaluate(request("s1", "u1", None), 1_000).await.unwrap();
        assert_eq!(response.decision, Decision::Challenge);
    }

    #[tokio::test]
    async fn idempotent_eval_returns_cached_payload() {
        let orch = orchestrator();
        let first = orch.evaluate(request("s1", "u1", Some("e1")), 1_000).await.unwrap();
        let second = orch.evaluate(request("s1", "u1", Some("e1")), 5_000).await.unwrap();
        assert_eq!(first.decision, second.decision);
        assert_eq!(first.risk, second.risk);
        assert_eq!(first.mode, second.mode);
    }

    #[tokio::test]
    async fn three_strikes_forces_block_and_zeroes_trust() {
        let orch = orchestrator();
        orch.sessions
            .update_session_atomic("s1", &mut |s| {
                s.strikes = 3.0;
                s.trust_score = 0.9;
            })
            .await
            .unwrap();
        let response = orch.evaluate(request("s1", "u1", None), 1_000).await.unwrap();
        assert_eq!(response.decision, Decision::Block);
        let session = orch.sessions.get_or_create_session("s1", 2_000).await.unwrap();
        assert_eq!(session.trust_score, 0.0);
    }
}
