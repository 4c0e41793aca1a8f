//! Pure function from context metrics to a partial decision and anomaly
//! vectors. Grounded on the navigator policy engine, with the updated
//! 500 mph / 0.85 / 0.50 thresholds superseding its older normalization.

use crate::context::ContextMetrics;
use crate::domain::decision::Decision;

pub const IMPOSSIBLE_TRAVEL_MPH: f64 = 500.0;
pub const BLOCK_THRESHOLD: f64 = 0.85;
pub const CHALLENGE_THRESHOLD: f64 = 0.50;

#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub decision: Decision,
    pub risk: f64,
    pub anomaly_vectors: Vec<String>,
}

pub struct PolicyEngine;

impl PolicyEngine {
    pub fn evaluate(metrics: &ContextMetrics) -> PolicyVerdict {
        let mut anomaly_vectors = Vec::new();

        if metrics.geo_velocity_mph > IMPOSSIBLE_TRAVEL_MPH {
            anomaly_vectors.push("impossible_travel".to_string());
        }
        if metrics.device_ip_mismatch {
            anomaly_vectors.push("infra_mismatch".to_string());
        }
        if metrics.policy_violation {
            anomaly_vectors.push("policy_violation".to_string());
        }
        if metrics.is_unknown_user_agent {
            // Audit only: never inflates risk.
            anomaly_vectors.push("unknown_user_agent".to_string());
        }

        let velocity_risk = (metrics.geo_velocity_mph / IMPOSSIBLE_TRAVEL_MPH).min(1.0);
        let infra_risk = if metrics.device_ip_mismatch { 1.0 } else { 0.0 };
        let policy_risk = if metrics.policy_violation { 1.0 } else { 0.0 };
        let device_risk = if metrics.is_new_device { 0.5 } else { 0.0 };

        let risk = velocity_risk
            .max(infra_risk)
            .max(policy_risk)
            .max(device_risk)
            .clamp(0.0, 1.0);

        let decision = if risk >= BLOCK_THRESHOLD {
            Decision::Block
        } else if risk >= CHALLENGE_THRESHOLD {
            Decision::Challenge
        } else {
            Decision::Allow
        };

        PolicyVerdict {
            decision,
            risk,
            anomaly_vectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> ContextMetrics {
        ContextMetrics {
            geo_velocity_mph: 0.0,
            device_ip_mismatch: false,
            is_new_device: false,
            is_unknown_user_agent: false,
            policy_violation: false,
            ip_reputation: 0.0,
            simultaneous_sessions: 1,
            time_since_last_seen_ms: 0,
            current_geo_data: None,
        }
    }

    #[test]
    fn impossible_travel_blocks() {
        let mut m = metrics();
        m.geo_velocity_mph = 1000.0;
        let verdict = PolicyEngine::evaluate(&m);
        assert_eq!(verdict.decision, Decision::Block);
        assert_eq!(verdict.risk, 1.0);
        assert!(verdict.anomaly_vectors.contains(&"impossible_travel".to_string()));
    }

    #[test]
    fn unknown_user_agent_is_audit_only() {
        let mut m = metrics();
        m.is_unknown_user_agent = true;
        let verdict = PolicyEngine::evaluate(&m);
        assert_eq!(verdict.risk, 0.0);
        assert_eq!(verdict.decision, Decision::Allow);
        assert!(verdict.anomaly_vectors.contains(&"unknown_user_agent".to_string()));
    }

    #[test]
    fn clean_metrics_allow() {
        let verdict = PolicyEngine::evaluate(&metrics());
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(verdict.risk, 0.0);
    }
}
