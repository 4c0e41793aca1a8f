//! Enriches a request plus user history into numeric risk metrics only.
//! No decisions, no blocking — that is `PolicyEngine`'s job.

use super::geo::{velocity_mph, Coords};
use super::useragent::{AsnClassifier, DeviceClass, HeuristicAsnClassifier, HeuristicUserAgentParser, UserAgentParser};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    fn to_coords(self) -> Coords {
        Coords {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip_address: String,
    pub user_agent: String,
    pub role: String,
    pub resource_target: String,
    pub device_id: Option<String>,
    /// Resolved current coordinates, if a geo lookup was available; the geo
    /// product itself is out of scope, so this is supplied by the caller
    /// (None is a neutral default, matching private-IP / lookup-failure
    /// behavior).
    pub current_coords: Option<GeoPoint>,
    pub simultaneous_sessions: u32,
    pub time_since_last_seen_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ContextMetrics {
    pub geo_velocity_mph: f64,
    pub device_ip_mismatch: bool,
    pub is_new_device: bool,
    pub is_unknown_user_agent: bool,
    pub policy_violation: bool,
    pub ip_reputation: f64,
    pub simultaneous_sessions: u32,
    pub time_since_last_seen_ms: i64,
    pub current_geo_data: Option<GeoPoint>,
}

pub struct ContextDeriver<U: UserAgentParser = HeuristicUserAgentParser, A: AsnClassifier = HeuristicAsnClassifier> {
    ua_parser: U,
    asn_classifier: A,
}

impl Default for ContextDeriver {
    fn default() -> Self {
        Self {
            ua_parser: HeuristicUserAgentParser,
            asn_classifier: HeuristicAsnClassifier,
        }
    }
}

impl<U: UserAgentParser, A: AsnClassifier> ContextDeriver<U, A> {
    pub fn new(ua_parser: U, asn_classifier: A) -> Self {
        Self { ua_parser, asn_classifier }
    }

    pub fn derive(
        &self,
        ctx: &RequestContext,
        last_coords: Option<GeoPoint>,
        delta_t_ms: i64,
        known_devices: &HashSet<String>,
    ) -> ContextMetrics {
        let parsed_ua = self.ua_parser.parse(&ctx.user_agent);
        let asn = self.asn_classifier.classify(&ctx.ip_address);

        let geo_velocity_mph = velocity_mph(
            last_coords.map(GeoPoint::to_coords),
            ctx.current_coords.map(GeoPoint::to_coords),
            delta_t_ms,
        );

        let device_ip_mismatch = parsed_ua.device_class == DeviceClass::Desktop && asn.is_infra();

        let is_new_device = match &ctx.device_id {
            None => false,
            Some(id) => !known_devices.contains(id),
        };

        let is_unknown_user_agent = parsed_ua.is_bot || parsed_ua.family == "Other";

        let policy_violation = Self::policy_violation(&ctx.role, &ctx.resource_target);

        ContextMetrics {
            geo_velocity_mph,
            device_ip_mismatch,
            is_new_device,
            is_unknown_user_agent,
            policy_violation,
            ip_reputation: asn.ip_reputation(),
            simultaneous_sessions: ctx.simultaneous_sessions,
            time_since_last_seen_ms: ctx.time_since_last_seen_ms,
            current_geo_data: ctx.current_coords,
        }
    }

    fn policy_violation(role: &str, target: &str) -> bool {
        let role = role.to_lowercase();
        let target = target.to_lowercase();
        (role == "intern" && target.contains("prod"))
            || (role == "viewer" && target.contains("admin"))
            || (role == "analyst" && target.contains("secret"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: &str, target: &str) -> RequestContext {
        RequestContext {
            ip_address: "192.168.1.1".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0)".to_string(),
            role: role.to_string(),
            resource_target: target.to_string(),
            device_id: None,
            current_coords: None,
            simultaneous_sessions: 1,
            time_since_last_seen_ms: 0,
        }
    }

    #[test]
    fn intern_targeting_prod_is_a_policy_violation() {
        let deriver = ContextDeriver::default();
        let metrics = deriver.derive(&ctx("intern", "prod-db-migrate"), None, 0, &HashSet::new());
        assert!(metrics.policy_violation);
    }

    #[test]
    fn missing_device_id_does_not_count_as_new() {
        let deriver = ContextDeriver::default();
        let metrics = deriver.derive(&ctx("analyst", "dashboard"), None, 0, &HashSet::new());
        assert!(!metrics.is_new_device);
    }

    #[test]
    fn known_device_is_not_new() {
        let deriver = ContextDeriver::default();
        let mut request = ctx("analyst", "dashboard");
        request.device_id = Some("dev-1".to_string());
        let mut known = HashSet::new();
        known.insert("dev-1".to_string());
        let metrics = deriver.derive(&request, None, 0, &known);
        assert!(!metrics.is_new_device);
    }
}
