//! Error taxonomy for the orchestrator, mapped to HTTP status codes at the edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The kinds of failure the orchestrator distinguishes. Most are handled
/// locally (see each variant's doc); only `ReplayAttack`, `RateLimited` and
/// `ValidationError` are ever surfaced to the caller as non-2xx.
#[derive(Debug)]
pub enum SentinelError {
    /// Stream batch_id <= last seen for that modality. Never mutates state.
    ReplayAttack(String),
    /// More than the permitted per-second count of stream or evaluate calls.
    RateLimited,
    /// Schema or constraint violation (e.g. batch_id < 1).
    ValidationError(String),
    /// Checksum mismatch or decode failure on a stored model blob. Treated as
    /// "no model" by the caller; this variant exists for logging.
    ModelCorruption(String),
    /// Compare-and-swap exhausted its retries. The write is dropped, not
    /// surfaced to the client (streams are advisory).
    StoreConflict(String),
    /// Store operation exceeded its socket timeout or otherwise failed to
    /// respond. Callers apply fail-safe-for-security handling per call site.
    StoreUnavailable(String),
    /// Any uncaught condition. Detail is never leaked to the client.
    InternalUnknown(String),
}

impl std::fmt::Display for SentinelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentinelError::ReplayAttack(s) => write!(f, "replay attack: {s}"),
            SentinelError::RateLimited => write!(f, "rate limited"),
            SentinelError::ValidationError(s) => write!(f, "validation error: {s}"),
            SentinelError::ModelCorruption(s) => write!(f, "model corruption: {s}"),
            SentinelError::StoreConflict(s) => write!(f, "store conflict: {s}"),
            SentinelError::StoreUnavailable(s) => write!(f, "store unavailable: {s}"),
            SentinelError::InternalUnknown(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for SentinelError {}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl SentinelError {
    fn code(&self) -> &'static str {
        match self {
            SentinelError::ReplayAttack(_) => "REPLAY_ATTACK",
            SentinelError::RateLimited => "RATE_LIMITED",
            SentinelError::ValidationError(_) => "VALIDATION_ERROR",
            SentinelError::ModelCorruption(_) => "MODEL_CORRUPTION",
            SentinelError::StoreConflict(_) => "STORE_CONFLICT",
            SentinelError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SentinelError::InternalUnknown(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SentinelError::ReplayAttack(_) => StatusCode::BAD_REQUEST,
            SentinelError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            SentinelError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SentinelError::ModelCorruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SentinelError::StoreConflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SentinelError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SentinelError::InternalUnknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SentinelError {
    fn into_response(self) -> Response {
        tracing::warn!(code = self.code(), "{}", self);
        let status = self.status();
        let body = ErrorBody {
            error: match &self {
                SentinelError::InternalUnknown(_) => "internal error".to_string(),
                other => other.to_string(),
            },
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_attack_maps_to_400() {
        assert_eq!(
            SentinelError::ReplayAttack("stale batch".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(SentinelError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn validation_error_maps_to_422() {
        assert_eq!(
            SentinelError::ValidationError("batch_id < 1".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
