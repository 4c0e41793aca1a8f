//! Fusion, mode, trust, strikes, learning gates and the final ALLOW /
//! CHALLENGE / BLOCK decision. The two stream endpoints and the evaluate
//! endpoint all go through one `Orchestrator` holding the store handles and
//! the context deriver; everything else (extractors, scorers) is stateless
//! and constructed fresh per call.

pub mod evaluate;
pub mod stream;

pub use evaluate::{
    BusinessContext, ClientFingerprint, EvaluateOutcome, EvaluateRequest, RequestContextWire,
};
pub use stream::{MouseStreamRequest, StreamOutcome, KeyboardStreamRequest};

use crate::context::ContextDeriver;
use crate::store::{ModelStore, SessionStore, TrustedContextStore};
use std::sync::Arc;

/// Shared handle threaded through the stream and evaluate pipelines. Cheap to
/// clone (everything inside is already `Arc`-backed or stateless).
#[derive(Clone)]
pub struct Orchestrator {
    pub sessions: Arc<dyn SessionStore>,
    pub models: Arc<dyn ModelStore>,
    pub trusted: Arc<dyn TrustedContextStore>,
    pub context_deriver: Arc<ContextDeriver>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        models: Arc<dyn ModelStore>,
        trusted: Arc<dyn TrustedContextStore>,
    ) -> Self {
        Self {
            sessions,
            models,
            trusted,
            context_deriver: Arc::new(ContextDeriver::default()),
        }
    }
}
