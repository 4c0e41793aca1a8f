//! Persistence contracts. Session/modality state is atomic-CAS over Redis;
//! per-user models and trusted context are optimistically-locked rows in
//! Postgres. Every contract is a trait so orchestrator tests can swap in an
//! in-memory fake and exercise fusion logic without a live store.

pub mod model_store;
pub mod rate_limit;
pub mod session_store;
pub mod trusted_context_store;

pub use model_store::{InMemoryModelStore, ModelStore, PostgresModelStore};
pub use session_store::{InMemorySessionStore, RedisSessionStore, SessionStore};
pub use trusted_context_store::{InMemoryTrustedContextStore, PostgresTrustedContextStore, TrustedContext, TrustedContextStore};
