//! Derives numeric risk metrics from request, device and history context.
//! Pure metric derivation only — no decisions, no blocking.

pub mod deriver;
pub mod geo;
pub mod useragent;

pub use deriver::{ContextDeriver, ContextMetrics, GeoPoint, RequestContext};
