//! Sentinel Orchestrator - behavioral risk scoring for authenticated web
//! sessions.
//!
//! Keystroke dynamics and mouse physics are streamed continuously and fused
//! with contextual risk (impossible travel, device/IP mismatch, policy
//! violations) into a single ALLOW / CHALLENGE / BLOCK decision per
//! `POST /evaluate` call. Two stream endpoints keep the per-modality state
//! warm between evaluations; nothing here blocks on a slow store write —
//! every path either has a safe default or treats the write as advisory.
//!
//! # Architecture
//!
//! ```text
//! POST /stream/keyboard ──┐
//! POST /stream/mouse    ──┼──▶ Orchestrator ──▶ SessionStore (Redis)
//! POST /evaluate        ──┘         │      └──▶ ModelStore / TrustedContextStore (Postgres)
//!                                   ▼
//!                         ContextDeriver + PolicyEngine
//! ```

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod keyboard;
pub mod mouse;
pub mod orchestrator;
pub mod policy;
pub mod scoring;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::SentinelError;
pub use orchestrator::Orchestrator;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
