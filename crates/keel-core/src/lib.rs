//! Keel core — shared types for the replica placement engine.
//!
//! - **`types`** — node, service, application, and partition descriptions
//!   accepted by ingestion, plus the movement actions the balancer emits
//! - **`config`** — `KeelConfig`, the immutable configuration passed to
//!   every refresh

pub mod config;
pub mod types;

pub use config::KeelConfig;
pub use types::*;
