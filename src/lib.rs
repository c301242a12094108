//! Admission Control - Rate Limiting and Request Queueing Service
//!
//! This crate decides whether a caller's request may proceed now, based on
//! per-identifier usage counted in second, minute, hour and day windows plus
//! an in-flight concurrency cap. Denied requests may wait in a per-identifier
//! priority queue that a background drain scheduler admits as capacity frees up.

pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod queue;
pub mod scheduler;
mod serde_ms;
pub mod service;
pub mod store;
