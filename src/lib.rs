//! Scoutgate coordinates long-running, multi-source scraping jobs.
//!
//! It throttles outbound calls per source with token buckets, memoizes
//! idempotent lookups in a TTL cache, and streams per-session progress events
//! to observers over WebSocket and SSE.

pub mod admin;
pub mod cache;
pub mod config;
pub mod core;
pub mod gateway;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod service;
pub mod session;
pub(crate) mod utils;
