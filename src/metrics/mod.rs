//! Prometheus collectors shared by the admission controller, the result cache
//! and the session bus. They are exported through pingora's prometheus HTTP
//! service when `scout.prometheus` is configured.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, IntCounterVec, IntGauge,
    IntGaugeVec,
};

// Admission decisions per source
pub static ADMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scout_admission_total",
        "Admission decisions taken by the per-source token buckets",
        &[
            "source",  // Configured source name, or "default" for unknown sources
            "outcome", // granted | denied
        ]
    )
    .unwrap()
});

// Result cache lookups
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scout_cache_lookups_total",
        "Result cache lookups by outcome",
        &["outcome"] // hit | miss | expired
    )
    .unwrap()
});

pub static EVENTS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scout_events_published_total",
        "Progress events published into session buses",
        &["kind"]
    )
    .unwrap()
});

pub static OBSERVERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "scout_observers",
        "Observers currently attached to a session",
        &["transport"] // push | pull
    )
    .unwrap()
});

pub static SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("scout_sessions", "Live sessions held by the event bus").unwrap()
});

/// Decrements the observer gauge for a transport when dropped.
pub struct ObserverGuard {
    transport: &'static str,
}

impl ObserverGuard {
    pub fn new(transport: &'static str) -> Self {
        OBSERVERS.with_label_values(&[transport]).inc();
        Self { transport }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        OBSERVERS.with_label_values(&[self.transport]).dec();
    }
}
