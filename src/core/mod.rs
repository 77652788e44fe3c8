//! Shared building blocks: the crate error type, the readiness flag and the
//! context that owns the three coordination registries.

pub mod error;
pub mod status;

use std::sync::Arc;

pub use error::{ScoutError, ScoutResult};

use crate::{
    cache::ResultCache, config::Scout, limiter::RateAdmissionController,
    session::SessionEventBus,
};

/// Registries created at process start and shared by every service.
#[derive(Clone, Default)]
pub struct AppContext {
    pub limiter: Arc<RateAdmissionController>,
    pub cache: Arc<ResultCache>,
    pub bus: Arc<SessionEventBus>,
}

impl AppContext {
    pub fn new(
        limiter: Arc<RateAdmissionController>,
        cache: Arc<ResultCache>,
        bus: Arc<SessionEventBus>,
    ) -> Self {
        Self { limiter, cache, bus }
    }

    pub fn from_config(cfg: &Scout) -> Self {
        Self::new(
            Arc::new(RateAdmissionController::from_config(cfg)),
            Arc::new(ResultCache::from_config(&cfg.cache)),
            Arc::new(SessionEventBus::from_config(&cfg.sessions)),
        )
    }
}
