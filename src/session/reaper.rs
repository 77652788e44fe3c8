use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::interval;

use crate::config;

use super::bus::SessionEventBus;

/// Periodically drops finished sessions nobody is watching anymore.
pub struct SessionReaper {
    bus: Arc<SessionEventBus>,
    linger: Duration,
    every: Duration,
}

impl SessionReaper {
    pub fn new(bus: Arc<SessionEventBus>, linger: Duration, every: Duration) -> Self {
        Self { bus, linger, every }
    }

    pub fn from_config(bus: Arc<SessionEventBus>, cfg: &config::Sessions) -> Self {
        Self::new(
            bus,
            Duration::from_secs(cfg.finished_linger),
            Duration::from_secs(cfg.reap_interval),
        )
    }

    pub fn sweep(&self) -> usize {
        let reaped = self.bus.reap(self.linger);
        if reaped > 0 {
            debug!("Reaped {reaped} stale sessions");
        }
        reaped
    }
}

#[async_trait]
impl BackgroundService for SessionReaper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = interval(self.every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Session reaper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}
