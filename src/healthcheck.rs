//! Periodic health sweep over supervised instances.
//!
//! Probes every tracked instance and lets the supervisor evict the dead
//! ones. The first pass runs shortly after startup so instances re-adopted
//! from the registry mirror are validated early; after that the sweep runs
//! on a fixed cadence.

use crate::process::InstanceManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Delay before the first sweep after startup
const INITIAL_SWEEP_DELAY: Duration = Duration::from_secs(5);

/// Drives [`InstanceManager::sweep_once`] on a schedule
pub struct HealthSweeper {
    manager: Arc<InstanceManager>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthSweeper {
    pub fn new(
        manager: Arc<InstanceManager>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Health sweeper started"
        );

        let mut next_delay = INITIAL_SWEEP_DELAY;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(next_delay) => {
                    debug!("Running health sweep");
                    self.manager.sweep_once().await;
                    next_delay = self.interval;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Health sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
