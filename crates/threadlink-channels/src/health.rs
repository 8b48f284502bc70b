//! Periodic liveness check of the external network session

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use threadlink_core::error::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A long-lived login that can silently expire
#[async_trait]
pub trait SessionHealth: Send + Sync {
    /// Cheap check that the session still works
    async fn probe(&self) -> Result<()>;

    /// Establish a fresh session
    async fn reconnect(&self) -> Result<()>;
}

pub struct HealthMonitor {
    interval: Duration,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }

    pub fn spawn(self, session: Arc<dyn SessionHealth>) -> JoinHandle<()> {
        tokio::spawn(self.run(session))
    }

    /// Probe every interval, reconnecting after a failed probe, until cancelled
    pub async fn run(self, session: Arc<dyn SessionHealth>) {
        info!("Session health monitor started (every {:?})", self.interval);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match session.probe().await {
                Ok(()) => {
                    if failures > 0 {
                        info!("Session healthy again after {} failed check(s)", failures);
                    }
                    failures = 0;
                    debug!("Session health check passed");
                }
                Err(e) => {
                    failures += 1;
                    warn!("Session health check failed ({} in a row): {}", failures, e);
                    match session.reconnect().await {
                        Ok(()) => info!("Session re-established"),
                        Err(e) => error!("Session reconnect failed: {}", e),
                    }
                }
            }
        }

        info!("Session health monitor stopped");
    }
}
