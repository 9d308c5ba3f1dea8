//! Bounded fixed-interval readiness polling.
//!
//! No backoff, no jitter, no debounce: attempts are spaced identically and the
//! first success is trusted. Readiness is never cached — every invocation of
//! the pipeline re-polls from scratch.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    control::HealthChecker,
    error::{BootstrapError, BootstrapResult},
};

/// Default attempt bound; the lighter deployment profile uses 30.
pub const DEFAULT_ATTEMPTS: u32 = 60;

/// Spacing between attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    attempts: u32,
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, POLL_INTERVAL)
    }
}

impl ReadinessPoller {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Poll until one probe succeeds or the attempt bound is exhausted.
    pub async fn wait_ready<H>(&self, health: &H, host: &str, port: u16) -> BootstrapResult<()>
    where
        H: HealthChecker + ?Sized,
    {
        for attempt in 1..=self.attempts {
            if health.is_ready(host, port).await {
                info!(host, port, attempt, "postgres is accepting connections");
                return Ok(());
            }
            debug!(host, port, attempt, max = self.attempts, "not ready yet");
            if attempt < self.attempts {
                sleep(self.interval).await;
            }
        }
        Err(BootstrapError::ReadinessTimeout {
            attempts: self.attempts,
            port,
        })
    }
}
