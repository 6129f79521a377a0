//! Bounded retry with exponential backoff
//!
//! Waits between attempts observe a [`CancellationToken`] so shutdown does
//! not sit out a long backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DiskError, DiskResult};

/// Retry schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Backoff {
    /// Unmount schedule: five attempts starting at 500ms
    pub const UNMOUNT: Self = Self {
        attempts: 5,
        initial: Duration::from_millis(500),
        max: Duration::from_secs(2),
        jitter: false,
    };

    /// Free NBD device scan schedule
    pub const DEVICE_SCAN: Self = Self {
        attempts: 4,
        initial: Duration::from_millis(200),
        max: Duration::from_secs(1),
        jitter: true,
    };

    /// Delay before attempt `attempt + 1` (0-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self.initial.saturating_mul(factor).min(self.max);
        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() / 10);
            base + Duration::from_millis(u64::try_from(extra).unwrap_or(0))
        } else {
            base
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned on exhaustion.
    pub async fn retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> DiskResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DiskResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay(attempt);
                    debug!("{what}: attempt {} failed ({e}), retrying in {delay:?}", attempt + 1);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(DiskError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
