//! Global request pacing.
//!
//! One `RateLimiter` is shared by every worker of a run. The permit-issuing
//! critical section holds the lock across the sleep, so successive permits
//! are at least `min_interval` apart no matter how many tasks are waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_permit: Mutex<Option<Instant>>,
    permits_granted: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_permit: Mutex::new(None),
            permits_granted: AtomicU64::new(0),
        }
    }

    /// Limiter that never waits. Used by dry runs and tests.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Suspends the caller until it may issue one outbound request.
    pub async fn wait(&self) {
        let mut last_permit = self.last_permit.lock().await;

        if let Some(previous) = *last_permit {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                trace!("Rate limiter holding request until {:?}", ready_at);
                sleep_until(ready_at).await;
            }
        }

        *last_permit = Some(Instant::now());
        self.permits_granted.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    #[must_use]
    pub fn permits_granted(&self) -> u64 {
        self.permits_granted.load(Ordering::Relaxed)
    }
}
