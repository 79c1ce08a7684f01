use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{self, Instant};

/// Minimum spacing between requests issued through one source instance.
///
/// Callers queue on the inner mutex, so concurrent `acquire` calls are
/// released one at a time, each at least `min_interval` after the previous.
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Waits for this caller's turn and returns the instant it was granted.
    pub async fn acquire(&self) -> Instant {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            time::sleep_until(previous + self.min_interval).await;
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}
