//! Shared per-venue request pacing. One limiter per (venue, account) is
//! handed to every executor touching that venue, so retries across
//! positions queue behind a common budget instead of stampeding.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct VenueRateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl VenueRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn from_millis(min_interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_interval_ms))
    }

    /// Wait until the venue's minimum request spacing has elapsed, then
    /// claim the slot. Holders of the returned future are serialized.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paces_consecutive_acquires() {
        let limiter = VenueRateLimiter::from_millis(20);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = VenueRateLimiter::from_millis(50);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
