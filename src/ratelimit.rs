//! Hourly request pacing shared by a connection's collector workers.
//!
//! The budget is expressed as requests per hour ([`crate::config::RateLimitConfig`]).
//! Instead of counting requests in a window, the limiter spaces grants a
//! fixed interval apart (3600s divided by the budget), which bounds every
//! rolling 60-minute span to the budget no matter how many workers pull
//! from it concurrently. Workers block in [`RateLimiter::acquire`] until
//! their slot comes up.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Paces requests for one connection. Cheap to share via `Arc`; all
/// workers of a collector hold the same instance.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_hour: u32) -> Self {
        // Budget 0 is rejected at config validation, but guard anyway so
        // a hand-built limiter can't divide by zero.
        let per_hour = requests_per_hour.max(1);
        Self {
            interval: Duration::from_secs_f64(3600.0 / f64::from(per_hour)),
            next_grant: Mutex::new(None),
        }
    }

    /// Spacing between grants.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next request slot.
    ///
    /// The first caller proceeds immediately; each subsequent grant is
    /// scheduled one interval after the previous one, even when callers
    /// arrive in a burst.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_grant.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
