//! Request rate limiting shared by a whole task tree
//!
//! The limiter is one timestamp. Every task in a tree (and by default every
//! task in the process) holds a clone of the same [`RateLimiter`], so a child
//! throttles against the same clock as its parent. The check and the update
//! are separate steps: two siblings can still pass at nearly the same time.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

static GLOBAL: LazyLock<RateLimiter> = LazyLock::new(RateLimiter::new);

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// A limiter not shared with anything else
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide limiter
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Time left before another request may start
    pub fn remaining(&self, interval: Duration) -> Duration {
        match *self.last_request.lock() {
            Some(last) => interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record that a request is starting now
    pub fn mark_request(&self) {
        *self.last_request.lock() = Some(Instant::now());
    }

    pub fn reset(&self) {
        *self.last_request.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let limiter = RateLimiter::new();
        let interval = Duration::from_secs(5);
        assert_eq!(limiter.remaining(interval), Duration::ZERO);

        limiter.mark_request();
        assert_eq!(limiter.remaining(interval), interval);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.remaining(interval), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(limiter.remaining(interval), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_the_clock() {
        let parent = RateLimiter::new();
        let child = parent.clone();
        parent.mark_request();
        assert_eq!(child.remaining(Duration::from_secs(10)), Duration::from_secs(10));

        let unrelated = RateLimiter::new();
        assert_eq!(unrelated.remaining(Duration::from_secs(10)), Duration::ZERO);
    }
}
