//! Request pacing with multiplicative backoff
//!
//! Each worker owns its own limiter. A throttling response doubles the
//! inter-request delay up to a ceiling; a success after throttling halves it
//! back toward the baseline, so the steady-state request rate stays bounded
//! under sustained throttling.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const BACKOFF_FACTOR: u32 = 2;

#[derive(Debug)]
struct Inner {
    current_delay: Duration,
    last_request: Option<Instant>,
    consecutive_throttles: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    initial_delay: Duration,
    max_delay: Duration,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            inner: Mutex::new(Inner {
                current_delay: initial_delay,
                last_request: None,
                consecutive_throttles: 0,
            }),
        }
    }

    /// Wait until the next request is allowed to go out
    pub async fn acquire(&self) {
        let wait = {
            let inner = self.inner.lock().unwrap();
            match inner.last_request {
                Some(last) => inner.current_delay.saturating_sub(last.elapsed()),
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
        self.inner.lock().unwrap().last_request = Some(Instant::now());
    }

    /// A throttling response: double the delay up to the ceiling
    pub fn on_throttle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_throttles += 1;
        inner.current_delay = (inner.current_delay * BACKOFF_FACTOR).min(self.max_delay);
    }

    /// A success: if we had been throttled, halve the delay back toward the
    /// baseline
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.consecutive_throttles > 0 {
            inner.consecutive_throttles = 0;
            inner.current_delay = (inner.current_delay / BACKOFF_FACTOR).max(self.initial_delay);
        }
    }

    #[cfg(test)]
    fn current_delay(&self) -> Duration {
        self.inner.lock().unwrap().current_delay
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
