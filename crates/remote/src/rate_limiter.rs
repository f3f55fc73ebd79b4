//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Added to every computed wait so the oldest call has surely aged out.
const SAFETY_MARGIN: Duration = Duration::from_millis(10);

/// Timestamps of recent calls, at most `capacity` per `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            calls: VecDeque::with_capacity(capacity),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a call at `now` if the window has room; otherwise return how
    /// long to wait before trying again.
    pub fn try_record(&mut self, now: Instant) -> Result<(), Duration> {
        self.purge(now);
        if self.calls.len() < self.capacity {
            self.calls.push_back(now);
            return Ok(());
        }
        let oldest = self.calls.front().copied().unwrap_or(now);
        let age = now.saturating_duration_since(oldest);
        Err(self.window.saturating_sub(age) + SAFETY_MARGIN)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Process-wide limiter shared by every batch.
///
/// The check/sleep/record sequence runs under one async mutex, so waiting
/// callers are served in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new(max_requests, window)),
        }
    }

    /// Wait until one more call is allowed, then record it.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        loop {
            match window.try_record(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl Default for RateLimiter {
    /// 5 calls per second.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}
