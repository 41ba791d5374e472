//! Sliding-window request budget shared by every upstream caller.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Length of the trailing window the budget applies to
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Admits a request only while fewer than `budget` were issued in the
/// trailing window; otherwise callers poll every `check_interval`.
pub struct RateLimiter {
    budget: usize,
    window: Duration,
    check_interval: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(budget: usize, check_interval: Duration) -> Self {
        Self::with_window(budget, RATE_WINDOW, check_interval)
    }

    pub fn with_window(budget: usize, window: Duration, check_interval: Duration) -> Self {
        Self {
            budget: budget.max(1),
            window,
            check_interval,
            issued: Mutex::new(VecDeque::with_capacity(budget)),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Wait until the request can be issued, then record it
    pub async fn acquire(&self) {
        let mut waits = 0u64;
        while !self.try_acquire().await {
            waits += 1;
            if waits == 1 {
                debug!(budget = self.budget, "Request budget exhausted, waiting for window");
            }
            sleep(self.check_interval).await;
        }
    }

    /// Record a request if the budget allows it
    pub async fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut issued = self.issued.lock().await;
        Self::prune(&mut issued, now, self.window);

        if issued.len() < self.budget {
            issued.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests counted against the current window
    pub async fn in_window(&self) -> usize {
        let mut issued = self.issued.lock().await;
        Self::prune(&mut issued, Instant::now(), self.window);
        issued.len()
    }

    fn prune(issued: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = issued.front() {
            if now.duration_since(*front) >= window {
                issued.pop_front();
            } else {
                break;
            }
        }
    }
}
