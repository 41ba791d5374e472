//! Exponential backoff shared by every upstream call site.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::UpstreamConfig;
use crate::error::PipelineResult;

/// Retry transient failures with a doubling, capped delay
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Delay slept after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Every delay a call that keeps failing would sleep, in order
    pub fn delays(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_for(a)).collect()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Only errors for which
    /// `is_transient()` holds are retried; the last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> PipelineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        call = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient upstream failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(call = label, attempts = attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delays_are_non_decreasing_and_capped() {
        let policy = RetryPolicy::new(12, Duration::from_millis(250), Duration::from_secs(10));
        let delays = policy.delays();
        assert_eq!(delays.len(), 11);
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[1], Duration::from_millis(500));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_attempt_numbers_saturate_to_cap() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result = policy
            .run("test", move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::Upstream("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms then 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: PipelineResult<()> = policy
            .run("test", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Upstream("timeout".into()))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Upstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: PipelineResult<()> = policy
            .run("test", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::UpstreamFatal("schema".into()))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::UpstreamFatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
