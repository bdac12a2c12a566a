//! Timed retry
//!
//! One abstraction for every suspension point that waits and tries again:
//! readiness probes, liveness watches, record-store writes and log tailing.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How the delay between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `interval`
    Fixed,
    /// Double the delay after each attempt, capped at `max`
    Exponential { max: Duration },
}

/// Interval, attempt budget and backoff of a retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

/// The last error of an exhausted retry loop
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            interval: initial,
            max_attempts: Some(max_attempts),
            backoff: Backoff::Exponential { max },
        }
    }

    /// A polling cadence with no attempt limit
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay to wait after the given (1-based) attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let shift = attempt.saturating_sub(1).min(16);
                self.interval.saturating_mul(1 << shift).min(max)
            }
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn allows_more_after(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    pub fn pacer(&self) -> Pacer {
        Pacer {
            policy: *self,
            attempt: 0,
        }
    }

    /// Runs `op` until it succeeds or the attempt budget is spent
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut pacer = self.pacer();
        loop {
            let attempt = pacer.begin();
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(last) => {
                    if !self.allows_more_after(attempt) {
                        return Err(RetryError {
                            attempts: attempt,
                            last,
                        });
                    }
                    debug!("Attempt {} failed, retrying", attempt);
                    pacer.wait().await;
                }
            }
        }
    }
}

/// Stateful cursor over a policy, for loops that pace themselves
#[derive(Debug, Clone)]
pub struct Pacer {
    policy: RetryPolicy,
    attempt: u32,
}

impl Pacer {
    /// Starts the next attempt and returns its 1-based number
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Sleeps for the delay owed after the current attempt
    pub async fn wait(&self) {
        tokio::time::sleep(self.policy.delay_after(self.attempt.max(1))).await;
    }

    /// Begins an attempt and sleeps first; `false` once the budget is spent
    pub async fn tick(&mut self) -> bool {
        if self.attempt > 0 && !self.policy.allows_more_after(self.attempt) {
            return false;
        }
        if self.attempt > 0 {
            self.wait().await;
        }
        self.begin();
        true
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(7), Duration::from_millis(250));
        assert!(policy.allows_more_after(2));
        assert!(!policy.allows_more_after(3));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(500),
            Duration::from_millis(3000),
            10,
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(3000));
        assert_eq!(policy.delay_after(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_unbounded_policy() {
        let policy = RetryPolicy::every(Duration::from_millis(10));
        assert!(policy.allows_more_after(u32::MAX - 1));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 5);

        let counter = Arc::clone(&calls);
        let result: Result<u32, RetryError<&str>> = policy
            .retry(|attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 { Err("not yet") } else { Ok(attempt) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 4);
        let result: Result<(), RetryError<String>> = policy
            .retry(|attempt| async move { Err(format!("fail {}", attempt)) })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last, "fail 4");
    }

    #[tokio::test]
    async fn test_pacer_tick_budget() {
        let mut pacer = RetryPolicy::fixed(Duration::from_millis(1), 2).pacer();
        assert!(pacer.tick().await);
        assert!(pacer.tick().await);
        assert!(!pacer.tick().await);
        assert_eq!(pacer.attempt(), 2);
    }
}
