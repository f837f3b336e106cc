//! A generic retry combinator with exponential backoff and jitter
//!
//! Everything host-dispatched or network-bound runs under one of these
//! instead of growing its own retry loop. The policy is exponential:
//! `base * multiplier^(attempt-1)`, capped, with a symmetric random jitter so
//! a fleet of retries doesn't stampede in lockstep.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters for one wrapped unit of work
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: u32,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Symmetric jitter fraction (0.25 means ±25%)
    pub jitter: f64,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2,
            max_delay: Duration::from_secs(300),
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy with the default curve and a chosen attempt cap
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Disable jitter (tests want deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// The delay to sleep after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(self.multiplier.saturating_pow(pow));
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let mut rng = rand::thread_rng();
        let factor = 1.0 - self.jitter + rng.gen::<f64>() * 2.0 * self.jitter;
        Duration::from_millis((capped.as_millis() as f64 * factor).round() as u64)
    }
}

/// Run a fallible unit under the policy, sleeping the current thread
///
/// The operation gets the attempt index (starting at 1); the observer gets
/// `(attempt, &error)` for every failure so callers can record retry counts
/// on their host attempts. An error the `retryable` predicate rejects is
/// returned immediately; otherwise the last error is returned on exhaustion.
pub fn run<T, E, F, O, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut observe: O,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    O: FnMut(u32, &E),
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                observe(attempt, &error);
                if attempt >= policy.max_attempts || !retryable(&error) {
                    return Err(error);
                }
                std::thread::sleep(policy.delay_for_attempt(attempt));
                attempt += 1;
            }
        }
    }
}

/// The async flavor of [`run`][], sleeping the task instead of the thread
pub async fn run_async<T, E, F, Fut, O, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut observe: O,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    O: FnMut(u32, &E),
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                observe(attempt, &error);
                if attempt >= policy.max_attempts || !retryable(&error) {
                    return Err(error);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}
