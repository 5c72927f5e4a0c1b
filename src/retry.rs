//! Bounded retry for transient backend failures.
//!
//! Every backend funnels its calls through [`retry`], parameterized by a
//! classification predicate, so the reissue loop exists exactly once.
//! Exhaustion returns the last underlying error, never a synthetic one.

use crate::error::HelperError;
use rand::{thread_rng, Rng};
use std::time::Duration;

/// Default attempt budget for operations classified as transient.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 4;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = raw.min(self.max_delay);
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor = thread_rng().gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        Duration::from_millis(((bounded.as_millis() as f64) * factor).round().max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_RETRY_ATTEMPTS, DEFAULT_BASE_DELAY).with_jitter(0.2)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Runs `operation` until it succeeds, fails terminally, or the attempt
/// budget is exhausted. `is_transient` decides whether a failure is worth
/// reissuing; `on_retry` fires once per reissue (metrics hook). Generic
/// over the error type so backends classify on their native codes before
/// mapping into the common taxonomy.
pub fn retry<T, E>(
    policy: &RetryPolicy,
    mut is_transient: impl FnMut(&E) -> bool,
    mut on_retry: impl FnMut(&E),
    mut operation: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut handle = policy.handle();
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }
                match handle.next_delay() {
                    Some(delay) => {
                        on_retry(&err);
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

/// errnos treated as transient for POSIX-like backends. `EACCES` is
/// intentionally part of the set.
pub const TRANSIENT_ERRNOS: &[i32] = &[
    libc::EINTR,
    libc::EIO,
    libc::EAGAIN,
    libc::EACCES,
    libc::EBUSY,
    libc::EMFILE,
    libc::ETXTBSY,
    libc::ESPIPE,
    libc::EMLINK,
    libc::EPIPE,
    libc::EDEADLK,
    libc::EWOULDBLOCK,
    libc::ENOLINK,
    libc::EADDRINUSE,
    libc::EADDRNOTAVAIL,
    libc::ENETDOWN,
    libc::ENETUNREACH,
    libc::ECONNABORTED,
    libc::ECONNRESET,
    libc::ENOTCONN,
    libc::EHOSTUNREACH,
    libc::ECANCELED,
    libc::ESTALE,
    #[cfg(target_os = "linux")]
    libc::ENONET,
    #[cfg(target_os = "linux")]
    libc::EHOSTDOWN,
    #[cfg(target_os = "linux")]
    libc::EREMOTEIO,
    #[cfg(target_os = "linux")]
    libc::ENOMEDIUM,
];

/// Classifier for errors carrying a raw errno.
pub fn errno_is_transient(err: &HelperError) -> bool {
    err.errno()
        .map(|errno| TRANSIENT_ERRNOS.contains(&errno))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn instant_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::linear(attempts, Duration::ZERO)
    }

    #[test]
    fn transient_storm_succeeds_within_budget() {
        let mut failures_left = 3;
        let mut retries = 0;
        let result = retry(
            &instant_policy(4),
            errno_is_transient,
            |_| retries += 1,
            || {
                if failures_left > 0 {
                    failures_left -= 1;
                    Err(HelperError::from_errno(libc::EAGAIN, "probe"))
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, 3);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = retry(
            &instant_policy(3),
            errno_is_transient,
            |_| {},
            || {
                calls += 1;
                Err(HelperError::from_errno(libc::EIO, "probe"))
            },
        );
        assert_eq!(calls, 3);
        assert_eq!(result.unwrap_err().errno(), Some(libc::EIO));
    }

    #[test]
    fn terminal_errors_surface_on_first_failure() {
        let mut calls = 0;
        let result: Result<(), _> = retry(
            &instant_policy(5),
            errno_is_transient,
            |_| {},
            || {
                calls += 1;
                Err(HelperError::from_errno(libc::ENOENT, "probe"))
            },
        );
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn identity_failures_are_not_transient() {
        let err = HelperError::new(ErrorKind::PermissionDenied, "adopt uid");
        assert!(!errno_is_transient(&err));
        let eacces = HelperError::from_errno(libc::EACCES, "open");
        assert!(errno_is_transient(&eacces));
    }

    #[test]
    fn exponential_delays_are_bounded() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(400));
        let mut handle = policy.handle();
        let mut last = Duration::ZERO;
        while let Some(delay) = handle.next_delay() {
            assert!(delay <= Duration::from_millis(400));
            last = delay;
        }
        assert_eq!(handle.attempts(), 9);
        assert_eq!(last, Duration::from_millis(400));
    }
}
