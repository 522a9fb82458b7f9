//! Bounded retry with exponential backoff.
//!
//! No-wait row locks turn contention into an immediate error. Callers that
//! hit one back off and try again a few times before giving up, so two
//! bookings racing for the same event row settle in milliseconds instead of
//! queueing on the database.
//!
//! # Example
//!
//! ```rust
//! use quicket_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(20))
//!     .max_delay(Duration::from_millis(500))
//!     .jitter(0.5)
//!     .build();
//!
//! let seats = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("locked"),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// How many times to retry and how long to wait in between.
///
/// The wait before retry `n` (counting from zero) is
/// `initial_delay * multiplier^n`, capped at `max_delay`, then scaled by a
/// random factor in `1 ± jitter`.
///
/// [`RetryPolicy::default`] retries three times starting at 100ms, doubling,
/// capped at 30s, without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: f64,
    /// Fraction of the wait randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Start from the default policy.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self {
                max_retries: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Wait before retry `retry`, without jitter.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let cap_ms = self.max_delay.as_millis() as f64;
        let wait_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if wait_ms.is_finite() && wait_ms < cap_ms {
            Duration::from_millis(wait_ms as u64)
        } else {
            self.max_delay
        }
    }

    /// Wait before retry `retry`, with jitter.
    #[must_use]
    pub fn jittered_backoff(&self, retry: usize) -> Duration {
        let base = self.backoff(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        base.mul_f64(rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter)))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound on any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between consecutive waits.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Random spread applied to each wait.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Finish.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or the policy runs out of retries.
///
/// # Errors
///
/// Returns the first permanent error, or the last transient one once
/// `policy.max_retries` retries are spent.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::debug!(retries, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(err);
        }
        if retries >= policy.max_retries {
            tracing::warn!(retries, error = %err, "Giving up after retries");
            return Err(err);
        }

        let wait = policy.jittered_backoff(retries);
        tracing::debug!(
            retry = retries + 1,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient failure, backing off"
        );
        sleep(wait).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Attempt {
        Locked(usize),
        SoldOut,
    }

    impl fmt::Display for Attempt {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Locked(n) => write!(f, "row locked (attempt {n})"),
                Self::SoldOut => f.write_str("sold out"),
            }
        }
    }

    fn fast(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(2))
            .build()
    }

    const fn is_locked(err: &Attempt) -> bool {
        matches!(err, Attempt::Locked(_))
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .multiplier(3.0)
            .max_delay(Duration::from_millis(1_000))
            .build();

        let waits: Vec<_> = (0..5).map(|n| policy.backoff(n).as_millis()).collect();
        assert_eq!(waits, vec![50, 150, 450, 1_000, 1_000]);
        assert_eq!(policy.backoff(usize::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(200))
            .jitter(0.25)
            .build();

        for _ in 0..100 {
            let wait = policy.jittered_backoff(0);
            assert!(wait >= Duration::from_millis(150), "{wait:?}");
            assert!(wait <= Duration::from_millis(250), "{wait:?}");
        }
        assert_eq!(
            RetryPolicy::none().jittered_backoff(3),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_lock_released_before_retries_run_out() {
        let calls = Cell::new(0);

        let result = retry_with_predicate(
            &fast(3),
            || {
                let n = calls.get();
                calls.set(n + 1);
                async move { if n < 2 { Err(Attempt::Locked(n)) } else { Ok(n) } }
            },
            is_locked,
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_last_error_returned_when_retries_run_out() {
        let calls = Cell::new(0);

        let result = retry_with_predicate(
            &fast(2),
            || {
                let n = calls.get();
                calls.set(n + 1);
                async move { Err::<(), _>(Attempt::Locked(n)) }
            },
            is_locked,
        )
        .await;

        assert_eq!(result, Err(Attempt::Locked(2)));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);

        let result = retry_with_predicate(
            &fast(5),
            || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(Attempt::SoldOut) }
            },
            is_locked,
        )
        .await;

        assert_eq!(result, Err(Attempt::SoldOut));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_none_policy_attempts_once() {
        let calls = Cell::new(0);

        let result = retry_with_predicate(
            &RetryPolicy::none(),
            || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(Attempt::Locked(0)) }
            },
            is_locked,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
