//! Retry and backoff policy.
//!
//! The policy is a pure decision component: given how many attempts have
//! already failed and how the last failure was classified, it answers
//! whether to retry and after what delay. All scheduling (sleeping,
//! cancellation) is done by the caller.

use std::time::Duration;

use rand::Rng;

use crate::error::FailureKind;

/// Upper bound (exclusive) of the jitter factor added to each delay.
const JITTER_MAX: f64 = 0.3;

/// Decision returned by [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after waiting the given delay.
    RetryAfter(Duration),
    /// Stop retrying; the failure is terminal.
    GiveUp,
}

impl RetryDecision {
    /// Returns the delay if this decision is a retry.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(delay) => Some(*delay),
            Self::GiveUp => None,
        }
    }
}

/// Exponential backoff policy with optional jitter and attempt cap.
///
/// The delay for the nth failed attempt is
/// `min(cap, base * 2^(n-1)) * (1 + jitter)` with jitter drawn uniformly
/// from `[0, 0.3)` per attempt, so that many units reconnecting after a
/// shared outage do not stampede the destination at the same instant.
///
/// # Example
///
/// ```
/// use roomcast::{FailureKind, RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default().without_jitter();
/// assert_eq!(
///     policy.decide(1, FailureKind::Transient),
///     RetryDecision::RetryAfter(Duration::from_secs(1)),
/// );
/// assert_eq!(
///     policy.decide(3, FailureKind::Transient),
///     RetryDecision::RetryAfter(Duration::from_secs(4)),
/// );
/// assert_eq!(policy.decide(1, FailureKind::Permanent), RetryDecision::GiveUp);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    base: Duration,
    /// Upper bound on the computed delay (before jitter).
    cap: Duration,
    /// Terminal attempt count; `None` retries indefinitely.
    max_attempts: Option<u32>,
    /// Whether to add the random jitter factor.
    jitter: bool,
}

impl Default for RetryPolicy {
    /// The output reconnection policy: base 1s, cap 30s, unlimited attempts.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base delay and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_attempts: None,
            jitter: true,
        }
    }

    /// The webhook delivery policy: same backoff curve, capped at 8 attempts.
    pub fn webhook() -> Self {
        Self {
            max_attempts: Some(8),
            ..Self::default()
        }
    }

    /// Caps the total number of attempts.
    ///
    /// Once `attempts` failures have been recorded, [`decide`](Self::decide)
    /// returns [`RetryDecision::GiveUp`] even for transient failures.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Disables jitter, making delays exactly reproducible.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the configured attempt cap, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Decides whether to retry after the given failed attempt.
    ///
    /// `attempt` is the 1-based count of attempts made so far, including the
    /// one that just failed. Permanent failures never retry; transient
    /// failures retry until the attempt cap is reached.
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent {
            return RetryDecision::GiveUp;
        }
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::RetryAfter(self.delay(attempt))
    }

    /// Computes the backoff delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            if delay >= self.cap {
                delay = self.cap;
                break;
            }
            delay = delay.checked_mul(2).unwrap_or(self.cap);
        }
        if delay > self.cap {
            delay = self.cap;
        }
        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.0..JITTER_MAX);
            delay.mul_f64(1.0 + factor)
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_without_jitter() {
        let policy = RetryPolicy::default().without_jitter();
        let secs: Vec<u64> = (1..=8).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_is_monotonic_up_to_cap() {
        let policy = RetryPolicy::default().without_jitter();
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(1).mul_f64(1.0 + JITTER_MAX));
        }
    }

    #[test]
    fn test_permanent_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, FailureKind::Permanent),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_transient_retries_until_cap() {
        let policy = RetryPolicy::webhook().without_jitter();
        for attempt in 1..8 {
            assert!(matches!(
                policy.decide(attempt, FailureKind::Transient),
                RetryDecision::RetryAfter(_)
            ));
        }
        assert_eq!(
            policy.decide(8, FailureKind::Transient),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_unlimited_attempts_by_default() {
        let policy = RetryPolicy::default().without_jitter();
        assert!(matches!(
            policy.decide(10_000, FailureKind::Transient),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn test_decision_delay_accessor() {
        let policy = RetryPolicy::default().without_jitter();
        let decision = policy.decide(2, FailureKind::Transient);
        assert_eq!(decision.delay(), Some(Duration::from_secs(2)));
        assert_eq!(RetryDecision::GiveUp.delay(), None);
    }
}
