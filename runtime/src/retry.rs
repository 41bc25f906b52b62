//! Bounded, jittered exponential backoff for conflict retries.
//!
//! Optimistic reservations that lose a version race re-run their whole
//! read-decide-write cycle. Doing so immediately just makes the losers collide
//! again, so each retry waits an exponentially growing, capped and jittered delay.
//! Two independent bounds apply: a retry count and a wall-clock deadline.
//!
//! # Example
//!
//! ```rust
//! use seatguard_runtime::retry::{Backoff, BackoffStep, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_millis(500))
//!     .multiplier(2.0)
//!     .jitter(0.0)
//!     .build();
//!
//! let mut backoff = Backoff::new(&policy, Duration::from_secs(5));
//! assert_eq!(backoff.next_step(), BackoffStep::Retry(Duration::from_millis(10)));
//! assert_eq!(backoff.next_step(), BackoffStep::Retry(Duration::from_millis(20)));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `initial_delay`: 10ms
/// - `max_delay`: 500ms
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: 0.5 (each delay is scaled by a random factor in `[0.5, 1.0]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Fraction of each delay that is randomised away (0 = none, 1 = full jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Calculate the un-jittered delay for a given retry number.
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ attempt)
    /// Capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )] // Delays are milliseconds; attempt counts are small
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay for a given retry number with jitter applied.
    ///
    /// The result lies in `[delay * (1 - jitter), delay]`, so jitter never makes
    /// a delay longer than the un-jittered schedule.
    #[must_use]
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        // Non-finite jitter means none.
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        base.mul_f64(factor)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (clamped to `[0, 1]` when delays are computed).
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// The retry count is used up.
    Exhausted,
    /// Sleeping would cross the deadline.
    DeadlineExceeded,
}

/// Retry state for one operation: counts retries and tracks the deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: usize,
    deadline: Instant,
}

impl Backoff {
    /// Start a backoff sequence with `budget` of wall-clock time from now.
    #[must_use]
    pub fn new(policy: &RetryPolicy, budget: Duration) -> Self {
        Self {
            policy: policy.clone(),
            retries: 0,
            deadline: Instant::now() + budget,
        }
    }

    /// Number of retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.retries
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Decide what follows a failed attempt.
    pub fn next_step(&mut self) -> BackoffStep {
        if self.retries >= self.policy.max_retries {
            return BackoffStep::Exhausted;
        }
        let delay = self.policy.jittered_delay(self.retries);
        if Instant::now() + delay >= self.deadline {
            return BackoffStep::DeadlineExceeded;
        }
        self.retries += 1;
        BackoffStep::Retry(delay)
    }
}
