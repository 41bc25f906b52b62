//! Configuration for the reservation core.
//!
//! Loads from `SEATGUARD_*` environment variables with defaults. Unlike a silent
//! fallback, a variable that is set but unparsable is an error, so a typo in a
//! deployment never quietly runs with the default strategy.

use crate::executor::{ExecutorConfig, IsolationStrategy};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("{var}={value:?} is invalid: {reason}")]
    Parse {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
    /// Values parse but do not make sense together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Whether the orchestrator takes the per-resource coordinator lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Always lock.
    Required,
    /// Never lock; rely on the executor alone.
    Skip,
    /// Lock for the pessimistic strategy, skip for the optimistic one.
    #[default]
    Auto,
}

impl FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(Self::Required),
            "skip" => Ok(Self::Skip),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown lock policy '{other}' (expected required, skip or auto)"
            )),
        }
    }
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Required => "required",
            Self::Skip => "skip",
            Self::Auto => "auto",
        })
    }
}

/// Reservation core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Transaction executor settings
    pub executor: ExecutorConfig,
    /// Coordinator lock policy
    pub lock_policy: LockPolicy,
    /// Lifetime of an admission slot nobody releases
    pub admission_ttl: Duration,
    /// Lifetime of a coordinator lock nobody releases
    pub lock_ttl: Duration,
    /// Worker tasks in the pool
    pub workers: usize,
    /// Bounded queue depth in front of the workers
    pub queue_depth: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            lock_policy: LockPolicy::Auto,
            admission_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(5),
            workers: 8,
            queue_depth: 1024,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn millis_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(lookup, var, default_ms).map(Duration::from_millis)
}

impl ReservationConfig {
    /// Load from the process environment, then validate.
    ///
    /// # Errors
    ///
    /// `Parse` for unparsable variables, `Invalid` when validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load from an arbitrary variable source, then validate.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry_defaults = defaults.executor.retry.clone();

        let retry = RetryPolicy::builder()
            .max_retries(parse_var(
                &lookup,
                "SEATGUARD_MAX_RETRIES",
                retry_defaults.max_retries,
            )?)
            .initial_delay(millis_var(
                &lookup,
                "SEATGUARD_RETRY_INITIAL_MS",
                retry_defaults.initial_delay,
            )?)
            .max_delay(millis_var(
                &lookup,
                "SEATGUARD_RETRY_MAX_MS",
                retry_defaults.max_delay,
            )?)
            .multiplier(parse_var(
                &lookup,
                "SEATGUARD_RETRY_MULTIPLIER",
                retry_defaults.multiplier,
            )?)
            .jitter(parse_var(
                &lookup,
                "SEATGUARD_RETRY_JITTER",
                retry_defaults.jitter,
            )?)
            .build();

        let config = Self {
            executor: ExecutorConfig {
                strategy: parse_var(
                    &lookup,
                    "SEATGUARD_STRATEGY",
                    defaults.executor.strategy,
                )?,
                skip_locked: parse_var(
                    &lookup,
                    "SEATGUARD_SKIP_LOCKED",
                    defaults.executor.skip_locked,
                )?,
                lock_wait: millis_var(
                    &lookup,
                    "SEATGUARD_LOCK_WAIT_MS",
                    defaults.executor.lock_wait,
                )?,
                deadline: millis_var(
                    &lookup,
                    "SEATGUARD_DEADLINE_MS",
                    defaults.executor.deadline,
                )?,
                retry,
            },
            lock_policy: parse_var(&lookup, "SEATGUARD_LOCK_POLICY", defaults.lock_policy)?,
            admission_ttl: millis_var(
                &lookup,
                "SEATGUARD_ADMISSION_TTL_MS",
                defaults.admission_ttl,
            )?,
            lock_ttl: millis_var(&lookup, "SEATGUARD_LOCK_TTL_MS", defaults.lock_ttl)?,
            workers: parse_var(&lookup, "SEATGUARD_WORKERS", defaults.workers)?,
            queue_depth: parse_var(&lookup, "SEATGUARD_QUEUE_DEPTH", defaults.queue_depth)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the values make sense together.
    ///
    /// # Errors
    ///
    /// `Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.executor.retry;
        let checks = [
            (self.admission_ttl.is_zero(), "admission TTL must be non-zero"),
            (self.lock_ttl.is_zero(), "lock TTL must be non-zero"),
            (self.executor.lock_wait.is_zero(), "lock wait must be non-zero"),
            (self.executor.deadline.is_zero(), "deadline must be non-zero"),
            (
                !(0.0..=1.0).contains(&retry.jitter),
                "retry jitter must lie in [0, 1]",
            ),
            (
                retry.multiplier.is_nan() || retry.multiplier < 1.0,
                "retry multiplier must be at least 1",
            ),
            (
                retry.initial_delay > retry.max_delay,
                "initial retry delay exceeds the maximum delay",
            ),
            (self.workers == 0, "at least one worker is required"),
            (self.queue_depth == 0, "queue depth must be non-zero"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Invalid((*reason).to_string())),
            None => Ok(()),
        }
    }

    /// Whether reservations take the coordinator lock under this configuration.
    #[must_use]
    pub const fn uses_coordinator_lock(&self) -> bool {
        match self.lock_policy {
            LockPolicy::Required => true,
            LockPolicy::Skip => false,
            LockPolicy::Auto => matches!(self.executor.strategy, IsolationStrategy::Pessimistic),
        }
    }
}
