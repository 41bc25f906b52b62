//! Lease store abstraction: expiring, owner-tagged keys.
//!
//! Both the admission gate and the lock coordinator are built on the same three
//! primitives, which every backing store must provide atomically:
//!
//! - set `key = token` only if `key` is absent, with an expiry
//! - delete `key` only if it still holds `token`
//! - extend the expiry of `key` only if it still holds `token`
//!
//! Expiry is what makes the scheme crash-safe: a holder that dies without
//! releasing simply lets its lease run out.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by lease store operations.
pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LeaseError>> + Send + 'a>>;

/// Errors from lease store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Leases must always expire.
    #[error("Lease TTL must be greater than zero")]
    InvalidTtl,

    /// The backing store could not be reached.
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    /// The backing store answered with something unexpected.
    #[error("Lease store error: {0}")]
    Backend(String),
}

/// Atomic set-if-absent / compare-and-delete store with per-key expiry.
///
/// Implementations must be `Send + Sync` and safe to share between workers.
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `token` with the given TTL if the key is absent or expired.
    ///
    /// Returns `true` if the lease was taken, `false` if someone else holds it.
    ///
    /// # Errors
    ///
    /// `InvalidTtl` for a zero TTL, `Unavailable`/`Backend` for store failures.
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        token: &'a str,
        ttl: Duration,
    ) -> LeaseFuture<'a, bool>;

    /// Delete `key` if it still holds `token`.
    ///
    /// Returns `true` if this call removed the lease, `false` if it had already
    /// expired or belongs to someone else. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// `Unavailable`/`Backend` for store failures.
    fn release<'a>(&'a self, key: &'a str, token: &'a str) -> LeaseFuture<'a, bool>;

    /// Reset the expiry of `key` to `ttl` from now if it still holds `token`.
    ///
    /// Returns `false` when the lease was lost.
    ///
    /// # Errors
    ///
    /// `InvalidTtl` for a zero TTL, `Unavailable`/`Backend` for store failures.
    fn renew<'a>(&'a self, key: &'a str, token: &'a str, ttl: Duration) -> LeaseFuture<'a, bool>;
}
