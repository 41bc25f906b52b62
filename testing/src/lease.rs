//! In-memory lease store for tests.

use seatguard_core::lease::{LeaseError, LeaseFuture, LeaseStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory [`LeaseStore`] with TTL expiry.
///
/// Expiry is measured with `tokio::time::Instant`, so tests running with paused
/// time (`#[tokio::test(start_paused = true)]`) can move past a TTL with
/// `tokio::time::advance` instead of sleeping.
///
/// Expired entries are dropped lazily, the next time their key is touched.
/// **Production**: use `RedisLeaseStore`, where Redis expires keys itself.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLeaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token currently holding `key`, if the lease is live.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.leases
            .lock()
            .ok()?
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token.clone())
    }

    /// Number of live leases.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .map(|leases| leases.values().filter(|l| l.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Simulate the store going away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, LeaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable(
                "in-memory lease store switched off".to_string(),
            ));
        }
        self.leases
            .lock()
            .map_err(|_| LeaseError::Backend("lease map lock poisoned".to_string()))
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        token: &'a str,
        ttl: Duration,
    ) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            if ttl.is_zero() {
                return Err(LeaseError::InvalidTtl);
            }
            let now = Instant::now();
            let mut leases = self.guard()?;
            if leases.get(key).is_some_and(|lease| lease.is_live(now)) {
                return Ok(false);
            }
            leases.insert(
                key.to_string(),
                Lease {
                    token: token.to_string(),
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn release<'a>(&'a self, key: &'a str, token: &'a str) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut leases = self.guard()?;
            match leases.get(key) {
                Some(lease) if lease.token == token => {
                    let live = lease.is_live(now);
                    leases.remove(key);
                    Ok(live)
                }
                Some(lease) if !lease.is_live(now) => {
                    leases.remove(key);
                    Ok(false)
                }
                _ => Ok(false),
            }
        })
    }

    fn renew<'a>(&'a self, key: &'a str, token: &'a str, ttl: Duration) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            if ttl.is_zero() {
                return Err(LeaseError::InvalidTtl);
            }
            let now = Instant::now();
            let mut leases = self.guard()?;
            match leases.get_mut(key) {
                Some(lease) if lease.token == token && lease.is_live(now) => {
                    lease.expires_at = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}
