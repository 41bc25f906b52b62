//! `Redis` lease store for SeatGuard.
//!
//! Implements the `LeaseStore` trait from `seatguard-core`, giving the admission
//! gate and the lock coordinator a store shared by every process:
//!
//! - acquire: `SET key token NX PX ttl`
//! - release: compare-and-delete, as a Lua script so the check and the delete
//!   are one atomic step
//! - renew: compare-and-`PEXPIRE`, also a script
//!
//! A holder that crashes leaves its key to expire on the server.
//!
//! # Example
//!
//! ```no_run
//! use seatguard_redis::RedisLeaseStore;
//! use seatguard_core::lease::LeaseStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisLeaseStore::new("redis://127.0.0.1:6379").await?;
//! let held = store.try_acquire("lock:seat-1", "worker-a", Duration::from_secs(5)).await?;
//! assert!(held);
//! store.release("lock:seat-1", "worker-a").await?;
//! # Ok(())
//! # }
//! ```

use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use seatguard_core::lease::{LeaseError, LeaseFuture, LeaseStore};
use std::time::Duration;

/// Delete `KEYS[1]` only while it still holds `ARGV[1]`.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Reset the expiry of `KEYS[1]` to `ARGV[2]` ms only while it holds `ARGV[1]`.
const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// [`LeaseStore`] backed by a `Redis` server.
///
/// Cloning is cheap: clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn_manager: ConnectionManager,
    prefix: String,
    release: Script,
    renew: Script,
}

impl std::fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    /// Connect to `Redis`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// [`LeaseError::Unavailable`] if the connection cannot be established.
    pub async fn new(redis_url: &str) -> Result<Self, LeaseError> {
        let client = Client::open(redis_url)
            .map_err(|e| LeaseError::Backend(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LeaseError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            conn_manager,
            prefix: "seatguard:".to_string(),
            release: Script::new(RELEASE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
        })
    }

    /// Namespace every key under `prefix` (default `seatguard:`).
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

/// `PX` argument for a TTL: whole milliseconds, never zero.
fn ttl_millis(ttl: Duration) -> Result<u64, LeaseError> {
    if ttl.is_zero() {
        return Err(LeaseError::InvalidTtl);
    }
    Ok(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}

fn map_error(error: &RedisError) -> LeaseError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        LeaseError::Unavailable(error.to_string())
    } else {
        LeaseError::Backend(error.to_string())
    }
}

impl LeaseStore for RedisLeaseStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        token: &'a str,
        ttl: Duration,
    ) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let millis = ttl_millis(ttl)?;
            let mut conn = self.conn_manager.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(self.key(key))
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_error(&e))?;
            let acquired = reply.is_some();
            tracing::trace!(key, acquired, ttl_ms = millis, "Lease acquire");
            Ok(acquired)
        })
    }

    fn release<'a>(&'a self, key: &'a str, token: &'a str) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: i64 = self
                .release
                .key(self.key(key))
                .arg(token)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_error(&e))?;
            Ok(removed == 1)
        })
    }

    fn renew<'a>(&'a self, key: &'a str, token: &'a str, ttl: Duration) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let millis = ttl_millis(ttl)?;
            let mut conn = self.conn_manager.clone();
            let extended: i64 = self
                .renew
                .key(self.key(key))
                .arg(token)
                .arg(millis)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_error(&e))?;
            Ok(extended == 1)
        })
    }
}
