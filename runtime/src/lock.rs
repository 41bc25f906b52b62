//! Lock coordinator: TTL-bounded per-resource mutual exclusion.
//!
//! The coordinator lets at most one orchestrator call at a time into the
//! expensive transactional step for a given resource, so losers are turned away
//! cheaply instead of piling up on database row locks.
//!
//! It is an optimization and fairness layer, not the correctness boundary. Every
//! lock is a lease and may expire under a slow holder; the transaction executor's
//! version checks and row locks still guarantee there is no overbooking when that
//! happens.
//!
//! # Ordering
//!
//! [`LockCoordinator::acquire_all`] sorts and deduplicates resource ids before
//! acquiring, so two callers wanting the same set can never hold one lock each
//! and wait on the other.

use chrono::{DateTime, Utc};
use seatguard_core::environment::{Clock, SystemClock};
use seatguard_core::lease::{LeaseError, LeaseStore};
use seatguard_core::resource::ResourceId;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A held lease on one resource.
///
/// Owned by exactly one orchestrator call; give it back with
/// [`LockCoordinator::release`]. If the holder crashes the lease simply expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Locked resource.
    pub resource: ResourceId,
    /// Random token identifying this holder.
    pub holder: String,
    /// When the lease was taken (or last renewed).
    pub acquired_at: DateTime<Utc>,
    /// Lease duration from `acquired_at`.
    pub ttl: Duration,
}

/// Result of a non-blocking acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The lease is ours.
    Acquired(LockHandle),
    /// Someone else holds it; the caller decides whether to retry, queue or reject.
    Busy,
}

/// Result of acquiring several resources at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiLockAcquisition {
    /// Every lease is held, in ascending resource order.
    Acquired(Vec<LockHandle>),
    /// The named resource was busy; nothing is held.
    Busy(ResourceId),
}

/// Per-resource lease coordinator.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator").finish_non_exhaustive()
    }
}

impl LockCoordinator {
    /// Create a coordinator over the given lease store.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different clock for `acquired_at` timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(resource: &ResourceId) -> String {
        format!("lock:{resource}")
    }

    /// Try to take the lease on `resource` without waiting.
    ///
    /// # Errors
    ///
    /// `InvalidTtl` for a zero TTL; store failures otherwise.
    pub async fn acquire(
        &self,
        resource: &ResourceId,
        ttl: Duration,
    ) -> Result<LockAcquisition, LeaseError> {
        if ttl.is_zero() {
            return Err(LeaseError::InvalidTtl);
        }
        let holder = Uuid::new_v4().to_string();
        if !self
            .store
            .try_acquire(&Self::key(resource), &holder, ttl)
            .await?
        {
            tracing::debug!(%resource, "Lock busy");
            return Ok(LockAcquisition::Busy);
        }

        Ok(LockAcquisition::Acquired(LockHandle {
            resource: resource.clone(),
            holder,
            acquired_at: self.clock.now(),
            ttl,
        }))
    }

    /// Take leases on every resource, in ascending order, or none at all.
    ///
    /// # Errors
    ///
    /// Store failures. Locks taken before the failure are released first.
    pub async fn acquire_all(
        &self,
        resources: &[ResourceId],
        ttl: Duration,
    ) -> Result<MultiLockAcquisition, LeaseError> {
        let mut ordered: Vec<&ResourceId> = resources.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for resource in ordered {
            let step = self.acquire(resource, ttl).await;
            match step {
                Ok(LockAcquisition::Acquired(handle)) => held.push(handle),
                Ok(LockAcquisition::Busy) => {
                    self.release_all(held).await;
                    return Ok(MultiLockAcquisition::Busy(resource.clone()));
                }
                Err(err) => {
                    self.release_all(held).await;
                    return Err(err);
                }
            }
        }
        Ok(MultiLockAcquisition::Acquired(held))
    }

    /// Extend the lease to `ttl` from now, if the handle still owns it.
    ///
    /// Renewal is the holder's job whenever its work may outlive the lease.
    /// Returns `false` when the lease was already lost.
    ///
    /// # Errors
    ///
    /// `InvalidTtl` for a zero TTL; store failures otherwise.
    pub async fn renew(&self, handle: &mut LockHandle, ttl: Duration) -> Result<bool, LeaseError> {
        let renewed = self
            .store
            .renew(&Self::key(&handle.resource), &handle.holder, ttl)
            .await?;
        if renewed {
            handle.acquired_at = self.clock.now();
            handle.ttl = ttl;
        } else {
            tracing::warn!(resource = %handle.resource, "Lock lost before renewal");
            metrics::counter!(crate::metrics::LEASES_LOST, "kind" => "lock").increment(1);
        }
        Ok(renewed)
    }

    /// Give the lease back.
    ///
    /// Returns `false` if the lease had already expired (and may now belong to
    /// someone else, whose lease is left untouched).
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn release(&self, handle: LockHandle) -> Result<bool, LeaseError> {
        let released = self
            .store
            .release(&Self::key(&handle.resource), &handle.holder)
            .await?;
        if !released {
            tracing::warn!(
                resource = %handle.resource,
                ttl_ms = handle.ttl.as_millis(),
                "Lock expired before release; the holder overran its lease"
            );
            metrics::counter!(crate::metrics::LEASES_LOST, "kind" => "lock").increment(1);
        }
        Ok(released)
    }

    /// Release several handles, in reverse acquisition order, logging failures.
    pub async fn release_all(&self, handles: Vec<LockHandle>) {
        for handle in handles.into_iter().rev() {
            let resource = handle.resource.clone();
            if let Err(err) = self.release(handle).await {
                tracing::error!(%resource, error = %err, "Failed to release lock");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use seatguard_testing::InMemoryLeaseStore;

    fn acquired(step: LockAcquisition) -> LockHandle {
        match step {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::Busy => panic!("expected lock to be free"),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_and_fail_fast() {
        let coordinator = LockCoordinator::new(Arc::new(InMemoryLeaseStore::new()));
        let seat = ResourceId::new("seat-1");
        let ttl = Duration::from_secs(5);

        let handle = acquired(coordinator.acquire(&seat, ttl).await.unwrap());
        assert_eq!(
            coordinator.acquire(&seat, ttl).await.unwrap(),
            LockAcquisition::Busy
        );

        assert!(coordinator.release(handle).await.unwrap());
        assert!(matches!(
            coordinator.acquire(&seat, ttl).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_refused() {
        let coordinator = LockCoordinator::new(Arc::new(InMemoryLeaseStore::new()));
        assert_eq!(
            coordinator
                .acquire(&ResourceId::new("seat-1"), Duration::ZERO)
                .await,
            Err(LeaseError::InvalidTtl)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_holder_lock_reclaimed_after_ttl_only() {
        let coordinator = LockCoordinator::new(Arc::new(InMemoryLeaseStore::new()));
        let seat = ResourceId::new("seat-1");
        let ttl = Duration::from_secs(5);

        // Holder "crashes": the handle is dropped without release.
        drop(acquired(coordinator.acquire(&seat, ttl).await.unwrap()));

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert_eq!(
            coordinator.acquire(&seat, ttl).await.unwrap(),
            LockAcquisition::Busy
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(matches!(
            coordinator.acquire(&seat, ttl).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_keeps_lease_alive() {
        let coordinator = LockCoordinator::new(Arc::new(InMemoryLeaseStore::new()));
        let seat = ResourceId::new("seat-1");
        let ttl = Duration::from_secs(5);
        let mut handle = acquired(coordinator.acquire(&seat, ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(coordinator.renew(&mut handle, ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            coordinator.acquire(&seat, ttl).await.unwrap(),
            LockAcquisition::Busy
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!coordinator.renew(&mut handle, ttl).await.unwrap());
        assert!(!coordinator.release(handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_all_is_ordered_and_all_or_nothing() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let coordinator = LockCoordinator::new(store.clone());
        let ttl = Duration::from_secs(5);
        let (a, b, c) = (
            ResourceId::new("a"),
            ResourceId::new("b"),
            ResourceId::new("c"),
        );

        let blocker = acquired(coordinator.acquire(&c, ttl).await.unwrap());
        let step = coordinator
            .acquire_all(&[c.clone(), a.clone(), b.clone()], ttl)
            .await
            .unwrap();
        assert_eq!(step, MultiLockAcquisition::Busy(c.clone()));
        // a and b were rolled back
        assert_eq!(store.live_count(), 1);

        coordinator.release(blocker).await.unwrap();
        let MultiLockAcquisition::Acquired(handles) = coordinator
            .acquire_all(&[c.clone(), a.clone(), b.clone(), a.clone()], ttl)
            .await
            .unwrap()
        else {
            panic!("expected all locks");
        };
        let order: Vec<&str> = handles.iter().map(|h| h.resource.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        coordinator.release_all(handles).await;
        assert_eq!(store.live_count(), 0);
    }
}
