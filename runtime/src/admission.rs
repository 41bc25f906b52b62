//! Admission gate: one in-flight attempt per (requester, target).
//!
//! A client that retries while its first request is still being processed must
//! not start a second, competing transaction. The gate takes a lease on
//! `admission:{requester}:{target}`; whoever finds the key already present is told
//! the attempt is in progress. The lease expiry bounds how long a crashed worker
//! can block that pair.

use seatguard_core::attempt::AttemptTarget;
use seatguard_core::lease::{LeaseError, LeaseStore};
use seatguard_core::resource::RequesterId;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Proof of admission, handed back to [`AdmissionGate::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSlot {
    /// Who was admitted.
    pub requester: RequesterId,
    /// For what.
    pub target: AttemptTarget,
    /// How long the slot lives if never released.
    pub ttl: Duration,
    key: String,
    token: String,
}

impl AdmissionSlot {
    /// Lease key backing this slot.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Deduplicates concurrent attempts before they reach the ledger.
#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn LeaseStore>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate").finish_non_exhaustive()
    }
}

impl AdmissionGate {
    /// Create a gate over the given lease store.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// The requester is length-prefixed so ids containing `:` cannot alias.
    fn key(requester: &RequesterId, target: &AttemptTarget) -> String {
        format!(
            "admission:{}:{requester}:{}",
            requester.as_str().len(),
            target.key()
        )
    }

    /// Try to admit `requester` for `target`.
    ///
    /// Returns `None` when an attempt for the same pair is already in flight.
    ///
    /// # Errors
    ///
    /// `InvalidTtl` for a zero TTL; store failures otherwise.
    pub async fn try_admit(
        &self,
        requester: &RequesterId,
        target: &AttemptTarget,
        ttl: Duration,
    ) -> Result<Option<AdmissionSlot>, LeaseError> {
        let key = Self::key(requester, target);
        let token = Uuid::new_v4().to_string();

        if !self.store.try_acquire(&key, &token, ttl).await? {
            tracing::debug!(%requester, %target, "Admission refused: attempt already in progress");
            return Ok(None);
        }

        tracing::trace!(%requester, %target, ttl_ms = ttl.as_millis(), "Admitted");
        Ok(Some(AdmissionSlot {
            requester: requester.clone(),
            target: target.clone(),
            ttl,
            key,
            token,
        }))
    }

    /// Give the slot back. Releasing twice, or after expiry, is a no-op.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn release(&self, slot: &AdmissionSlot) -> Result<(), LeaseError> {
        if !self.store.release(&slot.key, &slot.token).await? {
            tracing::debug!(
                requester = %slot.requester,
                target = %slot.target,
                "Admission slot already gone at release"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use seatguard_core::resource::ResourceId;
    use seatguard_testing::InMemoryLeaseStore;

    fn target(id: &str) -> AttemptTarget {
        AttemptTarget::Resource(ResourceId::new(id))
    }

    #[tokio::test]
    async fn test_second_admission_refused_until_release() {
        let gate = AdmissionGate::new(Arc::new(InMemoryLeaseStore::new()));
        let alice = RequesterId::new("alice");
        let ttl = Duration::from_secs(30);

        let slot = gate.try_admit(&alice, &target("s1"), ttl).await.unwrap();
        assert!(slot.is_some());
        assert!(
            gate.try_admit(&alice, &target("s1"), ttl)
                .await
                .unwrap()
                .is_none()
        );

        // Different resource or different requester is independent.
        assert!(
            gate.try_admit(&alice, &target("s2"), ttl)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            gate.try_admit(&RequesterId::new("bob"), &target("s1"), ttl)
                .await
                .unwrap()
                .is_some()
        );

        let slot = slot.unwrap();
        gate.release(&slot).await.unwrap();
        gate.release(&slot).await.unwrap();
        assert!(
            gate.try_admit(&alice, &target("s1"), ttl)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_ids_containing_separators_do_not_alias() {
        let gate = AdmissionGate::new(Arc::new(InMemoryLeaseStore::new()));
        let ttl = Duration::from_secs(30);

        let first = gate
            .try_admit(&RequesterId::new("alice:resource:x"), &target("y"), ttl)
            .await
            .unwrap();
        let second = gate
            .try_admit(&RequesterId::new("alice"), &target("x:resource:y"), ttl)
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_some(), "distinct pairs must be admitted independently");
        assert_ne!(first.unwrap().key(), second.unwrap().key());
    }

    #[tokio::test]
    async fn test_stale_slot_release_does_not_evict_new_holder() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let gate = AdmissionGate::new(store.clone());
        let alice = RequesterId::new("alice");

        let first = gate
            .try_admit(&alice, &target("s1"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        gate.release(&first).await.unwrap();
        let second = gate
            .try_admit(&alice, &target("s1"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        gate.release(&first).await.unwrap();
        assert!(store.holder(second.key()).is_some());
    }
}
