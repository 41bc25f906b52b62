//! Concurrency tests for last-seat and contention scenarios.
//!
//! These run the full pipeline (admission, coordinator lock, executor) against the
//! in-memory ledger and lease store and check that no unit is ever granted twice.
//!
//! Run with: `cargo test -p seatguard-runtime --test concurrency_stress_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use seatguard_core::attempt::AttemptTarget;
use seatguard_core::ledger::{
    ConditionalChange, LedgerFuture, LedgerTransaction, ResourceLedger, RowLockMode,
};
use seatguard_core::outcome::{RejectReason, ReservationOutcome};
use seatguard_core::resource::{
    Mutation, PoolId, RequesterId, ResourceId, ResourcePool, ResourceSnapshot, Version,
};
use seatguard_runtime::{
    AdmissionGate, BookingRequest, Execution, IsolationStrategy, LockAcquisition,
    LockCoordinator, ReservationConfig, ReservationOrchestrator, WorkerPool,
};
use seatguard_testing::{InMemoryLeaseStore, InMemoryLedger, init_tracing};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

fn orchestrator(
    ledger: Arc<dyn ResourceLedger>,
    leases: &InMemoryLeaseStore,
    config: ReservationConfig,
) -> Arc<ReservationOrchestrator> {
    Arc::new(
        ReservationOrchestrator::builder(ledger, Arc::new(leases.clone()))
            .config(config)
            .build(),
    )
}

fn optimistic() -> ReservationConfig {
    let mut config = ReservationConfig::default();
    config.executor.strategy = IsolationStrategy::Optimistic;
    config
}

/// Holds the first two `read` calls at a barrier so both callers observe the
/// same version before either commits.
struct LockstepReads {
    inner: InMemoryLedger,
    barrier: Barrier,
    reads: AtomicUsize,
}

impl ResourceLedger for LockstepReads {
    fn read<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, ResourceSnapshot> {
        Box::pin(async move {
            let snapshot = self.inner.read(resource).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            Ok(snapshot)
        })
    }

    fn commit_if<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Version,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version> {
        self.inner.commit_if(resource, expected, mutation)
    }

    fn commit_all_if(&self, changes: Vec<ConditionalChange>) -> LedgerFuture<'_, Vec<Version>> {
        self.inner.commit_all_if(changes)
    }

    fn begin(&self) -> LedgerFuture<'_, Box<dyn LedgerTransaction>> {
        self.inner.begin()
    }
}

/// 100 concurrent pessimistic reservations for one seat.
///
/// Exactly one wins; every loser is told the seat is contended or sold out.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_concurrent_requests_for_last_seat() {
    init_tracing();
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("train-12/seat-41");
    ledger.provision(&seat, 1).unwrap();
    let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, ReservationConfig::default());

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            let seat = seat.clone();
            tokio::spawn(async move {
                orchestrator
                    .reserve(&RequesterId::new(format!("user-{i}")), &seat)
                    .await
            })
        })
        .collect();
    let outcomes: Vec<ReservationOutcome> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let granted = outcomes.iter().filter(|o| o.is_granted()).count();
    let rejected = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o.reject_reason(),
                Some(RejectReason::Contended | RejectReason::SoldOut)
            )
        })
        .count();

    println!("granted={granted} rejected={rejected}");
    assert_eq!(granted, 1, "exactly one reservation must win");
    assert_eq!(rejected, 99, "every other attempt is contended or sold out");
    assert_eq!(ledger.read(&seat).await.unwrap().available, 0);
    assert_eq!(ledger.allocations(&seat).len(), 1);
    assert_eq!(leases.live_count(), 0, "every lease is released");
}

/// Two optimistic attempts both read version 0; the loser conflicts, retries,
/// finds the seat gone and reports sold out.
#[tokio::test]
async fn test_optimistic_race_loser_sees_sold_out() {
    let inner = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("seat-1");
    inner.provision(&seat, 1).unwrap();
    let ledger = Arc::new(LockstepReads {
        inner: inner.clone(),
        barrier: Barrier::new(2),
        reads: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(ledger, &leases, optimistic());

    let (alice_id, bob_id) = (RequesterId::new("alice"), RequesterId::new("bob"));
    let (alice, bob) = tokio::join!(
        orchestrator.reserve(&alice_id, &seat),
        orchestrator.reserve(&bob_id, &seat),
    );

    let mut outcomes = [alice, bob];
    outcomes.sort_by_key(|o| !o.is_granted());
    assert_eq!(
        outcomes[0],
        ReservationOutcome::Granted {
            resource: seat.clone(),
            version: Version::new(1),
        }
    );
    assert_eq!(
        outcomes[1],
        ReservationOutcome::Rejected(RejectReason::SoldOut)
    );
    assert_eq!(inner.allocations(&seat).len(), 1);
}

/// After any mix of concurrent commits the version equals the number of commits,
/// and the allocation log has exactly one entry per version.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_version_counts_commits_exactly() {
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("coach-3");
    ledger.provision(&seat, 10).unwrap();

    let pessimistic = orchestrator(Arc::new(ledger.clone()), &leases, ReservationConfig::default());
    let optimistic = orchestrator(Arc::new(ledger.clone()), &leases, optimistic());

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let orchestrator = if i % 2 == 0 {
                Arc::clone(&pessimistic)
            } else {
                Arc::clone(&optimistic)
            };
            let seat = seat.clone();
            tokio::spawn(async move {
                orchestrator
                    .reserve(&RequesterId::new(format!("user-{i}")), &seat)
                    .await
            })
        })
        .collect();
    let granted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|o| o.as_ref().unwrap().is_granted())
        .count();

    let snapshot = ledger.read(&seat).await.unwrap();
    let log = ledger.allocations(&seat);
    assert!(granted <= 10);
    assert_eq!(snapshot.version.value(), granted as u64);
    assert_eq!(snapshot.available, 10 - u32::try_from(granted).unwrap());

    let versions: Vec<u64> = log.iter().map(|a| a.version.value()).collect();
    let expected: Vec<u64> = (1..=granted as u64).collect();
    assert_eq!(versions, expected, "versions are gap-free and never repeat");
}

/// Once a seat is gone every later attempt is sold out, under either strategy.
#[tokio::test]
async fn test_sold_out_is_final() {
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("seat-1");
    ledger.provision(&seat, 1).unwrap();

    for config in [ReservationConfig::default(), optimistic()] {
        let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, config);
        orchestrator
            .reserve(&RequesterId::new("winner"), &seat)
            .await;
        for i in 0..20 {
            assert_eq!(
                orchestrator
                    .reserve(&RequesterId::new(format!("late-{i}")), &seat)
                    .await,
                ReservationOutcome::Rejected(RejectReason::SoldOut)
            );
        }
    }
    assert_eq!(ledger.allocations(&seat).len(), 1);
}

/// Ten simultaneous attempts from one requester: one is admitted, the rest are
/// told an attempt is already in progress.
#[tokio::test(start_paused = true)]
async fn test_duplicate_requester_is_admitted_once() {
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("seat-1");
    ledger.provision(&seat, 10).unwrap();
    let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, ReservationConfig::default());

    // Keep the admitted attempt busy on the row lock while the duplicates arrive.
    let mut holder = ledger.begin().await.unwrap();
    holder
        .locking_read(&seat, RowLockMode::SkipLocked)
        .await
        .unwrap()
        .unwrap();

    let alice = RequesterId::new("alice");
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let (alice, seat) = (alice.clone(), seat.clone());
            tokio::spawn(async move { orchestrator.reserve(&alice, &seat).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.rollback().await.unwrap();

    let outcomes: Vec<ReservationOutcome> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_granted()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| o.reject_reason() == Some(RejectReason::InProgress))
            .count(),
        9
    );
    assert_eq!(ledger.read(&seat).await.unwrap().available, 9);
}

/// A crashed holder blocks its key until the TTL passes, and not a moment longer.
#[tokio::test(start_paused = true)]
async fn test_abandoned_leases_are_reclaimed_after_ttl() {
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let seat = ResourceId::new("seat-1");
    ledger.provision(&seat, 2).unwrap();
    let config = ReservationConfig::default();
    let (admission_ttl, lock_ttl) = (config.admission_ttl, config.lock_ttl);
    let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, config);
    let alice = RequesterId::new("alice");

    // A worker admitted alice, then died without releasing.
    let gate = AdmissionGate::new(Arc::new(leases.clone()));
    gate.try_admit(&alice, &AttemptTarget::Resource(seat.clone()), admission_ttl)
        .await
        .unwrap()
        .unwrap();

    tokio::time::advance(admission_ttl - Duration::from_millis(1)).await;
    assert_eq!(
        orchestrator.reserve(&alice, &seat).await,
        ReservationOutcome::Rejected(RejectReason::InProgress)
    );
    tokio::time::advance(Duration::from_millis(2)).await;
    assert!(orchestrator.reserve(&alice, &seat).await.is_granted());

    // Another worker took the coordinator lock for the seat, then died.
    let locks = LockCoordinator::new(Arc::new(leases.clone()));
    let acquired = locks.acquire(&seat, lock_ttl).await.unwrap();
    assert!(matches!(acquired, LockAcquisition::Acquired(_)));

    let bob = RequesterId::new("bob");
    tokio::time::advance(lock_ttl - Duration::from_millis(1)).await;
    assert_eq!(
        orchestrator.reserve(&bob, &seat).await,
        ReservationOutcome::Rejected(RejectReason::Contended)
    );
    tokio::time::advance(Duration::from_millis(2)).await;
    assert!(orchestrator.reserve(&bob, &seat).await.is_granted());
}

/// N workers racing for "any seat on the train" with N seats: every seat is
/// granted exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_skip_locked_pool_bookings_fill_every_seat_once() {
    const SEATS: usize = 16;
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let members: Vec<ResourceId> = (0..SEATS)
        .map(|i| ResourceId::new(format!("train-7/seat-{i:02}")))
        .collect();
    for member in &members {
        ledger.provision(member, 1).unwrap();
    }
    let train = ResourcePool::new(PoolId::new("train-7"), members.clone());

    let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, ReservationConfig::default());
    let pool = WorkerPool::spawn(orchestrator, SEATS, SEATS);
    let handle = pool.handle();

    let tasks: Vec<_> = (0..SEATS)
        .map(|i| {
            let handle = handle.clone();
            let train = train.clone();
            tokio::spawn(async move {
                handle
                    .submit(BookingRequest::any_of(
                        RequesterId::new(format!("passenger-{i}")),
                        train,
                    ))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut won = BTreeSet::new();
    for outcome in futures::future::join_all(tasks).await {
        match outcome.unwrap() {
            ReservationOutcome::Granted { resource, .. } => {
                assert!(won.insert(resource), "a seat was granted twice");
            }
            other => panic!("expected every passenger to get a seat, got {other}"),
        }
    }
    assert_eq!(won.len(), SEATS);
    for member in &members {
        assert_eq!(ledger.allocations(member).len(), 1);
    }
    pool.shutdown().await;
}

/// Transfers in opposite directions between the same two resources lock in one
/// global order, so they all complete.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_opposite_transfers_never_deadlock() {
    let ledger = InMemoryLedger::new();
    let leases = InMemoryLeaseStore::new();
    let (a, b) = (ResourceId::new("a"), ResourceId::new("b"));
    ledger.provision(&a, 100).unwrap();
    ledger.provision(&b, 100).unwrap();

    let mut config = ReservationConfig::default();
    config.executor.lock_wait = Duration::from_secs(10);
    let orchestrator = orchestrator(Arc::new(ledger.clone()), &leases, config);
    let mover = RequesterId::new("mover");
    for _ in 0..50 {
        assert!(orchestrator.executor().execute(&mover, &a).await.unwrap().is_committed());
        assert!(orchestrator.executor().execute(&mover, &b).await.unwrap().is_committed());
    }

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            let (from, to) = if i % 2 == 0 {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            let mover = mover.clone();
            tokio::spawn(async move { orchestrator.executor().transfer(&mover, &from, &to).await })
        })
        .collect();

    let all = tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(tasks))
        .await
        .expect("transfers deadlocked");
    for result in all {
        assert!(matches!(result.unwrap().unwrap(), Execution::Committed(_)));
    }

    assert_eq!(ledger.read(&a).await.unwrap().available, 50);
    assert_eq!(ledger.read(&b).await.unwrap().available, 50);
    assert_eq!(ledger.read(&a).await.unwrap().version, Version::new(90));
}
