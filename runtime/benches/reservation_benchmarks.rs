//! Reservation Path Benchmarks
//!
//! Overhead of the reservation pipeline against the in-memory backends:
//! - RetryPolicy: backoff calculation
//! - Grant: one uncontended reservation, pessimistic and optimistic
//! - Sold out: the rejection fast path
//! - Contention: 16 concurrent requests for one seat
//!
//! Run with: `cargo bench --bench reservation_benchmarks`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use seatguard_core::resource::{RequesterId, ResourceId};
use seatguard_runtime::{IsolationStrategy, ReservationConfig, ReservationOrchestrator, RetryPolicy};
use seatguard_testing::{InMemoryLeaseStore, InMemoryLedger};
use std::sync::Arc;

fn orchestrator(ledger: &InMemoryLedger, strategy: IsolationStrategy) -> ReservationOrchestrator {
    let mut config = ReservationConfig::default();
    config.executor.strategy = strategy;
    ReservationOrchestrator::builder(
        Arc::new(ledger.clone()),
        Arc::new(InMemoryLeaseStore::new()),
    )
    .config(config)
    .build()
}

/// Benchmark backoff calculation
fn benchmark_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_policy");
    group.throughput(Throughput::Elements(1));

    let policy = RetryPolicy::default();
    group.bench_function("delay_calculation", |b| {
        b.iter(|| black_box(policy.delay_for_attempt(black_box(3))));
    });
    group.bench_function("jittered_delay", |b| {
        b.iter(|| black_box(policy.jittered_delay(black_box(3))));
    });

    group.finish();
}

/// Benchmark a single uncontended grant
fn benchmark_grant(c: &mut Criterion) {
    let mut group = c.benchmark_group("grant");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for (name, strategy) in [
        ("pessimistic", IsolationStrategy::Pessimistic),
        ("optimistic", IsolationStrategy::Optimistic),
    ] {
        group.bench_function(name, |b| {
            let requester = RequesterId::new("bench");
            let seat = ResourceId::new("seat");
            b.to_async(&runtime).iter(|| async {
                let ledger = InMemoryLedger::new();
                ledger.provision(&seat, 1).expect("provision");
                let outcome = orchestrator(&ledger, strategy).reserve(&requester, &seat).await;
                black_box(outcome)
            });
        });
    }

    group.finish();
}

/// Benchmark the rejection path once a seat is gone
fn benchmark_sold_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("sold_out");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let ledger = InMemoryLedger::new();
    let seat = ResourceId::new("seat");
    ledger.provision(&seat, 0).expect("provision");
    let orchestrator = orchestrator(&ledger, IsolationStrategy::Pessimistic);
    let requester = RequesterId::new("late");

    group.bench_function("reserve", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(orchestrator.reserve(&requester, &seat).await) });
    });

    group.finish();
}

/// Benchmark 16 requesters racing for one seat
fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    group.throughput(Throughput::Elements(16));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let requesters: Vec<RequesterId> = (0..16)
        .map(|i| RequesterId::new(format!("user-{i}")))
        .collect();
    let seat = ResourceId::new("last-seat");

    group.bench_function("last_seat_16", |b| {
        b.to_async(&runtime).iter(|| async {
            let ledger = InMemoryLedger::new();
            ledger.provision(&seat, 1).expect("provision");
            let orchestrator = orchestrator(&ledger, IsolationStrategy::Pessimistic);
            let attempts = requesters.iter().map(|r| orchestrator.reserve(r, &seat));
            black_box(futures::future::join_all(attempts).await)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_retry_policy,
    benchmark_grant,
    benchmark_sold_out,
    benchmark_contention,
);
criterion_main!(benches);
