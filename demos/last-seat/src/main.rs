//! Last Seat Demo
//!
//! A hundred requesters race for the last seat on train 12 through the worker
//! pool, then a dozen passengers ask for "any seat" on train 7, which has eight.
//! Everything runs against the in-memory ledger and lease store.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p last-seat
//! SEATGUARD_STRATEGY=optimistic cargo run -p last-seat
//! ```
//!
//! Any `SEATGUARD_*` variable understood by `ReservationConfig::from_env` applies.
//! The Prometheus text snapshot is printed at the end.

#![allow(missing_docs)]

use seatguard_core::outcome::ReservationOutcome;
use seatguard_core::resource::{PoolId, RequesterId, ResourceId, ResourcePool};
use seatguard_runtime::metrics::PrometheusMetrics;
use seatguard_runtime::{
    BookingRequest, PoolHandle, ReservationConfig, ReservationOrchestrator, WorkerPool,
};
use seatguard_testing::{InMemoryLeaseStore, InMemoryLedger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RACERS: usize = 100;
const TRAIN_SEATS: usize = 8;
const PASSENGERS: usize = 12;

/// Submit every request at once and count outcomes by label.
async fn race(
    handle: &PoolHandle,
    requests: Vec<BookingRequest>,
) -> anyhow::Result<BTreeMap<&'static str, usize>> {
    let replies = futures::future::join_all(requests.into_iter().map(|r| handle.submit(r))).await;

    let mut tally = BTreeMap::new();
    for reply in replies {
        let outcome = reply?;
        if let ReservationOutcome::Granted { resource, version } = &outcome {
            tracing::info!(%resource, %version, "Seat granted");
        }
        *tally.entry(outcome.label()).or_insert(0) += 1;
    }
    Ok(tally)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seatguard_runtime=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install the Prometheus recorder
    let metrics = PrometheusMetrics::install()?;

    // 3. Load configuration
    let config = ReservationConfig::from_env()?;
    tracing::info!(
        strategy = %config.executor.strategy,
        lock_policy = %config.lock_policy,
        workers = config.workers,
        "Starting last-seat demo"
    );

    // 4. Provision the ledger
    let ledger = InMemoryLedger::new();
    let last_seat = ResourceId::new("train-12/seat-41");
    ledger.provision(&last_seat, 1)?;

    let members: Vec<ResourceId> = (1..=TRAIN_SEATS)
        .map(|i| ResourceId::new(format!("train-7/seat-{i:02}")))
        .collect();
    for member in &members {
        ledger.provision(member, 1)?;
    }
    let train = ResourcePool::new(PoolId::new("train-7"), members);

    // 5. Start the worker pool
    let orchestrator = Arc::new(
        ReservationOrchestrator::builder(
            Arc::new(ledger.clone()),
            Arc::new(InMemoryLeaseStore::new()),
        )
        .config(config)
        .build(),
    );
    let pool = WorkerPool::from_config(orchestrator);
    let handle = pool.handle();

    // 6. Everyone wants the last seat
    let racers = (0..RACERS)
        .map(|i| BookingRequest::resource(RequesterId::new(format!("racer-{i}")), last_seat.clone()))
        .collect();
    let tally = race(&handle, racers).await?;
    tracing::info!(?tally, "Last seat race finished");

    // 7. Any seat on train 7
    let passengers = (0..PASSENGERS)
        .map(|i| BookingRequest::any_of(RequesterId::new(format!("passenger-{i}")), train.clone()))
        .collect();
    let tally = race(&handle, passengers).await?;
    tracing::info!(?tally, "Train 7 booking finished");

    // 8. Shut down and report
    pool.shutdown().await;

    let granted = ledger.allocations(&last_seat).len();
    tracing::info!(granted, "Allocations recorded for the last seat");
    println!("{}", metrics.render());

    Ok(())
}
