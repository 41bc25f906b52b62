//! # SeatGuard Runtime
//!
//! The reservation pipeline for the SeatGuard concurrency core.
//!
//! ## Core Components
//!
//! - **Admission Gate** ([`admission`]): one in-flight attempt per requester and target
//! - **Lock Coordinator** ([`lock`]): TTL-bounded per-resource leases, ordered
//!   multi-resource acquisition
//! - **Transaction Executor** ([`executor`]): pessimistic or optimistic
//!   read-check-write with bounded conflict retry
//! - **Reservation Orchestrator** ([`orchestrator`]): composes the above into
//!   `reserve` and `reserve_any`
//! - **Worker Pool** ([`pool`]): bounded queue in front of a fixed set of workers
//!
//! ## Example
//!
//! ```ignore
//! use seatguard_runtime::{ReservationConfig, ReservationOrchestrator};
//! use seatguard_testing::{InMemoryLeaseStore, InMemoryLedger};
//!
//! let ledger = InMemoryLedger::new();
//! ledger.provision(&seat, 1)?;
//!
//! let orchestrator = ReservationOrchestrator::builder(
//!     Arc::new(ledger),
//!     Arc::new(InMemoryLeaseStore::new()),
//! )
//! .config(ReservationConfig::from_env()?)
//! .build();
//!
//! let outcome = orchestrator.reserve(&requester, &seat).await;
//! ```

/// Admission gate keyed on requester and target
pub mod admission;

/// Configuration loaded from the environment
pub mod config;

/// Transaction executor and isolation strategies
pub mod executor;

/// Lock coordinator over the lease store
pub mod lock;

/// Metric names and the Prometheus recorder
pub mod metrics;

/// Reservation orchestrator
pub mod orchestrator;

/// Worker pool fed by a bounded queue
pub mod pool;

/// Retry logic with exponential backoff
pub mod retry;

pub use admission::{AdmissionGate, AdmissionSlot};
pub use config::{ConfigError, LockPolicy, ReservationConfig};
pub use executor::{
    Commit, Execution, ExecutorConfig, ExecutorError, IsolationStrategy, TransactionExecutor,
    TransferCommit,
};
pub use lock::{LockAcquisition, LockCoordinator, LockHandle, MultiLockAcquisition};
pub use orchestrator::{OrchestratorBuilder, ReservationOrchestrator};
pub use pool::{BookingRequest, BookingTarget, PendingBooking, PoolError, PoolHandle, WorkerPool};
pub use retry::{Backoff, BackoffStep, RetryPolicy};
