//! # SeatGuard Testing
//!
//! Testing utilities for the SeatGuard reservation core.
//!
//! This crate provides:
//! - [`InMemoryLedger`]: a [`ResourceLedger`](seatguard_core::ledger::ResourceLedger)
//!   with real row-lock, skip-locked and version-check semantics
//! - [`InMemoryLeaseStore`]: a [`LeaseStore`](seatguard_core::lease::LeaseStore)
//!   whose expiry follows tokio's (pausable) clock
//! - [`FixedClock`] for deterministic timestamps
//! - [`init_tracing`] to see logs from a failing test
//!
//! ## Example
//!
//! ```ignore
//! use seatguard_testing::{InMemoryLeaseStore, InMemoryLedger, test_clock};
//!
//! #[tokio::test]
//! async fn test_last_seat() {
//!     let ledger = InMemoryLedger::new();
//!     ledger.provision(&ResourceId::new("seat-1"), 1).unwrap();
//!     let orchestrator = ReservationOrchestrator::builder(
//!         Arc::new(ledger),
//!         Arc::new(InMemoryLeaseStore::new()),
//!     )
//!     .clock(Arc::new(test_clock()))
//!     .build();
//!     // ...
//! }
//! ```

pub mod lease;
pub mod ledger;

pub use lease::InMemoryLeaseStore;
pub use ledger::InMemoryLedger;

use chrono::{DateTime, Utc};
use seatguard_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use seatguard_testing::mocks::FixedClock;
    /// use seatguard_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

pub use mocks::{FixedClock, test_clock};

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
