//! # SeatGuard Core
//!
//! Core traits and types for the SeatGuard reservation concurrency core.
//!
//! Many clients race for a small, shrinking set of indivisible resources (seats).
//! This crate defines the vocabulary every other crate shares:
//!
//! - **Resources**: [`resource::ResourceId`], [`resource::Version`],
//!   [`resource::ResourceSnapshot`], [`resource::ResourcePool`]
//! - **Ledger**: [`ledger::ResourceLedger`], the durable versioned record, and
//!   [`ledger::LedgerTransaction`] for row-locking access
//! - **Leases**: [`lease::LeaseStore`], expiring owner-tagged keys backing the
//!   admission gate and the lock coordinator
//! - **Outcomes**: [`outcome::ReservationOutcome`] and the
//!   [`outcome::RejectReason`] contention results
//! - **Attempts**: [`attempt::ReservationAttempt`], the per-attempt lifecycle
//!
//! ## Architecture Principles
//!
//! - The ledger is the only shared mutable state, and it is only changed through
//!   a version check or under a row lock.
//! - Contention is an outcome, not an error.
//! - Every lock is a lease: it always expires.
//! - Backends are injected through traits.

pub use chrono::{DateTime, Utc};

pub mod attempt;
pub mod lease;
pub mod ledger;
pub mod outcome;
pub mod resource;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use seatguard_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use attempt::{AttemptPhase, AttemptStatus, AttemptTarget, ReservationAttempt};
pub use lease::{LeaseError, LeaseStore};
pub use ledger::{LedgerError, LedgerTransaction, ResourceLedger, RowLockMode};
pub use outcome::{RejectReason, ReservationError, ReservationOutcome};
pub use resource::{
    Mutation, PoolId, RequesterId, ResourceId, ResourcePool, ResourceSnapshot, Version,
};
