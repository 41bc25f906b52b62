//! Resource ledger abstraction: the durable, versioned record of resource state.
//!
//! The ledger is the single source of truth for how many units of each resource
//! are still available. It offers two disciplines for changing that state:
//!
//! - **Optimistic**: [`ResourceLedger::read`] freely, then
//!   [`ResourceLedger::commit_if`] with the version you observed. The commit only
//!   lands if nobody else committed in between.
//! - **Pessimistic**: [`ResourceLedger::begin`] a transaction and
//!   [`LedgerTransaction::locking_read`] the row, which holds it exclusively until
//!   the transaction ends. Competing locking reads either wait (bounded) or skip.
//!
//! # Implementations
//!
//! - `PostgresLedger` (in `seatguard-postgres`): `SELECT ... FOR UPDATE [SKIP LOCKED]`
//!   and `UPDATE ... WHERE version = $expected`
//! - `InMemoryLedger` (in `seatguard-testing`): per-row async mutexes, for tests
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures instead of using `async fn` so the ledger can be
//! shared as `Arc<dyn ResourceLedger>` by the executor.

use crate::resource::{Mutation, RequesterId, ResourceId, ResourceSnapshot, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Optimistic concurrency conflict: the stored version moved on.
    ///
    /// The conditional commit made no change.
    #[error("Version conflict on {resource}: expected {expected}, found {actual}")]
    Conflict {
        /// Resource where the conflict occurred.
        resource: ResourceId,
        /// Version the caller observed.
        expected: Version,
        /// Version actually stored.
        actual: Version,
    },

    /// The resource has never been provisioned.
    #[error("Resource not found: {0}")]
    NotFound(ResourceId),

    /// A bounded wait for a row lock ran out.
    #[error("Timed out after {waited:?} waiting for row lock on {resource}")]
    LockTimeout {
        /// Resource whose row lock was contended.
        resource: ResourceId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// `apply` was called on a row the transaction never locked.
    #[error("Row {0} is not locked by this transaction")]
    NotLocked(ResourceId),

    /// The mutation would leave `available` outside `0..=capacity`.
    ///
    /// This is a bug in the caller, never a business outcome.
    #[error("Invariant violation on {resource}: available {available} + delta {delta} outside 0..={capacity}")]
    InvariantViolation {
        /// Resource the mutation targeted.
        resource: ResourceId,
        /// Units available before the mutation.
        available: u32,
        /// Provisioned capacity.
        capacity: u32,
        /// Rejected delta.
        delta: i32,
    },

    /// The store aborted the transaction to preserve serializability (`SQLSTATE 40001`).
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// The store detected a deadlock and chose this transaction as victim (`SQLSTATE 40P01`).
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// The store could not be reached.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Conflict-class errors: the transaction lost a race and may be retried from
    /// a fresh read.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Serialization(_) | Self::Deadlock(_)
        )
    }
}

/// How a locking read behaves when another transaction already holds the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowLockMode {
    /// Block until the row is free, failing with [`LedgerError::LockTimeout`]
    /// after the given duration.
    Wait(Duration),
    /// Return `None` immediately instead of queueing behind the holder.
    SkipLocked,
}

/// One entry of a multi-resource conditional commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionalChange {
    /// Resource to change.
    pub resource: ResourceId,
    /// Version the caller observed.
    pub expected: Version,
    /// Change to apply.
    pub mutation: Mutation,
}

/// Log record written for every committed mutation.
///
/// `(resource, version)` is unique: no two commits ever share a version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Resource that changed.
    pub resource: ResourceId,
    /// Requester the change was made for.
    pub requester: RequesterId,
    /// Version produced by this commit.
    pub version: Version,
    /// Signed change to `available`.
    pub delta: i32,
    /// When the commit landed.
    pub committed_at: DateTime<Utc>,
}

/// Durable, versioned store of resource state.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one ledger is shared by every worker.
pub trait ResourceLedger: Send + Sync {
    /// Read the current state of a resource without taking any lock.
    ///
    /// # Errors
    ///
    /// - `NotFound`: resource was never provisioned
    /// - `Unavailable` / `Database`: backend failure
    fn read<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, ResourceSnapshot>;

    /// Apply `mutation` only if the stored version still equals `expected`.
    ///
    /// Returns the new version. On mismatch nothing changes.
    ///
    /// # Errors
    ///
    /// - `Conflict`: the version moved on since the caller's read
    /// - `InvariantViolation`: `available` would leave `0..=capacity`
    /// - `NotFound`, `Unavailable`, `Database`
    fn commit_if<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Version,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version>;

    /// All-or-nothing conditional commit over several resources.
    ///
    /// Changes are applied in ascending resource order. Returned versions are in
    /// the same order as `changes`.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceLedger::commit_if`]; any failure leaves every resource
    /// untouched.
    fn commit_all_if(&self, changes: Vec<ConditionalChange>) -> LedgerFuture<'_, Vec<Version>>;

    /// Start a transaction for pessimistic (row-locking) access.
    ///
    /// # Errors
    ///
    /// `Unavailable` / `Database` if the backend cannot open a transaction.
    fn begin(&self) -> LedgerFuture<'_, Box<dyn LedgerTransaction>>;
}

/// A transaction holding row locks until it commits or rolls back.
///
/// Dropping a transaction without calling [`LedgerTransaction::commit`] discards
/// its staged changes and releases its row locks.
pub trait LedgerTransaction: Send {
    /// Read a resource and hold its row exclusively for the rest of the transaction.
    ///
    /// Returns `None` only under [`RowLockMode::SkipLocked`] when another
    /// transaction holds the row. Re-reading a row this transaction already holds
    /// returns its staged state.
    ///
    /// # Errors
    ///
    /// - `LockTimeout`: the bounded wait ran out
    /// - `NotFound`, `Deadlock`, `Unavailable`, `Database`
    fn locking_read<'a>(
        &'a mut self,
        resource: &'a ResourceId,
        mode: RowLockMode,
    ) -> LedgerFuture<'a, Option<ResourceSnapshot>>;

    /// Stage a mutation on a row this transaction holds.
    ///
    /// Returns the version the row will have once the transaction commits.
    ///
    /// # Errors
    ///
    /// - `NotLocked`: the row was never locked by this transaction
    /// - `InvariantViolation`: `available` would leave `0..=capacity`
    fn apply<'a>(
        &'a mut self,
        resource: &'a ResourceId,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version>;

    /// Make every staged mutation durable and release the row locks.
    ///
    /// # Errors
    ///
    /// Conflict-class errors if the store refuses the commit, otherwise
    /// `Unavailable` / `Database`.
    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()>;

    /// Discard staged mutations and release the row locks.
    ///
    /// # Errors
    ///
    /// `Unavailable` / `Database` if the backend failed while rolling back.
    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_class_errors() {
        let conflict = LedgerError::Conflict {
            resource: ResourceId::new("seat"),
            expected: Version::new(0),
            actual: Version::new(1),
        };
        assert!(conflict.is_conflict());
        assert!(LedgerError::Serialization("40001".into()).is_conflict());
        assert!(LedgerError::Deadlock("40P01".into()).is_conflict());
        assert!(!LedgerError::Unavailable("down".into()).is_conflict());
        assert!(!LedgerError::NotFound(ResourceId::new("x")).is_conflict());
    }
}
