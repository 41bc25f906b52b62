//! Transaction executor: the only component that mutates the ledger.
//!
//! Each operation runs a read-decide-write cycle under one of two strategies:
//!
//! - [`IsolationStrategy::Pessimistic`]: lock the row (`SELECT ... FOR UPDATE`),
//!   check availability, apply, commit. Concurrent attempts queue on the row lock
//!   for at most `lock_wait`, or skip it entirely with `skip_locked`.
//! - [`IsolationStrategy::Optimistic`]: read without locking, then commit only if
//!   the version is still the one read. Losers re-run the whole cycle after a
//!   jittered backoff.
//!
//! Conflict-class ledger errors (version conflict, serialization failure,
//! deadlock) are retried under either strategy until `max_retries` or `deadline`
//! runs out. A sold-out resource is final and never retried.
//!
//! Multi-row work ([`TransactionExecutor::transfer`]) always locks rows in
//! ascending [`ResourceId`] order.

use crate::retry::{Backoff, BackoffStep, RetryPolicy};
use seatguard_core::ledger::{
    ConditionalChange, LedgerError, LedgerTransaction, ResourceLedger, RowLockMode,
};
use seatguard_core::resource::{Mutation, RequesterId, ResourceId, ResourcePool, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How conflicting attempts on one resource are kept apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationStrategy {
    /// Exclusive row lock before reading.
    #[default]
    Pessimistic,
    /// Unlocked read, version check at commit.
    Optimistic,
}

impl fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pessimistic => f.write_str("pessimistic"),
            Self::Optimistic => f.write_str("optimistic"),
        }
    }
}

impl FromStr for IsolationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pessimistic" => Ok(Self::Pessimistic),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(format!(
                "unknown strategy '{other}' (expected pessimistic or optimistic)"
            )),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Isolation strategy for single-resource reservations and transfers.
    pub strategy: IsolationStrategy,
    /// Pessimistic reads skip rows held by another transaction instead of waiting.
    pub skip_locked: bool,
    /// Upper bound on a pessimistic row-lock wait.
    pub lock_wait: Duration,
    /// Total time budget for one execution, retries included.
    pub deadline: Duration,
    /// Conflict retry policy.
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            strategy: IsolationStrategy::Pessimistic,
            skip_locked: false,
            lock_wait: Duration::from_secs(2),
            deadline: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// A committed single-resource change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Resource that changed.
    pub resource: ResourceId,
    /// Version produced by the commit.
    pub version: Version,
}

/// A committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommit {
    /// The resource the requester gave a unit back to.
    pub released: Commit,
    /// The resource the requester took a unit of.
    pub taken: Commit,
}

/// Result of an execution that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution<T> {
    /// The change is durable.
    Committed(T),
    /// No units left at decision time.
    SoldOut,
    /// The row was held by another transaction and skipped.
    Unavailable,
    /// Conflict retries ran out.
    Conflict,
    /// A row-lock wait or the execution deadline ran out.
    Timeout,
}

impl<T> Execution<T> {
    /// `true` for [`Execution::Committed`].
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Stable label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Committed(_) => "committed",
            Self::SoldOut => "sold_out",
            Self::Unavailable => "unavailable",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
        }
    }
}

/// Errors that are not a contention outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The ledger refused a mutation that would break `0 <= available <= capacity`.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The request cannot be executed as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Runs reservation transactions against a [`ResourceLedger`].
#[derive(Clone)]
pub struct TransactionExecutor {
    ledger: Arc<dyn ResourceLedger>,
    config: ExecutorConfig,
}

impl fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn discard(tx: Box<dyn LedgerTransaction>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "Rollback failed");
    }
}

impl TransactionExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(ledger: Arc<dyn ResourceLedger>, config: ExecutorConfig) -> Self {
        Self { ledger, config }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Take one unit of `resource` for `requester`.
    ///
    /// # Errors
    ///
    /// Ledger failures and invariant violations. Contention is reported through
    /// [`Execution`].
    pub async fn execute(
        &self,
        requester: &RequesterId,
        resource: &ResourceId,
    ) -> Result<Execution<Commit>, ExecutorError> {
        match self.config.strategy {
            IsolationStrategy::Pessimistic => {
                self.with_retry(move |remaining| {
                    self.take_locked(requester, resource, self.row_lock_mode(remaining))
                })
                    .await
            }
            IsolationStrategy::Optimistic => {
                self.with_retry(move |_| self.take_versioned(requester, resource))
                    .await
            }
        }
    }

    /// Take one unit of any member of `pool`.
    ///
    /// Pessimistic execution always skips locked rows and scans members in
    /// ascending order; the first row with a free unit wins.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty pool, otherwise as [`Self::execute`].
    pub async fn execute_any(
        &self,
        requester: &RequesterId,
        pool: &ResourcePool,
    ) -> Result<Execution<Commit>, ExecutorError> {
        if pool.is_empty() {
            return Err(ExecutorError::InvalidRequest(format!(
                "pool {} has no members",
                pool.id
            )));
        }
        match self.config.strategy {
            IsolationStrategy::Pessimistic => {
                self.with_retry(move |_| self.take_any_locked(requester, pool))
                    .await
            }
            IsolationStrategy::Optimistic => {
                self.with_retry(move |_| self.take_any_versioned(requester, pool))
                    .await
            }
        }
    }

    /// Give back the unit `requester` holds on `from` and take one of `to`, atomically.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when `from == to`; `InvariantViolation` when `from` has
    /// nothing outstanding to give back; otherwise as [`Self::execute`].
    pub async fn transfer(
        &self,
        requester: &RequesterId,
        from: &ResourceId,
        to: &ResourceId,
    ) -> Result<Execution<TransferCommit>, ExecutorError> {
        if from == to {
            return Err(ExecutorError::InvalidRequest(format!(
                "cannot transfer {from} onto itself"
            )));
        }
        match self.config.strategy {
            IsolationStrategy::Pessimistic => {
                self.with_retry(move |remaining| {
                    self.transfer_locked(requester, from, to, self.row_lock_mode(remaining))
                })
                    .await
            }
            IsolationStrategy::Optimistic => {
                self.with_retry(move |_| self.transfer_versioned(requester, from, to))
                    .await
            }
        }
    }

    /// Row wait for the next cycle: `lock_wait`, but never past the deadline.
    fn row_lock_mode(&self, remaining: Duration) -> RowLockMode {
        if self.config.skip_locked {
            RowLockMode::SkipLocked
        } else {
            RowLockMode::Wait(
                self.config
                    .lock_wait
                    .min(remaining)
                    .max(Duration::from_millis(1)),
            )
        }
    }

    /// Run `cycle` until it produces an outcome, retrying conflict-class errors.
    ///
    /// Each cycle is handed the time left before the deadline.
    async fn with_retry<T, F, Fut>(&self, mut cycle: F) -> Result<Execution<T>, ExecutorError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<Execution<T>, LedgerError>>,
    {
        let mut backoff = Backoff::new(&self.config.retry, self.config.deadline);
        loop {
            let err = match cycle(backoff.remaining()).await {
                Ok(execution) => return Ok(execution),
                Err(err) => err,
            };

            match err {
                err if err.is_conflict() => {
                    metrics::counter!(crate::metrics::EXECUTOR_CONFLICTS).increment(1);
                    match backoff.next_step() {
                        BackoffStep::Retry(delay) => {
                            tracing::warn!(
                                error = %err,
                                attempt = backoff.retries(),
                                delay_ms = delay.as_millis(),
                                "Conflict, retrying"
                            );
                            metrics::counter!(crate::metrics::EXECUTOR_RETRIES).increment(1);
                            tokio::time::sleep(delay).await;
                        }
                        BackoffStep::Exhausted => {
                            tracing::debug!(retries = backoff.retries(), "Conflict retries exhausted");
                            return Ok(Execution::Conflict);
                        }
                        BackoffStep::DeadlineExceeded => {
                            tracing::debug!(retries = backoff.retries(), "Deadline reached while retrying");
                            return Ok(Execution::Timeout);
                        }
                    }
                }
                LedgerError::LockTimeout { resource, waited } => {
                    tracing::debug!(%resource, waited_ms = waited.as_millis(), "Row lock wait timed out");
                    return Ok(Execution::Timeout);
                }
                LedgerError::InvariantViolation {
                    resource,
                    available,
                    capacity,
                    delta,
                } => {
                    tracing::error!(
                        %resource,
                        available,
                        capacity,
                        delta,
                        "Ledger refused a mutation that breaks the capacity invariant"
                    );
                    metrics::counter!(crate::metrics::INVARIANT_VIOLATIONS).increment(1);
                    return Err(ExecutorError::InvariantViolation(format!(
                        "{resource}: available {available} + delta {delta} outside 0..={capacity}"
                    )));
                }
                err => {
                    tracing::error!(error = %err, "Ledger failure");
                    return Err(ExecutorError::Ledger(err));
                }
            }
        }
    }

    async fn take_locked(
        &self,
        requester: &RequesterId,
        resource: &ResourceId,
        mode: RowLockMode,
    ) -> Result<Execution<Commit>, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let Some(snapshot) = tx.locking_read(resource, mode).await? else {
            tracing::debug!(%resource, "Row locked elsewhere, skipped");
            discard(tx).await;
            return Ok(Execution::Unavailable);
        };
        if snapshot.is_sold_out() {
            discard(tx).await;
            return Ok(Execution::SoldOut);
        }

        let version = tx.apply(resource, Mutation::take(requester.clone())).await?;
        tx.commit().await?;
        tracing::debug!(%resource, %version, "Committed under row lock");
        Ok(Execution::Committed(Commit {
            resource: resource.clone(),
            version,
        }))
    }

    async fn take_versioned(
        &self,
        requester: &RequesterId,
        resource: &ResourceId,
    ) -> Result<Execution<Commit>, LedgerError> {
        let snapshot = self.ledger.read(resource).await?;
        if snapshot.is_sold_out() {
            return Ok(Execution::SoldOut);
        }

        let version = self
            .ledger
            .commit_if(resource, snapshot.version, Mutation::take(requester.clone()))
            .await?;
        tracing::debug!(%resource, %version, "Committed on version check");
        Ok(Execution::Committed(Commit {
            resource: resource.clone(),
            version,
        }))
    }

    async fn take_any_locked(
        &self,
        requester: &RequesterId,
        pool: &ResourcePool,
    ) -> Result<Execution<Commit>, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let mut skipped = 0_usize;

        for resource in pool.members() {
            match tx.locking_read(resource, RowLockMode::SkipLocked).await? {
                None => skipped += 1,
                Some(snapshot) if snapshot.is_sold_out() => {}
                Some(_) => {
                    let version = tx.apply(resource, Mutation::take(requester.clone())).await?;
                    tx.commit().await?;
                    tracing::debug!(pool = %pool.id, %resource, %version, skipped, "Committed pool member");
                    return Ok(Execution::Committed(Commit {
                        resource: resource.clone(),
                        version,
                    }));
                }
            }
        }

        discard(tx).await;
        if skipped > 0 {
            tracing::debug!(pool = %pool.id, skipped, "No free unlocked member");
            Ok(Execution::Unavailable)
        } else {
            Ok(Execution::SoldOut)
        }
    }

    async fn take_any_versioned(
        &self,
        requester: &RequesterId,
        pool: &ResourcePool,
    ) -> Result<Execution<Commit>, LedgerError> {
        for resource in pool.members() {
            let snapshot = self.ledger.read(resource).await?;
            if snapshot.is_sold_out() {
                continue;
            }
            let version = self
                .ledger
                .commit_if(resource, snapshot.version, Mutation::take(requester.clone()))
                .await?;
            return Ok(Execution::Committed(Commit {
                resource: resource.clone(),
                version,
            }));
        }
        Ok(Execution::SoldOut)
    }

    async fn transfer_locked(
        &self,
        requester: &RequesterId,
        from: &ResourceId,
        to: &ResourceId,
        mode: RowLockMode,
    ) -> Result<Execution<TransferCommit>, LedgerError> {
        let (first, second) = if from < to { (from, to) } else { (to, from) };

        let mut tx = self.ledger.begin().await?;
        let Some(first_snapshot) = tx.locking_read(first, mode).await? else {
            discard(tx).await;
            return Ok(Execution::Unavailable);
        };
        let Some(second_snapshot) = tx.locking_read(second, mode).await? else {
            discard(tx).await;
            return Ok(Execution::Unavailable);
        };

        let target = if first == to {
            first_snapshot
        } else {
            second_snapshot
        };
        if target.is_sold_out() {
            discard(tx).await;
            return Ok(Execution::SoldOut);
        }

        let released = tx
            .apply(from, Mutation::give_back(requester.clone()))
            .await?;
        let taken = tx.apply(to, Mutation::take(requester.clone())).await?;
        tx.commit().await?;

        tracing::debug!(%from, %to, "Transfer committed under row locks");
        Ok(Execution::Committed(TransferCommit {
            released: Commit {
                resource: from.clone(),
                version: released,
            },
            taken: Commit {
                resource: to.clone(),
                version: taken,
            },
        }))
    }

    async fn transfer_versioned(
        &self,
        requester: &RequesterId,
        from: &ResourceId,
        to: &ResourceId,
    ) -> Result<Execution<TransferCommit>, LedgerError> {
        let source = self.ledger.read(from).await?;
        let target = self.ledger.read(to).await?;
        if target.is_sold_out() {
            return Ok(Execution::SoldOut);
        }

        let versions = self
            .ledger
            .commit_all_if(vec![
                ConditionalChange {
                    resource: from.clone(),
                    expected: source.version,
                    mutation: Mutation::give_back(requester.clone()),
                },
                ConditionalChange {
                    resource: to.clone(),
                    expected: target.version,
                    mutation: Mutation::take(requester.clone()),
                },
            ])
            .await?;

        match versions.as_slice() {
            [released, taken] => Ok(Execution::Committed(TransferCommit {
                released: Commit {
                    resource: from.clone(),
                    version: *released,
                },
                taken: Commit {
                    resource: to.clone(),
                    version: *taken,
                },
            })),
            other => Err(LedgerError::Database(format!(
                "conditional commit of 2 changes returned {} versions",
                other.len()
            ))),
        }
    }
}
