//! Reservation orchestrator: the caller-facing entry point.
//!
//! Composes the admission gate, the lock coordinator and the transaction executor:
//!
//! ```text
//! admit ──► lock (policy permitting) ──► execute ──► release lock ──► release slot
//!   │            │                          │
//!   InProgress   Contended                  Granted / SoldOut / Contended /
//!                                           Conflict / Timeout / Error
//! ```
//!
//! The coordinator lock is renewed at half its TTL while the executor runs.
//! Whatever happens after admission, the lock and then the slot are released
//! before the outcome is returned. A failed release is logged and never changes
//! the outcome; the lease expires on its own.

use crate::admission::{AdmissionGate, AdmissionSlot};
use crate::config::ReservationConfig;
use crate::executor::{Commit, Execution, ExecutorError, TransactionExecutor};
use crate::lock::{LockAcquisition, LockCoordinator};
use seatguard_core::attempt::{AttemptPhase, AttemptTarget, ReservationAttempt};
use seatguard_core::environment::{Clock, SystemClock};
use seatguard_core::lease::LeaseStore;
use seatguard_core::ledger::ResourceLedger;
use seatguard_core::outcome::{RejectReason, ReservationError, ReservationOutcome};
use seatguard_core::resource::{RequesterId, ResourceId, ResourcePool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Builder for [`ReservationOrchestrator`].
pub struct OrchestratorBuilder {
    ledger: Arc<dyn ResourceLedger>,
    leases: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: ReservationConfig,
}

impl OrchestratorBuilder {
    /// Use a different clock for attempt timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn config(mut self, config: ReservationConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator.
    #[must_use]
    pub fn build(self) -> ReservationOrchestrator {
        ReservationOrchestrator {
            gate: AdmissionGate::new(Arc::clone(&self.leases)),
            locks: LockCoordinator::new(self.leases).with_clock(Arc::clone(&self.clock)),
            executor: TransactionExecutor::new(self.ledger, self.config.executor.clone()),
            clock: self.clock,
            config: self.config,
        }
    }
}

/// Admits, serializes and executes reservation attempts.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = ReservationOrchestrator::builder(ledger, lease_store)
///     .config(ReservationConfig::from_env()?)
///     .build();
///
/// match orchestrator.reserve(&requester, &seat).await {
///     ReservationOutcome::Granted { version, .. } => println!("booked at {version}"),
///     ReservationOutcome::Rejected(reason) => println!("not this time: {reason}"),
///     ReservationOutcome::Error(err) => eprintln!("failed: {err}"),
/// }
/// ```
pub struct ReservationOrchestrator {
    gate: AdmissionGate,
    locks: LockCoordinator,
    executor: TransactionExecutor,
    clock: Arc<dyn Clock>,
    config: ReservationConfig,
}

impl std::fmt::Debug for ReservationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn advance(attempt: &mut ReservationAttempt, phase: AttemptPhase) {
    if let Err(err) = attempt.advance(phase) {
        tracing::error!(error = %err, "Attempt lifecycle out of order");
    }
}

fn settle(
    mut attempt: ReservationAttempt,
    outcome: ReservationOutcome,
    started: Instant,
) -> (ReservationAttempt, ReservationOutcome) {
    match &outcome {
        ReservationOutcome::Granted { resource, version } => {
            tracing::info!(attempt = %attempt.id, %resource, %version, "Reservation granted");
        }
        ReservationOutcome::Rejected(reason) => {
            tracing::debug!(attempt = %attempt.id, %reason, "Reservation rejected");
        }
        ReservationOutcome::Error(err) => {
            tracing::error!(attempt = %attempt.id, error = %err, "Reservation failed");
        }
    }
    crate::metrics::record_outcome(outcome.label(), started.elapsed());

    if let Err(err) = attempt.settle(outcome.clone()) {
        tracing::error!(error = %err, "Attempt settled twice");
    }
    (attempt, outcome)
}

fn translate(result: Result<Execution<Commit>, ExecutorError>) -> ReservationOutcome {
    match result {
        Ok(Execution::Committed(commit)) => ReservationOutcome::Granted {
            resource: commit.resource,
            version: commit.version,
        },
        Ok(Execution::SoldOut) => ReservationOutcome::Rejected(RejectReason::SoldOut),
        Ok(Execution::Unavailable) => ReservationOutcome::Rejected(RejectReason::Contended),
        Ok(Execution::Conflict) => ReservationOutcome::Rejected(RejectReason::Conflict),
        Ok(Execution::Timeout) => ReservationOutcome::Rejected(RejectReason::Timeout),
        Err(ExecutorError::Ledger(err)) => ReservationOutcome::Error(ReservationError::Ledger(err)),
        Err(ExecutorError::InvariantViolation(detail)) => {
            ReservationOutcome::Error(ReservationError::InvariantViolation(detail))
        }
        Err(ExecutorError::InvalidRequest(detail)) => {
            ReservationOutcome::Error(ReservationError::InvalidRequest(detail))
        }
    }
}

impl ReservationOrchestrator {
    /// Start building an orchestrator over the given ledger and lease store.
    #[must_use]
    pub fn builder(
        ledger: Arc<dyn ResourceLedger>,
        leases: Arc<dyn LeaseStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            ledger,
            leases,
            clock: Arc::new(SystemClock),
            config: ReservationConfig::default(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ReservationConfig {
        &self.config
    }

    /// The executor, for operations the orchestrator does not wrap (transfers).
    #[must_use]
    pub const fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    /// Try to reserve one unit of `resource` for `requester`.
    pub async fn reserve(&self, requester: &RequesterId, resource: &ResourceId) -> ReservationOutcome {
        self.run_for_resource(requester, resource).await.1
    }

    /// Same as [`Self::reserve`], returning the settled attempt record.
    pub async fn submit(&self, requester: &RequesterId, resource: &ResourceId) -> ReservationAttempt {
        self.run_for_resource(requester, resource).await.0
    }

    /// Try to reserve one unit of any member of `pool`.
    ///
    /// Admission is keyed on the pool, and no coordinator lock is taken: pool
    /// bookings skip locked rows instead of queueing on them.
    pub async fn reserve_any(&self, requester: &RequesterId, pool: &ResourcePool) -> ReservationOutcome {
        self.run_for_pool(requester, pool).await.1
    }

    /// Same as [`Self::reserve_any`], returning the settled attempt record.
    pub async fn submit_any(&self, requester: &RequesterId, pool: &ResourcePool) -> ReservationAttempt {
        self.run_for_pool(requester, pool).await.0
    }

    #[tracing::instrument(name = "reserve", skip_all, fields(%requester, %resource))]
    async fn run_for_resource(
        &self,
        requester: &RequesterId,
        resource: &ResourceId,
    ) -> (ReservationAttempt, ReservationOutcome) {
        let started = Instant::now();
        let mut attempt = ReservationAttempt::submitted(
            requester.clone(),
            AttemptTarget::Resource(resource.clone()),
            self.clock.now(),
        );

        let outcome = match self.admit(&attempt).await {
            Err(outcome) => outcome,
            Ok(slot) => {
                advance(&mut attempt, AttemptPhase::Admitted);
                let outcome = self.lock_and_execute(&mut attempt, requester, resource).await;
                self.release_slot(&slot).await;
                outcome
            }
        };

        settle(attempt, outcome, started)
    }

    #[tracing::instrument(name = "reserve_any", skip_all, fields(%requester, pool = %pool.id))]
    async fn run_for_pool(
        &self,
        requester: &RequesterId,
        pool: &ResourcePool,
    ) -> (ReservationAttempt, ReservationOutcome) {
        let started = Instant::now();
        let mut attempt = ReservationAttempt::submitted(
            requester.clone(),
            AttemptTarget::Pool(pool.id.clone()),
            self.clock.now(),
        );

        let outcome = match self.admit(&attempt).await {
            Err(outcome) => outcome,
            Ok(slot) => {
                advance(&mut attempt, AttemptPhase::Admitted);
                advance(&mut attempt, AttemptPhase::Executing);
                let outcome = translate(self.executor.execute_any(requester, pool).await);
                self.release_slot(&slot).await;
                outcome
            }
        };

        settle(attempt, outcome, started)
    }

    /// Admission step. `Err` carries the outcome for a refused attempt.
    async fn admit(&self, attempt: &ReservationAttempt) -> Result<AdmissionSlot, ReservationOutcome> {
        match self
            .gate
            .try_admit(&attempt.requester, &attempt.target, self.config.admission_ttl)
            .await
        {
            Ok(Some(slot)) => Ok(slot),
            Ok(None) => Err(ReservationOutcome::Rejected(RejectReason::InProgress)),
            Err(err) => {
                tracing::error!(error = %err, "Admission gate failed");
                Err(ReservationOutcome::Error(ReservationError::Lease(err)))
            }
        }
    }

    async fn lock_and_execute(
        &self,
        attempt: &mut ReservationAttempt,
        requester: &RequesterId,
        resource: &ResourceId,
    ) -> ReservationOutcome {
        if !self.config.uses_coordinator_lock() {
            advance(attempt, AttemptPhase::Executing);
            return translate(self.executor.execute(requester, resource).await);
        }

        let ttl = self.config.lock_ttl;
        let mut handle = match self.locks.acquire(resource, ttl).await {
            Ok(LockAcquisition::Acquired(handle)) => handle,
            Ok(LockAcquisition::Busy) => {
                return ReservationOutcome::Rejected(RejectReason::Contended);
            }
            Err(err) => {
                tracing::error!(error = %err, "Lock coordinator failed");
                return ReservationOutcome::Error(ReservationError::Lease(err));
            }
        };

        advance(attempt, AttemptPhase::Locked);
        advance(attempt, AttemptPhase::Executing);

        // Renew at half the TTL until the execution settles.
        let period = (ttl / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let execution = self.executor.execute(requester, resource);
        tokio::pin!(execution);
        let mut renewing = true;
        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = heartbeat.tick(), if renewing => {
                    match self.locks.renew(&mut handle, ttl).await {
                        Ok(true) => tracing::trace!(%resource, "Lock renewed"),
                        Ok(false) => renewing = false,
                        Err(err) => tracing::warn!(error = %err, "Lock renewal failed"),
                    }
                }
            }
        };

        if let Err(err) = self.locks.release(handle).await {
            tracing::warn!(error = %err, "Failed to release lock; it will expire");
        }
        translate(result)
    }

    async fn release_slot(&self, slot: &AdmissionSlot) {
        if let Err(err) = self.gate.release(slot).await {
            tracing::warn!(error = %err, "Failed to release admission slot; it will expire");
        }
    }
}
