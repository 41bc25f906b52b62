//! Lifecycle record of a single reservation attempt.
//!
//! ```text
//! Submitted → Admitted → Locked (optional) → Executing → Settled
//! ```
//!
//! An attempt is created when it is submitted, moves forward through the phases,
//! and is settled exactly once with its [`ReservationOutcome`]. It is never reused.

use crate::outcome::ReservationOutcome;
use crate::resource::{PoolId, RequesterId, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the attempt is trying to reserve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptTarget {
    /// One specific resource.
    Resource(ResourceId),
    /// Any free member of a pool.
    Pool(PoolId),
}

impl AttemptTarget {
    /// Key fragment used by the admission gate.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Resource(id) => format!("resource:{id}"),
            Self::Pool(id) => format!("pool:{id}"),
        }
    }
}

impl fmt::Display for AttemptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "{id}"),
            Self::Pool(id) => write!(f, "pool {id}"),
        }
    }
}

/// Where an attempt currently is in the reservation flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttemptPhase {
    /// Received, not yet past the admission gate.
    Submitted,
    /// Holds an admission slot.
    Admitted,
    /// Holds the coordinator lock for its resource.
    Locked,
    /// Inside the transaction executor.
    Executing,
    /// Terminal: the outcome is known.
    Settled,
}

/// Coarse status derived from the attempt's outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Not settled yet.
    Pending,
    /// Settled with a grant.
    Granted,
    /// Settled with a contention outcome.
    Rejected,
    /// Settled with an infrastructure failure or invariant violation.
    Error,
}

/// Illegal lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Phases only move forward.
    #[error("Attempt {id} cannot move from {from:?} to {to:?}")]
    Backwards {
        /// Attempt concerned.
        id: AttemptId,
        /// Current phase.
        from: AttemptPhase,
        /// Requested phase.
        to: AttemptPhase,
    },
    /// The outcome is written once.
    #[error("Attempt {0} is already settled")]
    AlreadySettled(AttemptId),
}

/// One reservation attempt from submission to terminal outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationAttempt {
    /// Attempt identifier.
    pub id: AttemptId,
    /// Who is asking.
    pub requester: RequesterId,
    /// What they are asking for.
    pub target: AttemptTarget,
    /// When the attempt was submitted.
    pub submitted_at: DateTime<Utc>,
    phase: AttemptPhase,
    outcome: Option<ReservationOutcome>,
}

impl ReservationAttempt {
    /// Create a freshly submitted attempt.
    #[must_use]
    pub fn submitted(requester: RequesterId, target: AttemptTarget, now: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            requester,
            target,
            submitted_at: now,
            phase: AttemptPhase::Submitted,
            outcome: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Outcome, once settled.
    #[must_use]
    pub const fn outcome(&self) -> Option<&ReservationOutcome> {
        self.outcome.as_ref()
    }

    /// Consume the attempt and return its outcome, if settled.
    #[must_use]
    pub fn into_outcome(self) -> Option<ReservationOutcome> {
        self.outcome
    }

    /// Coarse status.
    #[must_use]
    pub const fn status(&self) -> AttemptStatus {
        match &self.outcome {
            None => AttemptStatus::Pending,
            Some(ReservationOutcome::Granted { .. }) => AttemptStatus::Granted,
            Some(ReservationOutcome::Rejected(_)) => AttemptStatus::Rejected,
            Some(ReservationOutcome::Error(_)) => AttemptStatus::Error,
        }
    }

    /// Move to a later, non-terminal phase.
    ///
    /// # Errors
    ///
    /// `Backwards` if `next` is not after the current phase or is `Settled`
    /// (use [`ReservationAttempt::settle`] for that).
    pub fn advance(&mut self, next: AttemptPhase) -> Result<(), AttemptError> {
        if next <= self.phase || next == AttemptPhase::Settled {
            return Err(AttemptError::Backwards {
                id: self.id,
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Record the terminal outcome.
    ///
    /// # Errors
    ///
    /// `AlreadySettled` if an outcome was already recorded.
    pub fn settle(&mut self, outcome: ReservationOutcome) -> Result<(), AttemptError> {
        if self.outcome.is_some() {
            return Err(AttemptError::AlreadySettled(self.id));
        }
        self.phase = AttemptPhase::Settled;
        self.outcome = Some(outcome);
        Ok(())
    }
}
