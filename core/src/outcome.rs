//! Caller-facing reservation outcomes and the error taxonomy behind them.
//!
//! Losing a race for a scarce resource is normal, so every contention result is a
//! [`RejectReason`] value rather than an error. Only infrastructure failures and
//! invariant violations end up in [`ReservationError`].

use crate::lease::LeaseError;
use crate::ledger::LedgerError;
use crate::resource::{ResourceId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a reservation attempt did not win a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Another attempt for the same requester and target is still in flight.
    InProgress,
    /// Someone else holds the resource right now; retrying later may succeed.
    Contended,
    /// No units left.
    SoldOut,
    /// Optimistic retries ran out while others kept committing first.
    Conflict,
    /// A bounded wait (row lock or retry budget) ran out.
    Timeout,
}

impl RejectReason {
    /// Stable lowercase label, used for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Contended => "contended",
            Self::SoldOut => "sold_out",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
        }
    }

    /// Whether the caller may reasonably try again later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::SoldOut)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that are not a legitimate outcome of racing for a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The ledger failed (unreachable, unexpected database error).
    #[error("Ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    /// The lease store behind the admission gate or lock coordinator failed.
    #[error("Lease store failure: {0}")]
    Lease(#[from] LeaseError),

    /// A mutation would have broken `0 <= available <= capacity`.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// The request itself is malformed (empty pool, transfer to the same resource).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The worker that owned the attempt went away before answering.
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Result of a reservation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// The requester won a unit of `resource`; the commit produced `version`.
    Granted {
        /// Resource that was granted (relevant for any-of-pool bookings).
        resource: ResourceId,
        /// Ledger version produced by the winning commit.
        version: Version,
    },
    /// A legitimate contention outcome.
    Rejected(RejectReason),
    /// Infrastructure failure or invariant violation.
    Error(ReservationError),
}

impl ReservationOutcome {
    /// `true` for [`ReservationOutcome::Granted`].
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// The rejection reason, if this is a rejection.
    #[must_use]
    pub const fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Stable label (`granted`, `error`, or the reject reason), for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Granted { .. } => "granted",
            Self::Rejected(reason) => reason.as_str(),
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ReservationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted { resource, version } => write!(f, "granted {resource} at {version}"),
            Self::Rejected(reason) => write!(f, "rejected ({reason})"),
            Self::Error(err) => write!(f, "error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        let granted = ReservationOutcome::Granted {
            resource: ResourceId::new("seat-1"),
            version: Version::new(1),
        };
        assert!(granted.is_granted());
        assert_eq!(granted.label(), "granted");

        let sold_out = ReservationOutcome::Rejected(RejectReason::SoldOut);
        assert_eq!(sold_out.reject_reason(), Some(RejectReason::SoldOut));
        assert_eq!(sold_out.label(), "sold_out");
        assert!(!RejectReason::SoldOut.is_retryable());
        assert!(RejectReason::Contended.is_retryable());

        let failed = ReservationOutcome::Error(ReservationError::Lease(LeaseError::Unavailable(
            "connection refused".into(),
        )));
        assert_eq!(failed.label(), "error");
        assert_eq!(failed.reject_reason(), None);
    }

    #[test]
    fn test_reject_reason_wire_format_matches_label() -> Result<(), serde_json::Error> {
        for reason in [
            RejectReason::InProgress,
            RejectReason::Contended,
            RejectReason::SoldOut,
            RejectReason::Conflict,
            RejectReason::Timeout,
        ] {
            assert_eq!(serde_json::to_string(&reason)?, format!("\"{}\"", reason.as_str()));
        }
        Ok(())
    }
}
