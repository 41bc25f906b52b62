//! Mapping from sqlx errors to ledger errors.

use seatguard_core::ledger::LedgerError;
use seatguard_core::resource::{ResourceId, Version};
use std::time::Duration;

/// `serialization_failure`
const SERIALIZATION_FAILURE: &str = "40001";
/// `deadlock_detected`
const DEADLOCK_DETECTED: &str = "40P01";
/// `lock_not_available`, raised when `lock_timeout` fires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Classify a sqlx error.
pub(crate) fn map_error(error: sqlx::Error) -> LedgerError {
    let kind = match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) => {
                LedgerError::Serialization(db.message().to_string())
            }
            Some(DEADLOCK_DETECTED) => LedgerError::Deadlock(db.message().to_string()),
            _ => LedgerError::Database(error.to_string()),
        },
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => LedgerError::Unavailable(error.to_string()),
        _ => LedgerError::Database(error.to_string()),
    };
    metrics::counter!("seatguard.ledger.errors", "kind" => label(&kind)).increment(1);
    kind
}

/// Classify an error from a bounded locking read: `55P03` becomes
/// [`LedgerError::LockTimeout`].
pub(crate) fn map_lock_error(error: sqlx::Error, resource: &ResourceId, waited: Duration) -> LedgerError {
    let timed_out = error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE);
    if timed_out {
        metrics::counter!("seatguard.ledger.errors", "kind" => "lock_timeout").increment(1);
        return LedgerError::LockTimeout {
            resource: resource.clone(),
            waited,
        };
    }
    map_error(error)
}

const fn label(error: &LedgerError) -> &'static str {
    match error {
        LedgerError::Serialization(_) => "serialization",
        LedgerError::Deadlock(_) => "deadlock",
        LedgerError::Unavailable(_) => "unavailable",
        _ => "database",
    }
}

/// A column held a value that does not fit the domain type.
pub(crate) fn out_of_range(column: &str, value: impl std::fmt::Display) -> LedgerError {
    LedgerError::Database(format!("{column} out of range: {value}"))
}

pub(crate) fn to_count(column: &str, value: i64) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| out_of_range(column, value))
}

pub(crate) fn to_version(value: i64) -> Result<Version, LedgerError> {
    u64::try_from(value)
        .map(Version::new)
        .map_err(|_| out_of_range("version", value))
}

pub(crate) fn version_param(version: Version) -> Result<i64, LedgerError> {
    i64::try_from(version.value()).map_err(|_| out_of_range("version", version))
}
