//! `PostgreSQL` resource ledger for SeatGuard.
//!
//! This crate implements the `ResourceLedger` trait from `seatguard-core` on top
//! of sqlx. It supports:
//!
//! - Optimistic commits: `UPDATE ... WHERE version = $expected`
//! - Pessimistic transactions: `SELECT ... FOR UPDATE [SKIP LOCKED]` with a
//!   per-transaction `lock_timeout`
//! - An append-only allocation log with one row per committed version
//! - Connection pooling
//!
//! Database errors are classified by SQLSTATE so the executor can tell a lost
//! race (`40001`, `40P01`) from a lock wait that ran out (`55P03`) and from an
//! outage.
//!
//! # Example
//!
//! ```ignore
//! use seatguard_postgres::{PostgresLedger, PostgresLedgerConfig};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = PostgresLedger::connect(&PostgresLedgerConfig::new("postgres://localhost/seats")).await?;
//!     ledger.migrate().await?;
//!     ledger.provision(&ResourceId::new("train-7/seat-12"), 1).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ledger;
mod transaction;

pub use ledger::{PostgresLedger, PostgresLedgerConfig};
pub use transaction::PostgresTransaction;
