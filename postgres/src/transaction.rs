//! Pessimistic transactions: `SELECT ... FOR UPDATE` row locks held until commit.

use crate::error::{map_error, map_lock_error, to_version, version_param};
use crate::ledger::{record_allocation, snapshot_from_row};
use seatguard_core::ledger::{LedgerError, LedgerFuture, LedgerTransaction, RowLockMode};
use seatguard_core::resource::{Mutation, ResourceId, ResourceSnapshot, Version};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;

const LOCK_RESOURCE: &str =
    "SELECT id, capacity, available, version FROM resources WHERE id = $1 FOR UPDATE";
const LOCK_RESOURCE_SKIP_LOCKED: &str =
    "SELECT id, capacity, available, version FROM resources WHERE id = $1 FOR UPDATE SKIP LOCKED";

struct Held {
    base: Version,
    staged: ResourceSnapshot,
    mutations: Vec<Mutation>,
}

/// A ledger transaction on one pooled connection.
///
/// Mutations are staged in memory against the locked rows and written in one
/// go by [`LedgerTransaction::commit`]. Dropping the transaction rolls it back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    held: BTreeMap<ResourceId, Held>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("held", &self.held.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PostgresTransaction {
    pub(crate) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx,
            held: BTreeMap::new(),
        }
    }

    async fn lock_row(
        &mut self,
        resource: &ResourceId,
        mode: RowLockMode,
    ) -> Result<Option<ResourceSnapshot>, LedgerError> {
        match mode {
            RowLockMode::Wait(wait) => {
                // SET cannot take bind parameters; set_config is the same thing.
                let millis = wait.as_millis().max(1);
                sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                    .bind(format!("{millis}ms"))
                    .execute(&mut *self.tx)
                    .await
                    .map_err(map_error)?;
                let row = sqlx::query(LOCK_RESOURCE)
                    .bind(resource.as_str())
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(|e| map_lock_error(e, resource, wait))?
                    .ok_or_else(|| LedgerError::NotFound(resource.clone()))?;
                snapshot_from_row(&row).map(Some)
            }
            RowLockMode::SkipLocked => {
                let row = sqlx::query(LOCK_RESOURCE_SKIP_LOCKED)
                    .bind(resource.as_str())
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(map_error)?;
                if let Some(row) = row {
                    return snapshot_from_row(&row).map(Some);
                }
                // Skipped, or never provisioned?
                let exists = sqlx::query("SELECT 1 FROM resources WHERE id = $1")
                    .bind(resource.as_str())
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(map_error)?
                    .is_some();
                if exists {
                    Ok(None)
                } else {
                    Err(LedgerError::NotFound(resource.clone()))
                }
            }
        }
    }

    async fn write_back(mut self) -> Result<(), LedgerError> {
        for (resource, held) in &self.held {
            if held.mutations.is_empty() {
                continue;
            }
            let result = sqlx::query(
                r"
                UPDATE resources
                SET available = $2, version = $3
                WHERE id = $1 AND version = $4
                RETURNING version
                ",
            )
            .bind(resource.as_str())
            .bind(i64::from(held.staged.available))
            .bind(version_param(held.staged.version)?)
            .bind(version_param(held.base)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_error)?;

            if result.is_none() {
                let actual = sqlx::query("SELECT version FROM resources WHERE id = $1")
                    .bind(resource.as_str())
                    .fetch_one(&mut *self.tx)
                    .await
                    .map_err(map_error)?
                    .try_get::<i64, _>("version")
                    .map_err(map_error)?;
                return Err(LedgerError::Conflict {
                    resource: resource.clone(),
                    expected: held.base,
                    actual: to_version(actual)?,
                });
            }

            let mut version = held.base;
            for mutation in &held.mutations {
                version = version.next();
                record_allocation(&mut self.tx, resource, mutation, version).await?;
            }
        }
        self.tx.commit().await.map_err(map_error)?;
        Ok(())
    }
}

impl LedgerTransaction for PostgresTransaction {
    fn locking_read<'a>(
        &'a mut self,
        resource: &'a ResourceId,
        mode: RowLockMode,
    ) -> LedgerFuture<'a, Option<ResourceSnapshot>> {
        Box::pin(async move {
            if let Some(held) = self.held.get(resource) {
                return Ok(Some(held.staged.clone()));
            }
            let Some(snapshot) = self.lock_row(resource, mode).await? else {
                return Ok(None);
            };
            self.held.insert(
                resource.clone(),
                Held {
                    base: snapshot.version,
                    staged: snapshot.clone(),
                    mutations: Vec::new(),
                },
            );
            Ok(Some(snapshot))
        })
    }

    fn apply<'a>(
        &'a mut self,
        resource: &'a ResourceId,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version> {
        Box::pin(async move {
            let held = self
                .held
                .get_mut(resource)
                .ok_or_else(|| LedgerError::NotLocked(resource.clone()))?;
            let available = held
                .staged
                .available_after(mutation.delta)
                .ok_or_else(|| LedgerError::InvariantViolation {
                    resource: resource.clone(),
                    available: held.staged.available,
                    capacity: held.staged.capacity,
                    delta: mutation.delta,
                })?;
            held.staged.available = available;
            held.staged.version = held.staged.version.next();
            held.mutations.push(mutation);
            Ok(held.staged.version)
        })
    }

    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move { (*self).write_back().await })
    }

    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move { self.tx.rollback().await.map_err(map_error) })
    }
}

