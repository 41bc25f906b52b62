//! [`ResourceLedger`] over a `PostgreSQL` connection pool.

use crate::error::{map_error, to_count, to_version, version_param};
use crate::transaction::PostgresTransaction;
use seatguard_core::ledger::{
    Allocation, ConditionalChange, LedgerError, LedgerFuture, LedgerTransaction, ResourceLedger,
};
use seatguard_core::resource::{
    Mutation, RequesterId, ResourceId, ResourceSnapshot, Version,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;

/// Connection settings for [`PostgresLedger::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresLedgerConfig {
    /// `postgres://` connection URL.
    pub url: String,
    /// Upper bound on pooled connections. Each in-flight pessimistic
    /// reservation holds one for its whole transaction.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long to wait for a pooled connection before reporting the ledger
    /// unavailable.
    pub acquire_timeout: Duration,
}

impl PostgresLedgerConfig {
    /// Defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 16,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the connection acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// `PostgreSQL`-backed resource ledger.
///
/// Two tables back it (see `migrations/`):
///
/// - `resources(id, capacity, available, version)`, with a `CHECK` keeping
///   `available` within `0..=capacity`
/// - `resource_allocations(resource_id, version, requester_id, delta, committed_at)`,
///   keyed on `(resource_id, version)`
///
/// Every commit bumps `version` by one per mutation and writes one allocation
/// row per new version, in the same transaction.
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] if the database cannot be reached.
    pub async fn connect(config: &PostgresLedgerConfig) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("Failed to connect: {e}")))?;
        tracing::info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL ledger"
        );
        Ok(Self::from_pool(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Create a resource with `capacity` units, or return the existing one.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub async fn provision(
        &self,
        resource: &ResourceId,
        capacity: u32,
    ) -> Result<ResourceSnapshot, LedgerError> {
        sqlx::query(
            r"
            INSERT INTO resources (id, capacity, available, version)
            VALUES ($1, $2, $2, 0)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(resource.as_str())
        .bind(i64::from(capacity))
        .execute(&self.pool)
        .await
        .map_err(map_error)?;

        let row = sqlx::query(SELECT_RESOURCE)
            .bind(resource.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_error)?;
        snapshot_from_row(&row)
    }

    /// Every committed mutation for `resource`, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub async fn allocations(&self, resource: &ResourceId) -> Result<Vec<Allocation>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT resource_id, version, requester_id, delta, committed_at
            FROM resource_allocations
            WHERE resource_id = $1
            ORDER BY version
            ",
        )
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_error)?;

        rows.iter()
            .map(|row| {
                Ok(Allocation {
                    resource: ResourceId::new(row.try_get::<String, _>("resource_id").map_err(map_error)?),
                    requester: RequesterId::new(row.try_get::<String, _>("requester_id").map_err(map_error)?),
                    version: to_version(row.try_get("version").map_err(map_error)?)?,
                    delta: row.try_get("delta").map_err(map_error)?,
                    committed_at: row.try_get("committed_at").map_err(map_error)?,
                })
            })
            .collect()
    }
}

pub(crate) const SELECT_RESOURCE: &str =
    "SELECT id, capacity, available, version FROM resources WHERE id = $1";

pub(crate) fn snapshot_from_row(row: &PgRow) -> Result<ResourceSnapshot, LedgerError> {
    Ok(ResourceSnapshot {
        id: ResourceId::new(row.try_get::<String, _>("id").map_err(map_error)?),
        capacity: to_count("capacity", row.try_get("capacity").map_err(map_error)?)?,
        available: to_count("available", row.try_get("available").map_err(map_error)?)?,
        version: to_version(row.try_get("version").map_err(map_error)?)?,
    })
}

/// Append one allocation row.
pub(crate) async fn record_allocation(
    conn: &mut PgConnection,
    resource: &ResourceId,
    mutation: &Mutation,
    version: Version,
) -> Result<(), LedgerError> {
    sqlx::query(
        r"
        INSERT INTO resource_allocations (resource_id, version, requester_id, delta)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(resource.as_str())
    .bind(version_param(version)?)
    .bind(mutation.requester.as_str())
    .bind(mutation.delta)
    .execute(&mut *conn)
    .await
    .map_err(map_error)?;
    Ok(())
}

/// Versioned update of one row plus its allocation record.
///
/// The `WHERE` clause carries both the version check and the bounds check, so
/// a concurrent writer can never slip between check and write.
async fn conditional_update(
    conn: &mut PgConnection,
    change: &ConditionalChange,
) -> Result<Version, LedgerError> {
    let updated = sqlx::query(
        r"
        UPDATE resources
        SET available = available + $3, version = version + 1
        WHERE id = $1
          AND version = $2
          AND available + $3 BETWEEN 0 AND capacity
        RETURNING version
        ",
    )
    .bind(change.resource.as_str())
    .bind(version_param(change.expected)?)
    .bind(change.mutation.delta)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_error)?;

    let Some(row) = updated else {
        return Err(explain_refusal(conn, change).await);
    };
    let version = to_version(row.try_get("version").map_err(map_error)?)?;
    record_allocation(conn, &change.resource, &change.mutation, version).await?;
    Ok(version)
}

/// Work out why a conditional update touched no row.
async fn explain_refusal(conn: &mut PgConnection, change: &ConditionalChange) -> LedgerError {
    let row = match sqlx::query(SELECT_RESOURCE)
        .bind(change.resource.as_str())
        .fetch_optional(&mut *conn)
        .await
    {
        Ok(Some(row)) => row,
        Ok(None) => return LedgerError::NotFound(change.resource.clone()),
        Err(e) => return map_error(e),
    };
    let current = match snapshot_from_row(&row) {
        Ok(current) => current,
        Err(e) => return e,
    };
    if current.version == change.expected && current.available_after(change.mutation.delta).is_none() {
        return LedgerError::InvariantViolation {
            resource: change.resource.clone(),
            available: current.available,
            capacity: current.capacity,
            delta: change.mutation.delta,
        };
    }
    LedgerError::Conflict {
        resource: change.resource.clone(),
        expected: change.expected,
        actual: current.version,
    }
}

impl ResourceLedger for PostgresLedger {
    fn read<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, ResourceSnapshot> {
        Box::pin(async move {
            let row = sqlx::query(SELECT_RESOURCE)
                .bind(resource.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_error)?
                .ok_or_else(|| LedgerError::NotFound(resource.clone()))?;
            snapshot_from_row(&row)
        })
    }

    fn commit_if<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Version,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version> {
        Box::pin(async move {
            let change = ConditionalChange {
                resource: resource.clone(),
                expected,
                mutation,
            };
            let mut tx = self.pool.begin().await.map_err(map_error)?;
            let version = conditional_update(&mut tx, &change).await?;
            tx.commit().await.map_err(map_error)?;
            tracing::debug!(%resource, %version, "Versioned commit");
            Ok(version)
        })
    }

    fn commit_all_if(&self, changes: Vec<ConditionalChange>) -> LedgerFuture<'_, Vec<Version>> {
        Box::pin(async move {
            // Row locks are taken by the UPDATEs, so apply them in ascending order.
            let mut order: Vec<usize> = (0..changes.len()).collect();
            order.sort_by(|&a, &b| changes[a].resource.cmp(&changes[b].resource));
            if order
                .windows(2)
                .any(|w| changes[w[0]].resource == changes[w[1]].resource)
            {
                return Err(LedgerError::Database(
                    "duplicate resource in conditional commit".to_string(),
                ));
            }

            let mut tx = self.pool.begin().await.map_err(map_error)?;
            let mut versions = vec![Version::INITIAL; changes.len()];
            for &i in &order {
                versions[i] = conditional_update(&mut tx, &changes[i]).await?;
            }
            tx.commit().await.map_err(map_error)?;
            Ok(versions)
        })
    }

    fn begin(&self) -> LedgerFuture<'_, Box<dyn LedgerTransaction>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(map_error)?;
            let tx: Box<dyn LedgerTransaction> = Box::new(PostgresTransaction::new(tx));
            Ok(tx)
        })
    }
}
