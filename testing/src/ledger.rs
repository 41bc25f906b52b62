//! In-memory resource ledger for tests.
//!
//! Each row carries two locks:
//!
//! - an async `tokio::sync::Mutex` standing in for the database row lock that
//!   [`LedgerTransaction::locking_read`] takes and holds until the transaction ends
//! - a short `std::sync::Mutex` around the row state, taken only for the instant a
//!   version check and write happen (the equivalent of a single `UPDATE`)
//!
//! Optimistic `commit_if` never touches the row lock, exactly like a versioned
//! `UPDATE` racing a `SELECT ... FOR UPDATE` holder: correctness comes from the
//! version check, which pessimistic commits perform as well.

use chrono::Utc;
use seatguard_core::ledger::{
    Allocation, ConditionalChange, LedgerError, LedgerFuture, LedgerTransaction, ResourceLedger,
    RowLockMode,
};
use seatguard_core::resource::{Mutation, ResourceId, ResourceSnapshot, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug)]
struct Row {
    lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ResourceSnapshot>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: RwLock<HashMap<ResourceId, Arc<Row>>>,
    allocations: Mutex<Vec<Allocation>>,
    unavailable: AtomicBool,
}

/// In-memory [`ResourceLedger`] with real row-lock and version-check semantics.
///
/// Cloning is cheap and every clone shares the same rows.
///
/// # Example
///
/// ```
/// use seatguard_core::ledger::ResourceLedger;
/// use seatguard_core::resource::{Mutation, RequesterId, ResourceId, Version};
/// use seatguard_testing::InMemoryLedger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = InMemoryLedger::new();
/// let seat = ResourceId::new("seat-1");
/// ledger.provision(&seat, 1)?;
///
/// let v1 = ledger
///     .commit_if(&seat, Version::INITIAL, Mutation::take(RequesterId::new("alice")))
///     .await?;
/// assert_eq!(v1, Version::new(1));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    inner: Arc<Inner>,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Database("in-memory ledger lock poisoned".to_string())
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resource with `capacity` units, or return the existing one.
    ///
    /// # Errors
    ///
    /// Only if an internal lock was poisoned by a panicking test.
    pub fn provision(
        &self,
        resource: &ResourceId,
        capacity: u32,
    ) -> Result<ResourceSnapshot, LedgerError> {
        let mut rows = self.inner.rows.write().map_err(poisoned)?;
        let row = rows.entry(resource.clone()).or_insert_with(|| {
            Arc::new(Row {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                state: Mutex::new(ResourceSnapshot::provisioned(resource.clone(), capacity)),
            })
        });
        let snapshot = row.state.lock().map_err(poisoned)?.clone();
        Ok(snapshot)
    }

    /// Every committed mutation for `resource`, oldest first.
    #[must_use]
    pub fn allocations(&self, resource: &ResourceId) -> Vec<Allocation> {
        self.inner
            .allocations
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|a| &a.resource == resource)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Simulate the store going away: every subsequent call fails with
    /// [`LedgerError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), LedgerError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "in-memory ledger switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn row(&self, resource: &ResourceId) -> Result<Arc<Row>, LedgerError> {
        self.ensure_available()?;
        self.inner
            .rows
            .read()
            .map_err(poisoned)?
            .get(resource)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(resource.clone()))
    }

    fn record(&self, allocations: impl IntoIterator<Item = Allocation>) -> Result<(), LedgerError> {
        self.inner
            .allocations
            .lock()
            .map_err(poisoned)?
            .extend(allocations);
        Ok(())
    }
}

/// Check `expected` and apply `mutation` to a locked row state.
fn apply_checked(
    state: &mut ResourceSnapshot,
    expected: Version,
    mutation: &Mutation,
) -> Result<Allocation, LedgerError> {
    if state.version != expected {
        return Err(LedgerError::Conflict {
            resource: state.id.clone(),
            expected,
            actual: state.version,
        });
    }
    let available = state
        .available_after(mutation.delta)
        .ok_or_else(|| LedgerError::InvariantViolation {
            resource: state.id.clone(),
            available: state.available,
            capacity: state.capacity,
            delta: mutation.delta,
        })?;
    state.available = available;
    state.version = state.version.next();
    Ok(Allocation {
        resource: state.id.clone(),
        requester: mutation.requester.clone(),
        version: state.version,
        delta: mutation.delta,
        committed_at: Utc::now(),
    })
}

impl ResourceLedger for InMemoryLedger {
    fn read<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, ResourceSnapshot> {
        Box::pin(async move {
            let row = self.row(resource)?;
            let snapshot = row.state.lock().map_err(poisoned)?.clone();
            Ok(snapshot)
        })
    }

    fn commit_if<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Version,
        mutation: Mutation,
    ) -> LedgerFuture<'a, Version> {
        Box::pin(async move {
            let row = self.row(resource)?;
            let mut state = row.state.lock().map_err(poisoned)?;
            let allocation = apply_checked(&mut state, expected, &mutation)?;
            let version = allocation.version;
            // Log while the row is held so the log stays in version order.
            self.record([allocation])?;
            drop(state);
            Ok(version)
        })
    }

    fn commit_all_if(&self, changes: Vec<ConditionalChange>) -> LedgerFuture<'_, Vec<Version>> {
        Box::pin(async move {
            // Lock row states in ascending resource order, remembering caller order.
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

            let rows = order
                .iter()
                .map(|&i| self.row(&changes[i].resource))
                .collect::<Result<Vec<_>, _>>()?;
            let mut guards: Vec<MutexGuard<'_, ResourceSnapshot>> = rows
                .iter()
                .map(|row| row.state.lock().map_err(poisoned))
                .collect::<Result<_, _>>()?;

            // Validate everything against scratch copies before touching real state.
            let mut staged = Vec::with_capacity(guards.len());
            for (guard, &i) in guards.iter().zip(&order) {
                let mut scratch = (**guard).clone();
                let allocation = apply_checked(&mut scratch, changes[i].expected, &changes[i].mutation)?;
                staged.push((scratch, allocation, i));
            }

            let mut versions = vec![Version::INITIAL; changes.len()];
            let mut allocations = Vec::with_capacity(staged.len());
            for (guard, (scratch, allocation, i)) in guards.iter_mut().zip(staged) {
                **guard = scratch;
                versions[i] = allocation.version;
                allocations.push(allocation);
            }
            self.record(allocations)?;
            drop(guards);
            Ok(versions)
        })
    }

    fn begin(&self) -> LedgerFuture<'_, Box<dyn LedgerTransaction>> {
        Box::pin(async move {
            self.ensure_available()?;
            let tx: Box<dyn LedgerTransaction> = Box::new(InMemoryTransaction {
                ledger: self.clone(),
                held: BTreeMap::new(),
            });
            Ok(tx)
        })
    }
}

#[derive(Debug)]
struct HeldRow {
    row: Arc<Row>,
    _guard: OwnedMutexGuard<()>,
    base_version: Version,
    staged: ResourceSnapshot,
    mutations: Vec<Mutation>,
}

/// Transaction over [`InMemoryLedger`]; row locks live as long as the value.
#[derive(Debug)]
struct InMemoryTransaction {
    ledger: InMemoryLedger,
    held: BTreeMap<ResourceId, HeldRow>,
}

impl LedgerTransaction for InMemoryTransaction {
    fn locking_read<'a>(
        &'a mut self,
        resource: &'a ResourceId,
        mode: RowLockMode,
    ) -> LedgerFuture<'a, Option<ResourceSnapshot>> {
        Box::pin(async move {
            if let Some(held) = self.held.get(resource) {
                return Ok(Some(held.staged.clone()));
            }

            let row = self.ledger.row(resource)?;
            let guard = match mode {
                RowLockMode::Wait(limit) => {
                    match tokio::time::timeout(limit, Arc::clone(&row.lock).lock_owned()).await {
                        Ok(guard) => guard,
                        Err(_) => {
                            return Err(LedgerError::LockTimeout {
                                resource: resource.clone(),
                                waited: limit,
                            });
                        }
                    }
                }
                RowLockMode::SkipLocked => match Arc::clone(&row.lock).try_lock_owned() {
                    Ok(guard) => guard,
                    Err(_) => return Ok(None),
                },
            };

            let snapshot = row.state.lock().map_err(poisoned)?.clone();
            self.held.insert(
                resource.clone(),
                HeldRow {
                    row,
                    _guard: guard,
                    base_version: snapshot.version,
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
            let available = held.staged.available_after(mutation.delta).ok_or_else(|| {
                LedgerError::InvariantViolation {
                    resource: resource.clone(),
                    available: held.staged.available,
                    capacity: held.staged.capacity,
                    delta: mutation.delta,
                }
            })?;
            held.staged.available = available;
            held.staged.version = held.staged.version.next();
            held.mutations.push(mutation);
            Ok(held.staged.version)
        })
    }

    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            let this = *self;
            let dirty: Vec<&HeldRow> = this
                .held
                .values()
                .filter(|held| !held.mutations.is_empty())
                .collect();

            // BTreeMap iteration is already ascending resource order.
            let mut guards: Vec<MutexGuard<'_, ResourceSnapshot>> = dirty
                .iter()
                .map(|held| held.row.state.lock().map_err(poisoned))
                .collect::<Result<_, _>>()?;

            // A versioned writer may have slipped past the row lock.
            for (guard, held) in guards.iter().zip(&dirty) {
                if guard.version != held.base_version {
                    return Err(LedgerError::Conflict {
                        resource: held.staged.id.clone(),
                        expected: held.base_version,
                        actual: guard.version,
                    });
                }
            }

            let now = Utc::now();
            let mut allocations = Vec::new();
            for (guard, held) in guards.iter_mut().zip(&dirty) {
                **guard = held.staged.clone();
                let mut version = held.base_version;
                for mutation in &held.mutations {
                    version = version.next();
                    allocations.push(Allocation {
                        resource: held.staged.id.clone(),
                        requester: mutation.requester.clone(),
                        version,
                        delta: mutation.delta,
                        committed_at: now,
                    });
                }
            }
            this.ledger.record(allocations)?;
            drop(guards);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}
