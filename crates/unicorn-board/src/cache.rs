//! Client-side query cache.
//!
//! The cache is an explicit context object handed to whoever needs it. Each
//! scope key holds one collection plus the bookkeeping that keeps optimistic
//! writes from being clobbered: a fetch generation bumped by every cancel,
//! and a count of mutations in flight.

use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::{Mutex as ScopeLock, OwnedMutexGuard};
use unicorn_core::{ProjectId, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub collection: &'static str,
    pub project_id: ProjectId,
}

impl ScopeKey {
    #[must_use]
    pub fn tasks(project_id: ProjectId) -> Self {
        Self { collection: "tasks", project_id }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.project_id)
    }
}

/// Proof that a fetch started at a given generation.
#[derive(Debug, Clone, Copy)]
pub struct FetchTicket {
    key: ScopeKey,
    generation: u64,
}

#[derive(Debug, Default)]
struct Entry {
    data: Option<Vec<Task>>,
    generation: u64,
    in_flight: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ScopeKey, Entry>,
    scopes: HashMap<ScopeKey, Arc<ScopeLock<()>>>,
}

#[derive(Clone, Default)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: ScopeKey) -> Option<Vec<Task>> {
        self.inner.lock().entries.get(&key).and_then(|entry| entry.data.clone())
    }

    /// Seeds a scope. Writes racing a mutation belong in a transaction.
    pub fn set(&self, key: ScopeKey, data: Vec<Task>) {
        self.inner.lock().entries.entry(key).or_default().data = Some(data);
    }

    /// Invalidates fetches already in flight for `key`; their results will
    /// be dropped when they land.
    pub fn cancel(&self, key: ScopeKey) {
        self.inner.lock().entries.entry(key).or_default().generation += 1;
    }

    #[must_use]
    pub fn begin_fetch(&self, key: ScopeKey) -> FetchTicket {
        let generation = self.inner.lock().entries.entry(key).or_default().generation;
        FetchTicket { key, generation }
    }

    /// Stores a fetch result unless it was cancelled or a mutation is in
    /// flight. Returns whether the data was written.
    pub fn complete_fetch(&self, ticket: FetchTicket, data: Vec<Task>) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(ticket.key).or_default();
        if entry.generation != ticket.generation || entry.in_flight > 0 {
            return false;
        }
        entry.data = Some(data);
        true
    }

    /// Waits for earlier mutations on `key` to settle. Queued callers are
    /// served in arrival order.
    pub(crate) async fn acquire_scope(&self, key: ScopeKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.inner.lock().scopes.entry(key).or_default());
        lock.lock_owned().await
    }

    /// Releases a scope taken with `acquire_scope`. The lock is forgotten once
    /// nobody holds or waits on it.
    pub(crate) fn release_scope(&self, key: ScopeKey, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut inner = self.inner.lock();
        if inner.scopes.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            inner.scopes.remove(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn scope_count(&self) -> usize {
        self.inner.lock().scopes.len()
    }

    /// Cancels reads, marks a mutation in flight and returns the snapshot.
    pub(crate) fn begin_mutation(&self, key: ScopeKey) -> Option<Vec<Task>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(key).or_default();
        entry.generation += 1;
        entry.in_flight += 1;
        entry.data.clone()
    }

    pub(crate) fn write(&self, key: ScopeKey, data: Option<Vec<Task>>) {
        self.inner.lock().entries.entry(key).or_default().data = data;
    }

    /// Fetches started while the mutation was in flight stay discarded.
    pub(crate) fn end_mutation(&self, key: ScopeKey) {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(key).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.generation += 1;
    }
}
