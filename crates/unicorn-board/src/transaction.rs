//! Three-phase optimistic transactions over one cache scope.
//!
//! `begin` waits for earlier mutations on the same scope, cancels in-flight
//! reads and takes a snapshot. `apply` writes the tentative state. The
//! transaction then ends in exactly one of `commit` or `rollback`; dropping
//! it unfinished rolls back.

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use unicorn_core::Task;

use crate::cache::{QueryCache, ScopeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Applied,
    Committed,
    RolledBack,
}

pub struct Transaction {
    cache: QueryCache,
    key: ScopeKey,
    snapshot: Option<Vec<Task>>,
    phase: Phase,
    scope: Option<OwnedMutexGuard<()>>,
}

impl Transaction {
    pub async fn begin(cache: &QueryCache, key: ScopeKey) -> Self {
        let scope = cache.acquire_scope(key).await;
        let snapshot = cache.begin_mutation(key);
        debug!(scope = %key, cached = snapshot.is_some(), "transaction started");
        Self { cache: cache.clone(), key, snapshot, phase: Phase::Pending, scope: Some(scope) }
    }

    #[must_use]
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// State of the scope before this transaction touched it.
    #[must_use]
    pub fn snapshot(&self) -> Option<&[Task]> {
        self.snapshot.as_deref()
    }

    /// Writes the tentative state. A scope with nothing cached stays empty;
    /// there is nothing on screen to update.
    pub fn apply(&mut self, transform: impl FnOnce(&mut Vec<Task>)) {
        if let Some(mut data) = self.cache.get(self.key) {
            transform(&mut data);
            self.cache.write(self.key, Some(data));
        }
        self.phase = Phase::Applied;
    }

    /// Merges the authoritative result into whatever the scope holds now.
    pub fn commit(mut self, merge: impl FnOnce(&mut Vec<Task>)) {
        if let Some(mut data) = self.cache.get(self.key) {
            merge(&mut data);
            self.cache.write(self.key, Some(data));
        }
        self.finish(Phase::Committed);
    }

    /// Restores the snapshot exactly. Nothing is written if `apply` never ran.
    pub fn rollback(mut self) {
        self.restore();
        self.finish(Phase::RolledBack);
    }

    fn restore(&mut self) {
        if self.phase == Phase::Applied {
            self.cache.write(self.key, self.snapshot.take());
        }
    }

    fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        self.cache.end_mutation(self.key);
        if let Some(scope) = self.scope.take() {
            self.cache.release_scope(self.key, scope);
        }
        debug!(scope = %self.key, ?phase, "transaction finished");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Pending | Phase::Applied) {
            warn!(scope = %self.key, "transaction dropped before completion, rolling back");
            self.restore();
            self.finish(Phase::RolledBack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use unicorn_core::ProjectId;

    fn seeded() -> (QueryCache, ScopeKey, Vec<Task>) {
        let cache = QueryCache::new();
        let project = ProjectId::new();
        let key = ScopeKey::tasks(project);
        let tasks = vec![Task::new(project, "a"), Task::new(project, "b")];
        cache.set(key, tasks.clone());
        (cache, key, tasks)
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let (cache, key, original) = seeded();
        let mut tx = Transaction::begin(&cache, key).await;
        tx.apply(|tasks| tasks.clear());
        assert_eq!(cache.get(key).map(|t| t.len()), Some(0));
        tx.rollback();
        assert_eq!(cache.get(key), Some(original));
    }

    #[tokio::test]
    async fn commit_merges_into_applied_state() {
        let (cache, key, original) = seeded();
        let mut tx = Transaction::begin(&cache, key).await;
        tx.apply(|tasks| tasks[0].title = "tentative".to_string());
        tx.commit(|tasks| tasks[0].title = "confirmed".to_string());
        let data = cache.get(key).unwrap();
        assert_eq!(data[0].title, "confirmed");
        assert_eq!(data[1], original[1]);
    }

    #[tokio::test]
    async fn dropping_an_applied_transaction_rolls_back() {
        let (cache, key, original) = seeded();
        {
            let mut tx = Transaction::begin(&cache, key).await;
            tx.apply(|tasks| {
                tasks.pop();
            });
        }
        assert_eq!(cache.get(key), Some(original));
    }

    #[tokio::test]
    async fn begin_cancels_in_flight_reads() {
        let (cache, key, _) = seeded();
        let ticket = cache.begin_fetch(key);
        let tx = Transaction::begin(&cache, key).await;
        tx.rollback();
        assert!(!cache.complete_fetch(ticket, Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn same_scope_transactions_are_serialized() {
        let (cache, key, _) = seeded();
        let first = Transaction::begin(&cache, key).await;

        let second_cache = cache.clone();
        let second = tokio::spawn(async move {
            let mut tx = Transaction::begin(&second_cache, key).await;
            let seen = tx.snapshot().map(|s| s[0].title.clone());
            tx.apply(|_| {});
            tx.commit(|_| {});
            seen
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        let mut first = first;
        first.apply(|tasks| tasks[0].title = "first".to_string());
        first.commit(|_| {});

        assert_eq!(second.await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn scope_locks_are_forgotten_once_released() {
        let (cache, key, _) = seeded();
        let first = Transaction::begin(&cache, key).await;
        assert_eq!(cache.scope_count(), 1);

        let waiting_cache = cache.clone();
        let waiting = tokio::spawn(async move { Transaction::begin(&waiting_cache, key).await.rollback() });
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.rollback();
        assert_eq!(cache.scope_count(), 1);
        waiting.await.unwrap();
        assert_eq!(cache.scope_count(), 0);

        for _ in 0..3 {
            Transaction::begin(&cache, ScopeKey::tasks(ProjectId::new())).await.commit(|_| {});
        }
        assert_eq!(cache.scope_count(), 0);
    }

    #[tokio::test]
    async fn other_scopes_are_not_blocked() {
        let (cache, key, _) = seeded();
        let _held = Transaction::begin(&cache, key).await;
        let other = ScopeKey::tasks(ProjectId::new());
        let tx = tokio::time::timeout(Duration::from_secs(1), Transaction::begin(&cache, other))
            .await
            .expect("other scope should not wait");
        assert_eq!(tx.phase(), Phase::Pending);
    }
}
