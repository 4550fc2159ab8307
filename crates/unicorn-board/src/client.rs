//! Optimistic board client.
//!
//! Every mutation runs as one [`Transaction`] on the project's scope: the
//! tentative state is visible as soon as the request leaves, the server's
//! answer is merged on success, and the snapshot comes back on failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use unicorn_core::{
    Column, DragGesture, OrderingError, ProjectId, ReorderPlan, RepositoryId, RepositoryRef, Task,
    TaskId, apply_updates, now_ms, plan_reorder, reconcile_board,
};
use unicorn_protocol::{CreateTaskRequest, ReorderRequest, UpdateTaskRequest};

use crate::cache::{QueryCache, ScopeKey};
use crate::notice::Notifier;
use crate::recovery::{PendingMutation, RecoveryQueue};
use crate::remote::{RemoteError, TaskRemote, is_not_found};
use crate::transaction::Transaction;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Rejected(#[from] OrderingError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub struct BoardClient<R> {
    remote: Arc<R>,
    cache: QueryCache,
    notifier: Notifier,
    pending: RecoveryQueue,
}

impl<R> Clone for BoardClient<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            cache: self.cache.clone(),
            notifier: self.notifier.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<R: TaskRemote> BoardClient<R> {
    #[must_use]
    pub fn new(remote: R, cache: QueryCache, notifier: Notifier) -> Self {
        Self { remote: Arc::new(remote), cache, notifier, pending: RecoveryQueue::default() }
    }

    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    #[must_use]
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Mutations that failed transiently and wait for a recovery drain.
    #[must_use]
    pub fn pending(&self) -> &RecoveryQueue {
        &self.pending
    }

    #[must_use]
    pub fn tasks(&self, project_id: ProjectId) -> Vec<Task> {
        self.cache.get(ScopeKey::tasks(project_id)).unwrap_or_default()
    }

    /// Cached tasks laid out per column in render order.
    #[must_use]
    pub fn board(&self, project_id: ProjectId) -> BTreeMap<Column, Vec<Task>> {
        reconcile_board(&self.tasks(project_id))
    }

    /// Refetches the project's tasks. Returns `false` when the result was
    /// discarded because a mutation started meanwhile.
    pub async fn refresh(&self, project_id: ProjectId) -> Result<bool, RemoteError> {
        let key = ScopeKey::tasks(project_id);
        let ticket = self.cache.begin_fetch(key);
        let tasks = self.remote.list_tasks(project_id).await?;
        let stored = self.cache.complete_fetch(ticket, tasks);
        if !stored {
            debug!(scope = %key, "discarded stale fetch");
        }
        Ok(stored)
    }

    /// The request gets an id here when it has none, so a replay after a lost
    /// response finds the task already created.
    pub async fn create_task(&self, mut request: CreateTaskRequest) -> Result<Task, MutationError> {
        request.id.get_or_insert_with(TaskId::new);
        let mut tx = Transaction::begin(&self.cache, ScopeKey::tasks(request.project_id)).await;
        let placeholder = placeholder_for(&request, tx.snapshot().unwrap_or_default());
        tx.apply(|tasks| tasks.insert(0, placeholder.clone()));

        match self.remote.create_task(request.clone()).await {
            Ok(created) => {
                info!(project_id = %created.project_id, task_id = %created.id, "task created");
                tx.commit(|tasks| replace_placeholder(tasks, &placeholder, created.clone()));
                Ok(created)
            }
            Err(err) => Err(self.fail(tx, "create task", err, PendingMutation::Create(request))),
        }
    }

    pub async fn update_task(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        patch: UpdateTaskRequest,
    ) -> Result<Task, MutationError> {
        let mut tx = Transaction::begin(&self.cache, ScopeKey::tasks(project_id)).await;
        tx.apply(|tasks| {
            let relations = repository_refs(tasks);
            if let Some(task) = tasks.iter_mut().find(|task| task.id == task_id) {
                let previous = task.status;
                patch.apply_to(task);
                task.stamp_completion(previous, now_ms());
                if task.repository.is_none() {
                    task.repository = resolve_repository(&relations, task.repository_id);
                }
            }
        });

        match self.remote.update_task(task_id.clone(), patch.clone()).await {
            Ok(updated) => {
                info!(%project_id, task_id = %updated.id, "task updated");
                tx.commit(|tasks| merge_confirmed(tasks, updated.clone()));
                Ok(updated)
            }
            Err(err) => Err(self.fail(
                tx,
                "update task",
                err,
                PendingMutation::Update { project_id, task_id, patch },
            )),
        }
    }

    /// Deleting a task the server no longer has counts as success.
    pub async fn delete_task(&self, project_id: ProjectId, task_id: TaskId) -> Result<(), MutationError> {
        let mut tx = Transaction::begin(&self.cache, ScopeKey::tasks(project_id)).await;
        tx.apply(|tasks| tasks.retain(|task| task.id != task_id));

        match self.remote.delete_task(task_id.clone()).await {
            Ok(()) => {
                info!(%project_id, %task_id, "task deleted");
                tx.commit(|_| {});
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!(%project_id, %task_id, "task already gone");
                tx.commit(|_| {});
                Ok(())
            }
            Err(err) => Err(self.fail(
                tx,
                "delete task",
                err,
                PendingMutation::Delete { project_id, task_id },
            )),
        }
    }

    /// Plans a drag gesture against the cached board and submits the
    /// resulting key updates as one batch. Returns the confirmed tasks, or
    /// nothing when the gesture changes nothing.
    pub async fn reorder(
        &self,
        project_id: ProjectId,
        gesture: &DragGesture,
    ) -> Result<Vec<Task>, MutationError> {
        let mut tx = Transaction::begin(&self.cache, ScopeKey::tasks(project_id)).await;
        let current = tx.snapshot().unwrap_or_default();

        let updates = match plan_reorder(current, gesture) {
            Ok(ReorderPlan::Updates(updates)) => updates,
            Ok(ReorderPlan::NoOp) => {
                debug!(%project_id, active = %gesture.active, "gesture changes nothing");
                tx.rollback();
                return Ok(Vec::new());
            }
            Err(err) => {
                tx.rollback();
                self.notifier.warning(err.to_string());
                return Err(err.into());
            }
        };

        let moved: Vec<(TaskId, Column)> = updates
            .iter()
            .filter(|update| update.status.is_some())
            .filter_map(|update| {
                current.iter().find(|task| task.id == update.task_id).map(|task| (task.id.clone(), task.status))
            })
            .collect();
        tx.apply(|tasks| {
            apply_updates(tasks, &updates);
            let now = now_ms();
            for (task_id, previous) in &moved {
                if let Some(task) = tasks.iter_mut().find(|task| task.id == *task_id) {
                    task.stamp_completion(*previous, now);
                }
            }
        });

        let request = ReorderRequest::from_updates(project_id, &updates);
        match self.remote.reorder(request.clone()).await {
            Ok(confirmed) => {
                info!(%project_id, count = confirmed.len(), "reorder confirmed");
                tx.commit(|tasks| {
                    for task in &confirmed {
                        merge_confirmed(tasks, task.clone());
                    }
                });
                Ok(confirmed)
            }
            Err(err) => Err(self.fail(tx, "reorder tasks", err, PendingMutation::Reorder(request))),
        }
    }

    fn fail(
        &self,
        tx: Transaction,
        action: &str,
        err: RemoteError,
        mutation: PendingMutation,
    ) -> MutationError {
        tx.rollback();
        self.notifier.error(format!("could not {action}: {err}"));
        if err.is_retryable() {
            self.pending.push(mutation);
        }
        MutationError::Remote(err)
    }
}

fn placeholder_for(request: &CreateTaskRequest, cached: &[Task]) -> Task {
    let mut task = Task::new(request.project_id, request.title.trim());
    task.id = TaskId::placeholder();
    task.description = request.description.clone();
    task.status = request.status.unwrap_or(Column::Todo);
    task.priority = request.priority.unwrap_or_default();
    task.order_key = request.order_key.clone().unwrap_or_default();
    task.repository_id = request.repository_id;
    task.repository = resolve_repository(&repository_refs(cached), request.repository_id);
    if task.status == Column::Done {
        task.completed_at_ms = Some(task.created_at_ms);
    }
    task
}

fn repository_refs(tasks: &[Task]) -> Vec<RepositoryRef> {
    tasks.iter().filter_map(|task| task.repository.clone()).collect()
}

fn resolve_repository(known: &[RepositoryRef], id: Option<RepositoryId>) -> Option<RepositoryRef> {
    let id = id?;
    known.iter().find(|repository| repository.id == id).cloned()
}

/// Swaps the placeholder for the created task, matching by id and falling
/// back to the title among placeholders.
fn replace_placeholder(tasks: &mut Vec<Task>, placeholder: &Task, created: Task) {
    let slot = tasks
        .iter()
        .position(|task| task.id == placeholder.id)
        .or_else(|| tasks.iter().position(|task| task.id.is_placeholder() && task.title == created.title));
    match slot {
        Some(index) => tasks[index] = keep_relation(&tasks[index], created),
        None => merge_confirmed(tasks, created),
    }
}

fn merge_confirmed(tasks: &mut Vec<Task>, confirmed: Task) {
    match tasks.iter_mut().find(|task| task.id == confirmed.id) {
        Some(slot) => *slot = keep_relation(slot, confirmed),
        None => tasks.push(confirmed),
    }
}

/// Mutation responses carry the bare row; keep the relation already on
/// screen when it still applies.
fn keep_relation(local: &Task, mut confirmed: Task) -> Task {
    if confirmed.repository.is_none() && confirmed.repository_id == local.repository_id {
        confirmed.repository = local.repository.clone();
    }
    confirmed
}
