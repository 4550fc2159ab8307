//! Best-effort replay of mutations that failed on a transient error.
//!
//! The client has already rolled these back and told the user. Once the
//! server answers again, `drain` replays them in order and refetches every
//! scope they touched so the cache shows what the server actually holds.

use parking_lot::Mutex;
use std::{collections::BTreeSet, collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use unicorn_core::{ProjectId, TaskId};
use unicorn_protocol::{CreateTaskRequest, ReorderRequest, UpdateTaskRequest};

use crate::client::BoardClient;
use crate::remote::{RemoteError, TaskRemote, is_not_found};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
    Create(CreateTaskRequest),
    Update { project_id: ProjectId, task_id: TaskId, patch: UpdateTaskRequest },
    Delete { project_id: ProjectId, task_id: TaskId },
    Reorder(ReorderRequest),
}

impl PendingMutation {
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::Create(request) => request.project_id,
            Self::Update { project_id, .. } | Self::Delete { project_id, .. } => *project_id,
            Self::Reorder(request) => request.project_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Reorder(_) => "reorder",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryQueue {
    inner: Arc<Mutex<VecDeque<PendingMutation>>>,
}

impl RecoveryQueue {
    pub fn push(&self, mutation: PendingMutation) {
        self.inner.lock().push_back(mutation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn take_all(&self) -> Vec<PendingMutation> {
        self.inner.lock().drain(..).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub refreshed: usize,
}

pub struct RecoveryService<R> {
    client: BoardClient<R>,
    policy: RetryPolicy,
    probe_timeout: Duration,
}

impl<R: TaskRemote> RecoveryService<R> {
    #[must_use]
    pub fn new(client: BoardClient<R>) -> Self {
        Self { client, policy: RetryPolicy::default(), probe_timeout: DEFAULT_PROBE_TIMEOUT }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Checks that the server answers within the probe timeout.
    pub async fn probe(&self) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.probe_timeout, self.client.remote().health()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transport(format!(
                "server did not answer within {} ms",
                self.probe_timeout.as_millis()
            ))),
        }
    }

    /// Replays queued mutations, then refetches the scopes they touched.
    /// Mutations that still fail transiently go back on the queue.
    pub async fn drain(&self) -> Result<DrainReport, RemoteError> {
        let queue = self.client.pending();
        if queue.is_empty() {
            return Ok(DrainReport::default());
        }
        self.probe().await?;

        let mut report = DrainReport::default();
        let mut scopes = BTreeSet::new();
        for mutation in queue.take_all() {
            scopes.insert(mutation.project_id());
            let replaying = &mutation;
            let outcome = retry_with_backoff(&self.policy, move || self.replay(replaying)).await;
            match outcome {
                Ok(()) => report.replayed += 1,
                Err(err) if err.is_retryable() => {
                    warn!(kind = mutation.label(), error = %err, "replay still failing, requeued");
                    queue.push(mutation);
                    report.requeued += 1;
                }
                Err(err) => {
                    warn!(kind = mutation.label(), error = %err, "replay rejected, dropped");
                    report.dropped += 1;
                }
            }
        }

        for project_id in scopes {
            match self.client.refresh(project_id).await {
                Ok(_) => report.refreshed += 1,
                Err(err) => warn!(%project_id, error = %err, "refetch after replay failed"),
            }
        }

        info!(?report, "recovery drain finished");
        Ok(report)
    }

    async fn replay(&self, mutation: &PendingMutation) -> Result<(), RemoteError> {
        let remote = self.client.remote();
        match mutation {
            PendingMutation::Create(request) => remote.create_task(request.clone()).await.map(|_| ()),
            PendingMutation::Update { task_id, patch, .. } => {
                remote.update_task(task_id.clone(), patch.clone()).await.map(|_| ())
            }
            PendingMutation::Delete { task_id, .. } => match remote.delete_task(task_id.clone()).await {
                Err(err) if is_not_found(&err) => Ok(()),
                result => result,
            },
            PendingMutation::Reorder(request) => remote.reorder(request.clone()).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryCache, ScopeKey};
    use crate::client::MutationError;
    use crate::client::testing::FakeRemote;
    use crate::notice::Notifier;
    use std::sync::atomic::{AtomicU32, Ordering};
    use unicorn_core::Task;

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Transport("refused".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Rejected { status: 400, message: "bad".into() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let result: Result<(), _> = retry_with_backoff(&policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transport("down".into()))
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    fn client(remote: FakeRemote) -> BoardClient<FakeRemote> {
        let (notifier, _rx) = Notifier::channel();
        BoardClient::new(remote, QueryCache::new(), notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn drain_replays_and_refetches() {
        let remote = FakeRemote::default();
        let project = ProjectId::new();
        let task = Task::new(project, "queued");
        remote.seed(vec![task.clone()]);
        let client = client(remote.clone());
        client.cache().set(ScopeKey::tasks(project), vec![task.clone()]);

        let patch = UpdateTaskRequest { title: Some("renamed".into()), ..Default::default() };
        client.pending().push(PendingMutation::Update {
            project_id: project,
            task_id: task.id.clone(),
            patch,
        });

        let report = RecoveryService::new(client.clone()).drain().await.unwrap();
        assert_eq!(report, DrainReport { replayed: 1, requeued: 0, dropped: 0, refreshed: 1 });
        assert!(client.pending().is_empty());
        assert_eq!(client.tasks(project)[0].title, "renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_keeps_the_queue_while_offline() {
        let remote = FakeRemote::default();
        remote.go_offline();
        let client = client(remote);
        let project = ProjectId::new();
        client.pending().push(PendingMutation::Delete { project_id: project, task_id: "gone".into() });

        let err = RecoveryService::new(client.clone()).drain().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.pending().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out_on_a_hung_server() {
        let remote = FakeRemote::default();
        remote.set_latency(Duration::from_secs(60));
        let service = RecoveryService::new(client(remote)).with_probe_timeout(Duration::from_millis(50));
        let err = service.probe().await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(message) if message.contains("50 ms")));
    }

    #[tokio::test(start_paused = true)]
    async fn replaying_a_create_whose_response_was_lost_adds_one_task() {
        let remote = FakeRemote::default();
        let client = client(remote.clone());
        let project = ProjectId::new();
        client.cache().set(ScopeKey::tasks(project), Vec::new());

        remote.lose_next_response();
        let err = client.create_task(CreateTaskRequest::new(project, "written once")).await.unwrap_err();
        assert!(matches!(err, MutationError::Remote(RemoteError::Transport(_))));
        assert_eq!(remote.stored().len(), 1);
        assert_eq!(client.pending().len(), 1);

        let report = RecoveryService::new(client.clone()).drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        let stored = remote.stored();
        assert_eq!(stored.len(), 1);
        let cached = client.tasks(project);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, stored[0].id);
        assert!(!cached[0].id.is_placeholder());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_missing_task_counts_as_replayed() {
        let remote = FakeRemote::default();
        let client = client(remote);
        let project = ProjectId::new();
        client.pending().push(PendingMutation::Delete { project_id: project, task_id: "gone".into() });

        let report = RecoveryService::new(client.clone()).drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.dropped, 0);
    }
}
