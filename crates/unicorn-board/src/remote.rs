use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;
use unicorn_core::{ProjectId, Task, TaskId};
use unicorn_protocol::{
    CreateTaskRequest, ErrorBody, ReorderRequest, ReorderResponse, UpdateTaskRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether replaying the same request later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Durable side of the board. Every call either returns the authoritative
/// entity or fails.
pub trait TaskRemote: Send + Sync + 'static {
    fn list_tasks(
        &self,
        project_id: ProjectId,
    ) -> impl Future<Output = Result<Vec<Task>, RemoteError>> + Send;

    fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> impl Future<Output = Result<Task, RemoteError>> + Send;

    fn update_task(
        &self,
        task_id: TaskId,
        patch: UpdateTaskRequest,
    ) -> impl Future<Output = Result<Task, RemoteError>> + Send;

    fn delete_task(&self, task_id: TaskId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn reorder(
        &self,
        request: ReorderRequest,
    ) -> impl Future<Output = Result<Vec<Task>, RemoteError>> + Send;

    fn health(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// [`TaskRemote`] over the board server's JSON API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl TaskRemote for HttpRemote {
    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>, RemoteError> {
        let response =
            self.client.get(self.url(&format!("/v1/projects/{project_id}/tasks"))).send().await?;
        decode(response).await
    }

    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, RemoteError> {
        let response = self.client.post(self.url("/v1/tasks")).json(&request).send().await?;
        decode(response).await
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        patch: UpdateTaskRequest,
    ) -> Result<Task, RemoteError> {
        let response =
            self.client.patch(self.url(&format!("/v1/tasks/{task_id}"))).json(&patch).send().await?;
        decode(response).await
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), RemoteError> {
        let response = self.client.delete(self.url(&format!("/v1/tasks/{task_id}"))).send().await?;
        decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn reorder(&self, request: ReorderRequest) -> Result<Vec<Task>, RemoteError> {
        let response = self.client.post(self.url("/v1/tasks/reorder")).json(&request).send().await?;
        decode::<ReorderResponse>(response).await.map(|body| body.tasks)
    }

    async fn health(&self) -> Result<(), RemoteError> {
        let response = self.client.get(self.url("/healthz")).send().await?;
        decode::<serde_json::Value>(response).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|err| RemoteError::Decode(err.to_string()));
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(RemoteError::Rejected { status: status.as_u16(), message })
}

#[must_use]
pub fn is_not_found(err: &RemoteError) -> bool {
    matches!(err, RemoteError::Rejected { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
}
