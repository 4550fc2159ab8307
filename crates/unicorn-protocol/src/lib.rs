use serde::{Deserialize, Serialize};
use unicorn_core::{
    Column, KeyUpdate, OrderKey, Priority, ProjectId, RepositoryId, Task, TaskId, now_ms,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    /// Client-chosen id. Sending the same id again returns the task created
    /// the first time instead of a duplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<OrderKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<RepositoryId>,
}

impl CreateTaskRequest {
    #[must_use]
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        Self {
            id: None,
            project_id,
            title: title.into(),
            description: None,
            status: None,
            priority: None,
            order_key: None,
            repository_id: None,
        }
    }
}

/// Partial task update; absent fields stay as stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<OrderKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<RepositoryId>,
}

impl UpdateTaskRequest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the patch to a local copy of the task.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = Some(description.clone());
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(order_key) = &self.order_key {
            task.order_key = order_key.clone();
        }
        if let Some(repository_id) = self.repository_id {
            if task.repository_id != Some(repository_id) {
                task.repository = None;
            }
            task.repository_id = Some(repository_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderEntry {
    pub id: TaskId,
    pub order_key: OrderKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Column>,
}

impl From<&KeyUpdate> for ReorderEntry {
    fn from(update: &KeyUpdate) -> Self {
        Self { id: update.task_id.clone(), order_key: update.order_key.clone(), status: update.status }
    }
}

/// Batch of key updates applied atomically by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub project_id: ProjectId,
    pub tasks: Vec<ReorderEntry>,
}

impl ReorderRequest {
    #[must_use]
    pub fn from_updates(project_id: ProjectId, updates: &[KeyUpdate]) -> Self {
        Self { project_id, tasks: updates.iter().map(ReorderEntry::from).collect() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

/// Pushed to every socket subscribed to `project_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEvent {
    pub event_id: Uuid,
    pub project_id: ProjectId,
    pub kind: EventKind,
    pub sent_at_ms: u64,
}

impl BoardEvent {
    #[must_use]
    pub fn new(project_id: ProjectId, kind: EventKind) -> Self {
        Self { event_id: Uuid::new_v4(), project_id, kind, sent_at_ms: now_ms() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted { task_id: TaskId },
    TasksReordered { tasks: Vec<Task> },
}

impl EventKind {
    /// Wire tag of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated(_) => "task_created",
            Self::TaskUpdated(_) => "task_updated",
            Self::TaskDeleted { .. } => "task_deleted",
            Self::TasksReordered { .. } => "tasks_reordered",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_request_wire_shape() {
        let project_id = ProjectId(Uuid::nil());
        let updates = vec![
            KeyUpdate { task_id: "a".into(), order_key: "1500".into(), status: None },
            KeyUpdate { task_id: "b".into(), order_key: "1000".into(), status: Some(Column::Doing) },
        ];
        let json = serde_json::to_value(ReorderRequest::from_updates(project_id, &updates)).unwrap();
        assert_eq!(json["project_id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["tasks"][0]["id"], "a");
        assert_eq!(json["tasks"][0]["order_key"], "1500");
        assert!(json["tasks"][0].get("status").is_none());
        assert_eq!(json["tasks"][1]["status"], "doing");
    }

    #[test]
    fn event_kind_is_tagged() {
        let event =
            BoardEvent::new(ProjectId::new(), EventKind::TaskDeleted { task_id: "t1".into() });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_deleted\""));
        assert!(json.contains("\"task_id\":\"t1\""));
    }

    #[test]
    fn patch_leaves_unrelated_fields() {
        let mut task = Task::new(ProjectId::new(), "a");
        task.order_key = "2500".into();
        let patch = UpdateTaskRequest { title: Some("b".into()), ..Default::default() };
        patch.apply_to(&mut task);
        assert_eq!(task.title, "b");
        assert_eq!(task.order_key.as_str(), "2500");
        assert!(!patch.is_empty());
        assert!(UpdateTaskRequest::default().is_empty());
    }
}
