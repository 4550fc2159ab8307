use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod error;
pub mod order_key;
pub mod planner;
pub mod reconcile;

pub use error::OrderingError;
pub use order_key::OrderKey;
pub use planner::{DragGesture, DropTarget, KeyUpdate, ReorderPlan, apply_updates, plan_reorder};
pub use reconcile::{compare_tasks, needs_rebalance, rebalance, reconcile_board, reconcile_column};

/// Prefix carried by client-side ids until the server confirms creation.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Task identifier. Server ids are UUIDs; placeholders start with
/// [`PLACEHOLDER_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn placeholder() -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub Uuid);

impl RepositoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kanban lane a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Todo,
    Doing,
    Done,
    Loop,
}

impl Column {
    pub const ALL: [Column; 4] = [Column::Todo, Column::Doing, Column::Done, Column::Loop];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Column {
    type Err = OrderingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "doing" => Ok(Self::Doing),
            "done" => Ok(Self::Done),
            "loop" => Ok(Self::Loop),
            other => Err(OrderingError::InvalidColumn(other.to_string())),
        }
    }
}

/// Task priority in `1..=5`; higher sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Result<Self, OrderingError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(OrderingError::InvalidPriority(value))
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u8> for Priority {
    type Error = OrderingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: RepositoryId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: Column,
    pub priority: Priority,
    pub order_key: OrderKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<RepositoryId>,
    /// Resolved relation; absent from bare mutation responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryRef>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl Task {
    #[must_use]
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: TaskId::new(),
            project_id,
            title: title.into(),
            description: None,
            status: Column::Todo,
            priority: Priority::default(),
            order_key: OrderKey::default(),
            repository_id: None,
            repository: None,
            created_at_ms: now,
            updated_at_ms: now,
            completed_at_ms: None,
        }
    }

    /// Timestamp the `done` column sorts by.
    #[must_use]
    pub fn completion_ms(&self) -> u64 {
        self.completed_at_ms.unwrap_or(self.updated_at_ms)
    }

    /// Sets or clears the completion time after a move out of `previous`.
    pub fn stamp_completion(&mut self, previous: Column, now: u64) {
        match (previous, self.status) {
            (Column::Done, Column::Done) => {}
            (_, Column::Done) => self.completed_at_ms = Some(now),
            _ => self.completed_at_ms = None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at_ms: u64,
}

impl Project {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: ProjectId::new(), name: name.into(), created_at_ms: now_ms() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub project_id: ProjectId,
    pub name: String,
    pub created_at_ms: u64,
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_unique() {
        let a = ProjectId::new();
        let b = ProjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn placeholder_ids_are_recognised() {
        assert!(TaskId::placeholder().is_placeholder());
        assert!(!TaskId::new().is_placeholder());
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert_eq!(Priority::new(5).map(Priority::value), Ok(5));
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn completion_follows_the_done_column() {
        let mut task = Task::new(ProjectId::new(), "a");
        task.status = Column::Done;
        task.stamp_completion(Column::Doing, 42);
        assert_eq!(task.completed_at_ms, Some(42));

        task.stamp_completion(Column::Done, 99);
        assert_eq!(task.completed_at_ms, Some(42));

        task.status = Column::Loop;
        task.stamp_completion(Column::Done, 100);
        assert_eq!(task.completed_at_ms, None);
    }

    #[test]
    fn column_round_trips_through_str() {
        for column in Column::ALL {
            assert_eq!(column.as_str().parse::<Column>(), Ok(column));
        }
        assert!("backlog".parse::<Column>().is_err());
    }

    #[test]
    fn task_omits_unresolved_relations() {
        let task = Task::new(ProjectId::new(), "write docs");
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("repository").is_none());
        assert_eq!(json["status"], "todo");
        assert_eq!(json["order_key"], "1000");
        assert_eq!(json["priority"], 3);
    }
}
