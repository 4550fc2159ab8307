use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use unicorn_core::{
    Column, OrderKey, Project, ProjectId, Repository, RepositoryId, Task, TaskId, now_ms,
};
use unicorn_protocol::{
    BoardEvent, CreateProjectRequest, CreateRepositoryRequest, CreateTaskRequest, EventKind,
    ReorderRequest, ReorderResponse, UpdateTaskRequest,
};

use crate::{error::ApiError, store, ws};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub hub: Arc<ws::ProjectHub>,
}

impl AppState {
    #[must_use]
    pub fn new(connection: Connection, broadcast_capacity: usize) -> Self {
        Self {
            db: Arc::new(Mutex::new(connection)),
            hub: Arc::new(ws::ProjectHub::new(broadcast_capacity)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/projects", post(create_project).get(list_projects))
        .route(
            "/v1/projects/{project_id}/repositories",
            post(create_repository).get(list_repositories),
        )
        .route("/v1/projects/{project_id}/tasks", get(list_tasks))
        .route("/v1/projects/{project_id}/ws", get(ws::project_socket))
        .route("/v1/tasks", post(create_task))
        .route("/v1/tasks/reorder", post(reorder_tasks))
        .route("/v1/tasks/{task_id}", patch(update_task).delete(delete_task))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let project = Project::new(request.name.trim());
    let db = state.db.lock().await;
    store::insert_project(&db, &project)?;
    info!(project_id = %project.id, "project created");
    Ok(Json(project))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(store::query_projects(&db)?))
}

async fn create_repository(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    Json(request): Json<CreateRepositoryRequest>,
) -> Result<Json<Repository>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let db = state.db.lock().await;
    if !store::project_exists(&db, project_id)? {
        return Err(ApiError::not_found("project_id not found"));
    }

    let repository = Repository {
        id: RepositoryId::new(),
        project_id,
        name: request.name.trim().to_string(),
        created_at_ms: now_ms(),
    };
    store::insert_repository(&db, &repository)?;
    Ok(Json(repository))
}

async fn list_repositories(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<Vec<Repository>>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(store::query_repositories(&db, project_id)?))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let db = state.db.lock().await;
    if !store::project_exists(&db, project_id)? {
        return Err(ApiError::not_found("project_id not found"));
    }
    Ok(Json(store::query_tasks(&db, project_id)?))
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    if request.title.trim().is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }
    let order_key = request.order_key.as_ref().map(|key| OrderKey::parse(key.as_str())).transpose()?;
    if let Some(id) = &request.id
        && (id.as_str().trim().is_empty() || id.is_placeholder())
    {
        return Err(ApiError::bad_request("id must be a real task id"));
    }

    let task = {
        let db = state.db.lock().await;
        if !store::project_exists(&db, request.project_id)? {
            return Err(ApiError::not_found("project_id not found"));
        }
        if let Some(id) = &request.id
            && let Some(existing) = store::fetch_task(&db, id)?
        {
            if existing.project_id != request.project_id {
                return Err(ApiError::conflict("id already belongs to another project"));
            }
            info!(project_id = %existing.project_id, task_id = %existing.id, "task create repeated");
            return Ok(Json(existing));
        }
        if let Some(repository_id) = request.repository_id
            && !store::repository_in_project(&db, repository_id, request.project_id)?
        {
            return Err(ApiError::bad_request("repository_id does not belong to project"));
        }

        let mut task = Task::new(request.project_id, request.title.trim());
        if let Some(id) = request.id {
            task.id = id;
        }
        task.description = request.description;
        task.status = request.status.unwrap_or(Column::Todo);
        task.priority = request.priority.unwrap_or_default();
        task.order_key = order_key.unwrap_or_default();
        task.repository_id = request.repository_id;
        if task.status == Column::Done {
            task.completed_at_ms = Some(task.created_at_ms);
        }

        store::insert_task(&db, &task)?;
        store::fetch_task(&db, &task.id)?
            .ok_or_else(|| ApiError::internal("failed to reload task after creation"))?
    };

    info!(project_id = %task.project_id, task_id = %task.id, "task created");
    state.hub.publish(&BoardEvent::new(task.project_id, EventKind::TaskCreated(task.clone()))).await;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(request): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    if request.is_empty() {
        return Err(ApiError::bad_request("at least one field is required"));
    }
    if let Some(title) = &request.title
        && title.trim().is_empty()
    {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    if let Some(key) = &request.order_key {
        OrderKey::parse(key.as_str())?;
    }

    let task = {
        let db = state.db.lock().await;
        if let Some(repository_id) = request.repository_id {
            let existing = store::fetch_task(&db, &task_id)?
                .ok_or_else(|| ApiError::not_found("task_id not found"))?;
            if !store::repository_in_project(&db, repository_id, existing.project_id)? {
                return Err(ApiError::bad_request("repository_id does not belong to project"));
            }
        }
        store::update_task(&db, &task_id, &request)?
    };

    state.hub.publish(&BoardEvent::new(task.project_id, EventKind::TaskUpdated(task.clone()))).await;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project_id = {
        let db = state.db.lock().await;
        store::delete_task(&db, &task_id)?.ok_or_else(|| ApiError::not_found("task_id not found"))?
    };

    info!(%project_id, %task_id, "task deleted");
    state
        .hub
        .publish(&BoardEvent::new(project_id, EventKind::TaskDeleted { task_id: task_id.clone() }))
        .await;
    Ok(Json(serde_json::json!({ "ok": true, "task_id": task_id })))
}

async fn reorder_tasks(
    State(state): State<AppState>,
    Json(request): Json<ReorderRequest>,
) -> Result<Json<ReorderResponse>, ApiError> {
    if request.tasks.is_empty() {
        return Err(ApiError::bad_request("tasks must not be empty"));
    }
    for entry in &request.tasks {
        OrderKey::parse(entry.order_key.as_str())?;
    }

    let tasks = {
        let mut db = state.db.lock().await;
        if !store::project_exists(&db, request.project_id)? {
            return Err(ApiError::not_found("project_id not found"));
        }
        store::apply_reorder(&mut db, &request)?
    };

    info!(project_id = %request.project_id, count = tasks.len(), "tasks reordered");
    state
        .hub
        .publish(&BoardEvent::new(request.project_id, EventKind::TasksReordered { tasks: tasks.clone() }))
        .await;
    Ok(Json(ReorderResponse { tasks }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use unicorn_protocol::ReorderEntry;

    fn state() -> AppState {
        let conn = Connection::open_in_memory().unwrap();
        store::init_schema(&conn).unwrap();
        AppState::new(conn, 16)
    }

    async fn project(state: &AppState) -> Project {
        let request = CreateProjectRequest { name: "board".to_string() };
        create_project(State(state.clone()), Json(request)).await.unwrap().0
    }

    #[tokio::test]
    async fn create_task_defaults_ordering_fields() {
        let state = state();
        let project = project(&state).await;

        let task = create_task(State(state.clone()), Json(CreateTaskRequest::new(project.id, "  first  ")))
            .await
            .unwrap()
            .0;
        assert_eq!(task.title, "first");
        assert_eq!(task.status, Column::Todo);
        assert_eq!(task.order_key.as_str(), "1000");
        assert_eq!(task.priority.value(), 3);
    }

    #[tokio::test]
    async fn create_task_rejects_bad_input() {
        let state = state();
        let project = project(&state).await;

        let err = create_task(State(state.clone()), Json(CreateTaskRequest::new(project.id, " ")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let mut request = CreateTaskRequest::new(project.id, "a");
        request.order_key = Some(OrderKey::from("soon"));
        let err = create_task(State(state.clone()), Json(request)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = create_task(State(state.clone()), Json(CreateTaskRequest::new(ProjectId::new(), "a")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn repeated_create_with_the_same_id_returns_the_first_task() {
        let state = state();
        let other = project(&state).await;
        let project = project(&state).await;
        let mut request = CreateTaskRequest::new(project.id, "once");
        request.id = Some(TaskId::from("task-1"));
        let mut rx = state.hub.subscribe(project.id).await;

        let first = create_task(State(state.clone()), Json(request.clone())).await.unwrap().0;
        assert_eq!(first.id.as_str(), "task-1");
        let again = create_task(State(state.clone()), Json(request)).await.unwrap().0;
        assert_eq!(again, first);

        let listed = list_tasks(State(state.clone()), Path(project.id)).await.unwrap().0;
        assert_eq!(listed.len(), 1);
        let event: BoardEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(event.kind, EventKind::TaskCreated(_)));
        assert!(rx.try_recv().is_err());

        let mut stolen = CreateTaskRequest::new(other.id, "once");
        stolen.id = Some(TaskId::from("task-1"));
        let err = create_task(State(state.clone()), Json(stolen)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let mut placeholder = CreateTaskRequest::new(project.id, "temp");
        placeholder.id = Some(TaskId::placeholder());
        let err = create_task(State(state.clone()), Json(placeholder)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reorder_persists_and_broadcasts() {
        let state = state();
        let project = project(&state).await;
        let task = create_task(State(state.clone()), Json(CreateTaskRequest::new(project.id, "a")))
            .await
            .unwrap()
            .0;
        let mut rx = state.hub.subscribe(project.id).await;

        let request = ReorderRequest {
            project_id: project.id,
            tasks: vec![ReorderEntry {
                id: task.id.clone(),
                order_key: OrderKey::from("1500"),
                status: Some(Column::Doing),
            }],
        };
        let response = reorder_tasks(State(state.clone()), Json(request)).await.unwrap().0;
        assert_eq!(response.tasks[0].status, Column::Doing);

        let listed = list_tasks(State(state.clone()), Path(project.id)).await.unwrap().0;
        assert_eq!(listed[0].order_key.as_str(), "1500");

        let event: BoardEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(event.kind, EventKind::TasksReordered { ref tasks } if tasks.len() == 1));
    }

    #[tokio::test]
    async fn update_rejects_empty_patch_and_missing_task() {
        let state = state();
        let err = update_task(State(state.clone()), Path(TaskId::new()), Json(UpdateTaskRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let patch = UpdateTaskRequest { title: Some("x".into()), ..Default::default() };
        let err = update_task(State(state.clone()), Path(TaskId::new()), Json(patch)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_broadcasts_to_project() {
        let state = state();
        let project = project(&state).await;
        let task = create_task(State(state.clone()), Json(CreateTaskRequest::new(project.id, "a")))
            .await
            .unwrap()
            .0;
        let mut rx = state.hub.subscribe(project.id).await;

        delete_task(State(state.clone()), Path(task.id.clone())).await.unwrap();
        let event: BoardEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(event.kind, EventKind::TaskDeleted { ref task_id } if *task_id == task.id));

        let err = delete_task(State(state.clone()), Path(task.id)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
