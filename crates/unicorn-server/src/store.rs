use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::{fs, path::Path};
use unicorn_core::{
    Column, OrderKey, Priority, Project, ProjectId, Repository, RepositoryId, RepositoryRef,
    Task, TaskId, now_ms,
};
use unicorn_protocol::{ReorderRequest, UpdateTaskRequest};
use uuid::Uuid;

use crate::error::ApiError;

const TASK_COLUMNS: &str = "
    t.task_id, t.project_id, t.title, t.description, t.status, t.priority, t.order_key,
    t.repository_id, t.created_at_ms, t.updated_at_ms, t.completed_at_ms
";

pub fn init_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS projects (
          project_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS repositories (
          repository_id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL,
          name TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          FOREIGN KEY(project_id) REFERENCES projects(project_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tasks (
          task_id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL,
          title TEXT NOT NULL,
          description TEXT,
          status TEXT NOT NULL,
          priority INTEGER NOT NULL DEFAULT 3,
          order_key TEXT NOT NULL DEFAULT '1000',
          repository_id TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER,
          FOREIGN KEY(project_id) REFERENCES projects(project_id) ON DELETE CASCADE,
          FOREIGN KEY(repository_id) REFERENCES repositories(repository_id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS tasks_by_column ON tasks(project_id, status);
        ",
    )
}

pub fn insert_project(conn: &Connection, project: &Project) -> Result<(), ApiError> {
    conn.execute(
        "INSERT INTO projects (project_id, name, created_at_ms) VALUES (?1, ?2, ?3)",
        params![project.id.to_string(), project.name, project.created_at_ms],
    )?;
    Ok(())
}

pub fn project_exists(conn: &Connection, project_id: ProjectId) -> Result<bool, ApiError> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM projects WHERE project_id = ?1)",
        params![project_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

pub fn query_projects(conn: &Connection) -> Result<Vec<Project>, ApiError> {
    let mut stmt = conn
        .prepare("SELECT project_id, name, created_at_ms FROM projects ORDER BY created_at_ms DESC")?;
    let rows = stmt.query_map([], |row| {
        Ok(Project {
            id: ProjectId(parse_uuid(0, row.get(0)?)?),
            name: row.get(1)?,
            created_at_ms: row.get::<_, i64>(2)? as u64,
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

pub fn insert_repository(conn: &Connection, repository: &Repository) -> Result<(), ApiError> {
    conn.execute(
        "INSERT INTO repositories (repository_id, project_id, name, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![
            repository.id.to_string(),
            repository.project_id.to_string(),
            repository.name,
            repository.created_at_ms
        ],
    )?;
    Ok(())
}

pub fn query_repositories(
    conn: &Connection,
    project_id: ProjectId,
) -> Result<Vec<Repository>, ApiError> {
    let mut stmt = conn.prepare(
        "
        SELECT repository_id, project_id, name, created_at_ms
        FROM repositories WHERE project_id = ?1 ORDER BY name
        ",
    )?;
    let rows = stmt.query_map(params![project_id.to_string()], |row| {
        Ok(Repository {
            id: RepositoryId(parse_uuid(0, row.get(0)?)?),
            project_id: ProjectId(parse_uuid(1, row.get(1)?)?),
            name: row.get(2)?,
            created_at_ms: row.get::<_, i64>(3)? as u64,
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

/// Whether `repository_id` exists and belongs to `project_id`.
pub fn repository_in_project(
    conn: &Connection,
    repository_id: RepositoryId,
    project_id: ProjectId,
) -> Result<bool, ApiError> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM repositories WHERE repository_id = ?1 AND project_id = ?2)",
        params![repository_id.to_string(), project_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<(), ApiError> {
    conn.execute(
        "
        INSERT INTO tasks (
          task_id, project_id, title, description, status, priority, order_key,
          repository_id, created_at_ms, updated_at_ms, completed_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ",
        params![
            task.id.as_str(),
            task.project_id.to_string(),
            task.title,
            task.description,
            task.status.as_str(),
            task.priority.value(),
            task.order_key.as_str(),
            task.repository_id.map(|id| id.to_string()),
            task.created_at_ms,
            task.updated_at_ms,
            task.completed_at_ms.map(|v| v as i64)
        ],
    )?;
    Ok(())
}

/// Bare task row; the repository relation is left unresolved.
pub fn fetch_task(conn: &Connection, task_id: &TaskId) -> Result<Option<Task>, ApiError> {
    let sql = format!("SELECT {TASK_COLUMNS}, NULL FROM tasks t WHERE t.task_id = ?1");
    let task = conn.query_row(&sql, params![task_id.as_str()], map_task_row).optional()?;
    Ok(task)
}

/// All tasks of a project with their repository relation resolved.
pub fn query_tasks(conn: &Connection, project_id: ProjectId) -> Result<Vec<Task>, ApiError> {
    let sql = format!(
        "
        SELECT {TASK_COLUMNS}, r.name
        FROM tasks t
        LEFT JOIN repositories r ON r.repository_id = t.repository_id
        WHERE t.project_id = ?1
        ORDER BY t.status, t.priority DESC, t.created_at_ms DESC
        "
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id.to_string()], map_task_row)?;
    Ok(rows.filter_map(Result::ok).collect())
}

pub fn update_task(
    conn: &Connection,
    task_id: &TaskId,
    patch: &UpdateTaskRequest,
) -> Result<Task, ApiError> {
    let mut task =
        fetch_task(conn, task_id)?.ok_or_else(|| ApiError::not_found("task_id not found"))?;
    let previous_status = task.status;
    patch.apply_to(&mut task);

    let now = now_ms();
    task.stamp_completion(previous_status, now);
    task.updated_at_ms = now;

    conn.execute(
        "
        UPDATE tasks
        SET title = ?2,
            description = ?3,
            status = ?4,
            priority = ?5,
            order_key = ?6,
            repository_id = ?7,
            updated_at_ms = ?8,
            completed_at_ms = ?9
        WHERE task_id = ?1
        ",
        params![
            task.id.as_str(),
            task.title,
            task.description,
            task.status.as_str(),
            task.priority.value(),
            task.order_key.as_str(),
            task.repository_id.map(|id| id.to_string()),
            task.updated_at_ms,
            task.completed_at_ms.map(|v| v as i64)
        ],
    )?;

    fetch_task(conn, task_id)?.ok_or_else(|| ApiError::internal("failed to reload task after update"))
}

pub fn delete_task(conn: &Connection, task_id: &TaskId) -> Result<Option<ProjectId>, ApiError> {
    let Some(task) = fetch_task(conn, task_id)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id.as_str()])?;
    Ok(Some(task.project_id))
}

/// Applies every entry or none of them.
pub fn apply_reorder(conn: &mut Connection, request: &ReorderRequest) -> Result<Vec<Task>, ApiError> {
    let tx = conn.transaction()?;
    let now = now_ms();
    let mut updated = Vec::with_capacity(request.tasks.len());

    for entry in &request.tasks {
        let mut task = fetch_task(&tx, &entry.id)?
            .ok_or_else(|| ApiError::not_found(format!("task {} not found", entry.id)))?;
        if task.project_id != request.project_id {
            return Err(ApiError::bad_request(format!(
                "task {} does not belong to project {}",
                entry.id, request.project_id
            )));
        }

        let previous_status = task.status;
        task.order_key = entry.order_key.clone();
        if let Some(status) = entry.status {
            task.status = status;
        }
        task.stamp_completion(previous_status, now);
        task.updated_at_ms = now;

        tx.execute(
            "
            UPDATE tasks
            SET order_key = ?2, status = ?3, updated_at_ms = ?4, completed_at_ms = ?5
            WHERE task_id = ?1
            ",
            params![
                task.id.as_str(),
                task.order_key.as_str(),
                task.status.as_str(),
                task.updated_at_ms,
                task.completed_at_ms.map(|v| v as i64)
            ],
        )?;
        updated.push(task);
    }

    tx.commit()?;
    Ok(updated)
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let repository_id = row.get::<_, Option<String>>(7)?.map(|raw| parse_uuid(7, raw)).transpose()?;
    let repository_name: Option<String> = row.get(11)?;
    let repository = match (repository_id, repository_name) {
        (Some(id), Some(name)) => Some(RepositoryRef { id: RepositoryId(id), name }),
        _ => None,
    };

    Ok(Task {
        id: TaskId(row.get(0)?),
        project_id: ProjectId(parse_uuid(1, row.get(1)?)?),
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get::<_, String>(4)?.parse().unwrap_or(Column::Todo),
        priority: u8::try_from(row.get::<_, i64>(5)?)
            .ok()
            .and_then(|value| Priority::new(value).ok())
            .unwrap_or_default(),
        order_key: OrderKey::from(row.get::<_, String>(6)?),
        repository_id: repository_id.map(RepositoryId),
        repository,
        created_at_ms: row.get::<_, i64>(8)? as u64,
        updated_at_ms: row.get::<_, i64>(9)? as u64,
        completed_at_ms: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
    })
}

fn parse_uuid(index: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicorn_protocol::ReorderEntry;

    fn setup() -> (Connection, Project) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let project = Project::new("board");
        insert_project(&conn, &project).unwrap();
        (conn, project)
    }

    #[test]
    fn tasks_round_trip_with_resolved_repository() {
        let (conn, project) = setup();
        let repository = Repository {
            id: RepositoryId::new(),
            project_id: project.id,
            name: "api".to_string(),
            created_at_ms: now_ms(),
        };
        insert_repository(&conn, &repository).unwrap();

        let mut task = Task::new(project.id, "wire it up");
        task.repository_id = Some(repository.id);
        insert_task(&conn, &task).unwrap();

        let bare = fetch_task(&conn, &task.id).unwrap().unwrap();
        assert_eq!(bare.repository, None);
        assert_eq!(bare.repository_id, Some(repository.id));

        let listed = query_tasks(&conn, project.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].repository,
            Some(RepositoryRef { id: repository.id, name: "api".to_string() })
        );
        assert!(repository_in_project(&conn, repository.id, project.id).unwrap());
    }

    #[test]
    fn update_leaves_order_key_alone_and_stamps_completion() {
        let (conn, project) = setup();
        let mut task = Task::new(project.id, "a");
        task.order_key = OrderKey::from("2500");
        insert_task(&conn, &task).unwrap();

        let patch = UpdateTaskRequest { status: Some(Column::Done), ..Default::default() };
        let updated = update_task(&conn, &task.id, &patch).unwrap();
        assert_eq!(updated.order_key.as_str(), "2500");
        assert!(updated.completed_at_ms.is_some());

        let patch = UpdateTaskRequest { status: Some(Column::Todo), ..Default::default() };
        let reopened = update_task(&conn, &task.id, &patch).unwrap();
        assert_eq!(reopened.completed_at_ms, None);
    }

    #[test]
    fn reorder_is_all_or_nothing() {
        let (mut conn, project) = setup();
        let task = Task::new(project.id, "a");
        insert_task(&conn, &task).unwrap();

        let request = ReorderRequest {
            project_id: project.id,
            tasks: vec![
                ReorderEntry { id: task.id.clone(), order_key: "1500".into(), status: Some(Column::Doing) },
                ReorderEntry { id: TaskId::from("missing"), order_key: "10".into(), status: None },
            ],
        };
        assert!(apply_reorder(&mut conn, &request).is_err());
        let unchanged = fetch_task(&conn, &task.id).unwrap().unwrap();
        assert_eq!(unchanged.order_key.as_str(), "1000");
        assert_eq!(unchanged.status, Column::Todo);

        let request = ReorderRequest {
            project_id: project.id,
            tasks: vec![ReorderEntry {
                id: task.id.clone(),
                order_key: "1500".into(),
                status: Some(Column::Doing),
            }],
        };
        let updated = apply_reorder(&mut conn, &request).unwrap();
        assert_eq!(updated[0].order_key.as_str(), "1500");
        assert_eq!(updated[0].status, Column::Doing);
    }

    #[test]
    fn reorder_rejects_foreign_tasks() {
        let (mut conn, project) = setup();
        let other = Project::new("other");
        insert_project(&conn, &other).unwrap();
        let task = Task::new(other.id, "theirs");
        insert_task(&conn, &task).unwrap();

        let request = ReorderRequest {
            project_id: project.id,
            tasks: vec![ReorderEntry { id: task.id.clone(), order_key: "1".into(), status: None }],
        };
        let err = apply_reorder(&mut conn, &request).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn delete_reports_owning_project() {
        let (conn, project) = setup();
        let task = Task::new(project.id, "a");
        insert_task(&conn, &task).unwrap();
        assert_eq!(delete_task(&conn, &task.id).unwrap(), Some(project.id));
        assert_eq!(delete_task(&conn, &task.id).unwrap(), None);
    }
}
