//! SQLite-backed task store implementation.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{AdapterMode, AdapterSpec, Task, TaskStatus, TaskStore, TaskStoreError};

const TASK_COLUMNS: &str = "id, status, checkpoint, adapters, adapter_mode, params, result, error, created_at, promoted_at, started_at, completed_at";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the task store at the given path.
    pub fn new(path: &Path) -> Result<Self, TaskStoreError> {
        let conn = Connection::open(path).map_err(|e| TaskStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, TaskStoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| TaskStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), TaskStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                adapters TEXT NOT NULL,
                adapter_mode TEXT NOT NULL DEFAULT 'replace',
                params TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                promoted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
            "#,
        )
        .map_err(|e| TaskStoreError::Database(e.to_string()))
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default()
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let status_str: String = row.get(1)?;
        let adapters_json: String = row.get(3)?;
        let mode_str: String = row.get(4)?;
        let params_json: String = row.get(5)?;
        let result_json: Option<String> = row.get(6)?;
        let created_at: String = row.get(8)?;
        let promoted_at: String = row.get(9)?;
        let started_at: Option<String> = row.get(10)?;
        let completed_at: Option<String> = row.get(11)?;

        let adapters: Vec<AdapterSpec> = serde_json::from_str(&adapters_json).unwrap_or_default();
        let params = serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null);
        let result = result_json.and_then(|json| serde_json::from_str(&json).ok());

        Ok(Task {
            id: row.get(0)?,
            // Unknown values only appear if the file was edited by hand
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
            checkpoint: row.get(2)?,
            adapters,
            adapter_mode: AdapterMode::parse(&mode_str).unwrap_or_default(),
            params,
            result,
            error: row.get(7)?,
            created_at: Self::parse_time(&created_at),
            promoted_at: Self::parse_time(&promoted_at),
            started_at: started_at.as_deref().map(Self::parse_time),
            completed_at: completed_at.as_deref().map(Self::parse_time),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Task>, TaskStoreError> {
        let result = conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        );

        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(TaskStoreError::Database(e.to_string())),
        }
    }

    /// Apply a status-guarded UPDATE and return the updated row.
    ///
    /// `sql` must end with `WHERE id = ? AND status = ?`; the id and the
    /// expected status are appended to `values`.
    fn transition(
        &self,
        id: &str,
        expected: TaskStatus,
        operation: &str,
        sql: &str,
        values: Vec<Box<dyn rusqlite::ToSql>>,
    ) -> Result<Task, TaskStoreError> {
        let conn = self.conn.lock().unwrap();

        let mut all_params = values;
        all_params.push(Box::new(id.to_string()));
        all_params.push(Box::new(expected.as_str()));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let changed = conn
            .execute(sql, param_refs.as_slice())
            .map_err(|e| TaskStoreError::Database(e.to_string()))?;

        let task = Self::fetch(&conn, id)?.ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
        if changed == 0 {
            return Err(TaskStoreError::InvalidState {
                task_id: id.to_string(),
                status: task.status,
                operation: operation.to_string(),
            });
        }
        Ok(task)
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert(&self, task: &Task) -> Result<(), TaskStoreError> {
        let conn = self.conn.lock().unwrap();

        let adapters_json = serde_json::to_string(&task.adapters)
            .map_err(|e| TaskStoreError::Database(e.to_string()))?;
        let params_json = serde_json::to_string(&task.params)
            .map_err(|e| TaskStoreError::Database(e.to_string()))?;
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| TaskStoreError::Database(e.to_string()))?;

        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.status.as_str(),
                task.checkpoint,
                adapters_json,
                task.adapter_mode.as_str(),
                params_json,
                result_json,
                task.error,
                task.created_at.to_rfc3339(),
                task.promoted_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| TaskStoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Task>, TaskStoreError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, id)
    }

    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskStoreError> {
        let conn = self.conn.lock().unwrap();

        let (sql, status_param) = match status {
            Some(s) => (
                format!(
                    "SELECT {} FROM tasks WHERE status = ? ORDER BY created_at ASC",
                    TASK_COLUMNS
                ),
                Some(s.as_str()),
            ),
            None => (
                format!("SELECT {} FROM tasks ORDER BY created_at ASC", TASK_COLUMNS),
                None,
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TaskStoreError::Database(e.to_string()))?;

        let rows = match status_param {
            Some(s) => stmt.query_map(params![s], Self::row_to_task),
            None => stmt.query_map([], Self::row_to_task),
        }
        .map_err(|e| TaskStoreError::Database(e.to_string()))?;

        let mut tasks = Vec::new();
        for row_result in rows {
            tasks.push(row_result.map_err(|e| TaskStoreError::Database(e.to_string()))?);
        }
        Ok(tasks)
    }

    fn mark_running(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        self.transition(
            id,
            TaskStatus::Pending,
            "start",
            "UPDATE tasks SET status = 'running', started_at = ? WHERE id = ? AND status = ?",
            vec![Box::new(at.to_rfc3339())],
        )
    }

    fn mark_completed(
        &self,
        id: &str,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let result_json =
            serde_json::to_string(result).map_err(|e| TaskStoreError::Database(e.to_string()))?;
        self.transition(
            id,
            TaskStatus::Running,
            "complete",
            "UPDATE tasks SET status = 'completed', result = ?, completed_at = ? WHERE id = ? AND status = ?",
            vec![Box::new(result_json), Box::new(at.to_rfc3339())],
        )
    }

    fn mark_failed(
        &self,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.transition(
            id,
            TaskStatus::Running,
            "fail",
            "UPDATE tasks SET status = 'failed', error = ?, completed_at = ? WHERE id = ? AND status = ?",
            vec![Box::new(error.to_string()), Box::new(at.to_rfc3339())],
        )
    }

    fn mark_cancelled(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        self.transition(
            id,
            TaskStatus::Pending,
            "cancel",
            "UPDATE tasks SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = ?",
            vec![Box::new(at.to_rfc3339())],
        )
    }

    fn set_promoted_at(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        self.transition(
            id,
            TaskStatus::Pending,
            "promote",
            "UPDATE tasks SET promoted_at = ? WHERE id = ? AND status = ?",
            vec![Box::new(at.to_rfc3339())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::GenerationRequest;

    fn create_test_store() -> SqliteTaskStore {
        SqliteTaskStore::in_memory().unwrap()
    }

    fn create_test_task(checkpoint: &str) -> Task {
        let request = GenerationRequest::new(checkpoint)
            .with_adapter("L1", 0.75)
            .with_params(serde_json::json!({"prompt": "a lighthouse", "steps": 20}));
        Task::from_request(request, Utc::now())
    }

    #[test]
    fn test_insert_and_get() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();

        let fetched = store.get(&task.id).unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();

        let running = store.mark_running(&task.id, Utc::now()).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = store
            .mark_completed(&task.id, &serde_json::json!({"images": 1}), Utc::now())
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"images": 1})));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_terminal_task_cannot_change() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();
        store.mark_cancelled(&task.id, Utc::now()).unwrap();

        let err = store.mark_running(&task.id, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::InvalidState {
                status: TaskStatus::Cancelled,
                ..
            }
        ));
        let err = store.set_promoted_at(&task.id, Utc::now()).unwrap_err();
        assert!(matches!(err, TaskStoreError::InvalidState { .. }));
        assert_eq!(
            store.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_running_task_cannot_be_cancelled() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();
        store.mark_running(&task.id, Utc::now()).unwrap();

        let err = store.mark_cancelled(&task.id, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::InvalidState {
                status: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_transition_on_missing_task() {
        let store = create_test_store();
        let err = store.mark_cancelled("nope", Utc::now()).unwrap_err();
        assert_eq!(err, TaskStoreError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_mark_failed_records_error() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();
        store.mark_running(&task.id, Utc::now()).unwrap();

        let failed = store
            .mark_failed(&task.id, "checkpoint A not found", Utc::now())
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("checkpoint A not found"));
    }

    #[test]
    fn test_promotion_persists() {
        let store = create_test_store();
        let task = create_test_task("A");
        store.insert(&task).unwrap();

        let at = Utc::now();
        let promoted = store.set_promoted_at(&task.id, at).unwrap();
        assert_eq!(promoted.promoted_at, at);
    }

    #[test]
    fn test_list_filters_by_status() {
        let store = create_test_store();
        let first = create_test_task("A");
        let second = create_test_task("B");
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();
        store.mark_cancelled(&second.id, Utc::now()).unwrap();

        let pending = store.list(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(store.list(None).unwrap().len(), 2);
    }

    #[test]
    fn test_file_backed_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let task = create_test_task("A");
        {
            let store = SqliteTaskStore::new(&path).unwrap();
            store.insert(&task).unwrap();
        }
        let store = SqliteTaskStore::new(&path).unwrap();
        assert_eq!(store.get(&task.id).unwrap().unwrap().checkpoint, "A");
    }
}
