//! SQLite-backed download store implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{DownloadStatus, DownloadStore, DownloadStoreError, DownloadTask, SourceDescriptor};

const DOWNLOAD_COLUMNS: &str = "id, status, source, total_bytes, downloaded_bytes, resume_offset, retry_count, max_retries, error, file_path, sha256, created_at, updated_at, started_at, completed_at";

const TERMINAL_FILTER: &str = "status IN ('completed', 'failed', 'cancelled')";

/// SQLite-backed download store.
pub struct SqliteDownloadStore {
    conn: Mutex<Connection>,
}

impl SqliteDownloadStore {
    /// Open (or create) the download store at the given path.
    pub fn new(path: &Path) -> Result<Self, DownloadStoreError> {
        let conn = Connection::open(path).map_err(|e| DownloadStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, DownloadStoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DownloadStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), DownloadStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS download_tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                total_bytes INTEGER,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                resume_offset INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                error TEXT,
                file_path TEXT,
                sha256 TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                CHECK (resume_offset <= downloaded_bytes)
            );

            CREATE INDEX IF NOT EXISTS idx_download_tasks_status ON download_tasks(status);
            "#,
        )
        .map_err(|e| DownloadStoreError::Database(e.to_string()))
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default()
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<DownloadTask> {
        let status_str: String = row.get(1)?;
        let source_json: String = row.get(2)?;
        let total_bytes: Option<i64> = row.get(3)?;
        let downloaded_bytes: i64 = row.get(4)?;
        let resume_offset: i64 = row.get(5)?;
        let retry_count: i64 = row.get(6)?;
        let max_retries: i64 = row.get(7)?;
        let file_path: Option<String> = row.get(9)?;
        let created_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;
        let started_at: Option<String> = row.get(13)?;
        let completed_at: Option<String> = row.get(14)?;

        let source: SourceDescriptor = serde_json::from_str(&source_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(DownloadTask {
            id: row.get(0)?,
            status: DownloadStatus::parse(&status_str).unwrap_or(DownloadStatus::Failed),
            source,
            total_bytes: total_bytes.map(|v| v as u64),
            downloaded_bytes: downloaded_bytes as u64,
            resume_offset: resume_offset as u64,
            retry_count: retry_count as u32,
            max_retries: max_retries as u32,
            error: row.get(8)?,
            file_path: file_path.map(PathBuf::from),
            sha256: row.get(10)?,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
            started_at: started_at.as_deref().map(Self::parse_time),
            completed_at: completed_at.as_deref().map(Self::parse_time),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<DownloadTask>, DownloadStoreError> {
        let result = conn.query_row(
            &format!("SELECT {} FROM download_tasks WHERE id = ?", DOWNLOAD_COLUMNS),
            params![id],
            Self::row_to_task,
        );

        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DownloadStoreError::Database(e.to_string())),
        }
    }

    /// Run an INSERT-style statement whose placeholders follow
    /// `DOWNLOAD_COLUMNS`.
    fn write(conn: &Connection, sql: &str, task: &DownloadTask) -> rusqlite::Result<usize> {
        let source_json = serde_json::to_string(&task.source)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        conn.execute(
            sql,
            params![
                task.id,
                task.status.as_str(),
                source_json,
                task.total_bytes.map(|v| v as i64),
                task.downloaded_bytes as i64,
                task.resume_offset as i64,
                task.retry_count as i64,
                task.max_retries as i64,
                task.error,
                task.file_path.as_ref().map(|p| p.display().to_string()),
                task.sha256,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
    }
}

impl DownloadStore for SqliteDownloadStore {
    fn insert(&self, task: &DownloadTask) -> Result<(), DownloadStoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "INSERT INTO download_tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DOWNLOAD_COLUMNS
        );

        match Self::write(&conn, &sql, task) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && Self::fetch(&conn, &task.id)?.is_some() =>
            {
                Err(DownloadStoreError::AlreadyExists(task.id.clone()))
            }
            Err(e) => Err(DownloadStoreError::Database(e.to_string())),
        }
    }

    fn get(&self, id: &str) -> Result<Option<DownloadTask>, DownloadStoreError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, id)
    }

    fn list(&self, status: Option<DownloadStatus>) -> Result<Vec<DownloadTask>, DownloadStoreError> {
        let conn = self.conn.lock().unwrap();

        let (sql, status_param) = match status {
            Some(s) => (
                format!(
                    "SELECT {} FROM download_tasks WHERE status = ? ORDER BY created_at ASC",
                    DOWNLOAD_COLUMNS
                ),
                Some(s.as_str()),
            ),
            None => (
                format!(
                    "SELECT {} FROM download_tasks ORDER BY created_at ASC",
                    DOWNLOAD_COLUMNS
                ),
                None,
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| DownloadStoreError::Database(e.to_string()))?;

        let rows = match status_param {
            Some(s) => stmt.query_map(params![s], Self::row_to_task),
            None => stmt.query_map([], Self::row_to_task),
        }
        .map_err(|e| DownloadStoreError::Database(e.to_string()))?;

        let mut tasks = Vec::new();
        for row_result in rows {
            tasks.push(row_result.map_err(|e| DownloadStoreError::Database(e.to_string()))?);
        }
        Ok(tasks)
    }

    fn update(&self, task: &DownloadTask) -> Result<(), DownloadStoreError> {
        let conn = self.conn.lock().unwrap();
        // Same placeholder order as DOWNLOAD_COLUMNS; ?1 is the id
        let changed = Self::write(
            &conn,
            "UPDATE download_tasks SET status = ?2, source = ?3, total_bytes = ?4, downloaded_bytes = ?5, \
             resume_offset = ?6, retry_count = ?7, max_retries = ?8, error = ?9, file_path = ?10, \
             sha256 = ?11, created_at = ?12, updated_at = ?13, started_at = ?14, completed_at = ?15 \
             WHERE id = ?1",
            task,
        )
        .map_err(|e| DownloadStoreError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(DownloadStoreError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    fn replace(&self, task: &DownloadTask) -> Result<(), DownloadStoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "INSERT OR REPLACE INTO download_tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DOWNLOAD_COLUMNS
        );
        Self::write(&conn, &sql, task).map_err(|e| DownloadStoreError::Database(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, DownloadStoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute("DELETE FROM download_tasks WHERE id = ?", params![id])
            .map_err(|e| DownloadStoreError::Database(e.to_string()))?;
        Ok(changed > 0)
    }

    fn delete_terminal(&self) -> Result<Vec<DownloadTask>, DownloadStoreError> {
        let conn = self.conn.lock().unwrap();

        let removed = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM download_tasks WHERE {}",
                    DOWNLOAD_COLUMNS, TERMINAL_FILTER
                ))
                .map_err(|e| DownloadStoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], Self::row_to_task)
                .map_err(|e| DownloadStoreError::Database(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| DownloadStoreError::Database(e.to_string()))?
        };

        conn.execute(
            &format!("DELETE FROM download_tasks WHERE {}", TERMINAL_FILTER),
            [],
        )
        .map_err(|e| DownloadStoreError::Database(e.to_string()))?;

        Ok(removed)
    }
}
