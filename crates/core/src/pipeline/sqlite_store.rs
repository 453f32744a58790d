//! SQLite-backed pipeline state store.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};

use super::{PipelineError, PipelineState, PipelineStateStore};
use crate::task::AdapterSpec;

/// Keeps the pipeline state in a single-row table.
pub struct SqlitePipelineStore {
    conn: Mutex<Connection>,
}

impl SqlitePipelineStore {
    pub fn new(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path).map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, PipelineError> {
        let conn =
            Connection::open_in_memory().map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PipelineError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                checkpoint TEXT,
                adapters TEXT NOT NULL,
                last_task_id TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| PipelineError::Persistence(e.to_string()))
    }
}

impl PipelineStateStore for SqlitePipelineStore {
    fn load(&self) -> Result<Option<PipelineState>, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let result = conn.query_row(
            "SELECT checkpoint, adapters, last_task_id FROM pipeline_state WHERE id = 1",
            [],
            |row| {
                let checkpoint: Option<String> = row.get(0)?;
                let adapters_json: String = row.get(1)?;
                let last_task_id: Option<String> = row.get(2)?;
                Ok((checkpoint, adapters_json, last_task_id))
            },
        );

        match result {
            Ok((checkpoint, adapters_json, last_task_id)) => {
                let adapters: Vec<AdapterSpec> = serde_json::from_str(&adapters_json)
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?;
                Ok(Some(PipelineState {
                    checkpoint,
                    adapters,
                    last_task_id,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PipelineError::Persistence(e.to_string())),
        }
    }

    fn save(&self, state: &PipelineState) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();

        let adapters_json = serde_json::to_string(&state.adapters)
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;

        conn.execute(
            "INSERT INTO pipeline_state (id, checkpoint, adapters, last_task_id, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                checkpoint = excluded.checkpoint,
                adapters = excluded.adapters,
                last_task_id = excluded.last_task_id,
                updated_at = excluded.updated_at",
            params![
                state.checkpoint,
                adapters_json,
                state.last_task_id,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| PipelineError::Persistence(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_has_no_state() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_single_row() {
        let store = SqlitePipelineStore::in_memory().unwrap();

        let first = PipelineState {
            checkpoint: Some("A".to_string()),
            adapters: vec![AdapterSpec::new("L1", 0.8)],
            last_task_id: Some("T1".to_string()),
        };
        store.save(&first).unwrap();

        let second = PipelineState {
            checkpoint: Some("B".to_string()),
            adapters: vec![],
            last_task_id: Some("T2".to_string()),
        };
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap(), Some(second));
        let conn = store.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pipeline_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
