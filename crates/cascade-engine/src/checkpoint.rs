use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use cascade_core::types::WorkflowStatus;

use crate::workflow::WorkflowExecution;

/// Listing entry for a stored checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub workflow_id: String,
    pub status: String,
    pub progress: String,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Latest workflow snapshot per workflow, backed by SQLite.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create checkpoint directory: {}", e))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open checkpoint store: {}", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                 workflow_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 progress TEXT NOT NULL,
                 description TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| format!("Failed to initialize checkpoint schema: {}", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save the latest snapshot of a workflow, replacing any earlier one.
    pub fn save(&self, wf: &WorkflowExecution) -> Result<(), String> {
        let json = serde_json::to_string(wf)
            .map_err(|e| format!("Failed to serialize workflow: {}", e))?;
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO workflow_checkpoints (workflow_id, status, progress, description, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(workflow_id) DO UPDATE SET
                 status = excluded.status,
                 progress = excluded.progress,
                 description = excluded.description,
                 snapshot_json = excluded.snapshot_json,
                 updated_at = excluded.updated_at",
            params![
                wf.id.0,
                wf.status.as_str(),
                wf.progress(),
                wf.task.description,
                json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| format!("Failed to save checkpoint: {}", e))?;
        Ok(())
    }

    pub fn load(&self, workflow_id: &str) -> Result<Option<WorkflowExecution>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM workflow_checkpoints WHERE workflow_id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .ok();

        match json {
            Some(j) => serde_json::from_str(&j)
                .map(Some)
                .map_err(|e| format!("Failed to deserialize checkpoint: {}", e)),
            None => Ok(None),
        }
    }

    /// All stored checkpoints, most recently updated first.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT workflow_id, status, progress, description, updated_at
                 FROM workflow_checkpoints
                 ORDER BY updated_at DESC",
            )
            .map_err(|e| format!("Failed to prepare query: {}", e))?;

        let rows = stmt
            .query_map([], |row| {
                let ts: String = row.get(4)?;
                Ok(CheckpointInfo {
                    workflow_id: row.get(0)?,
                    status: row.get(1)?,
                    progress: row.get(2)?,
                    description: row.get(3)?,
                    updated_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| format!("Failed to list checkpoints: {}", e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read checkpoint row: {}", e))
    }

    /// Checkpoints of workflows that can still be resumed.
    pub fn list_resumable(&self) -> Result<Vec<CheckpointInfo>, String> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| {
                c.status
                    .parse::<WorkflowStatus>()
                    .map(|s| !s.is_terminal())
                    .unwrap_or(false)
            })
            .collect())
    }

    pub fn delete(&self, workflow_id: &str) -> Result<usize, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "DELETE FROM workflow_checkpoints WHERE workflow_id = ?1",
            params![workflow_id],
        )
        .map_err(|e| format!("Failed to delete checkpoint: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::types::TaskSpec;

    fn temp_store() -> CheckpointStore {
        let dir =
            std::env::temp_dir().join(format!("cascade_checkpoint_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        CheckpointStore::open(&dir.join("checkpoints.db")).unwrap()
    }

    fn workflow() -> WorkflowExecution {
        WorkflowExecution::new(
            TaskSpec::new("Build a CSV parser"),
            vec!["planner".into(), "coder".into()],
        )
    }

    #[test]
    fn test_save_and_load() {
        let store = temp_store();
        let wf = workflow();
        store.save(&wf).unwrap();

        let loaded = store.load(&wf.id.0).unwrap().unwrap();
        assert_eq!(loaded.id, wf.id);
        assert_eq!(loaded.roles, wf.roles);
        assert_eq!(loaded.task.description, "Build a CSV parser");
    }

    #[test]
    fn test_save_upserts() {
        let store = temp_store();
        let mut wf = workflow();
        store.save(&wf).unwrap();
        wf.current_role_index = 1;
        wf.status = WorkflowStatus::Paused;
        store.save(&wf).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, "paused");
        assert_eq!(list[0].progress, "1/2");
        assert_eq!(store.load(&wf.id.0).unwrap().unwrap().current_role_index, 1);
    }

    #[test]
    fn test_list_resumable_and_delete() {
        let store = temp_store();
        let paused = {
            let mut wf = workflow();
            wf.status = WorkflowStatus::Paused;
            wf
        };
        let done = {
            let mut wf = workflow();
            wf.status = WorkflowStatus::Completed;
            wf
        };
        store.save(&paused).unwrap();
        store.save(&done).unwrap();

        let resumable = store.list_resumable().unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].workflow_id, paused.id.0);

        assert_eq!(store.delete(&paused.id.0).unwrap(), 1);
        assert!(store.load(&paused.id.0).unwrap().is_none());
    }
}
