/*!
SQLite-backed primary checkpoint back-end.

This is the "networked" primary store of the engine: an opaque key/value
table keyed by checkpoint id, shareable across processes pointing at the
same database. The record body is stored as JSON text; the back-end knows
nothing about snapshots, retention, or fallback.

Any sqlx failure surfaces as [`BackendError::Transport`], which is what
triggers the store's transparent fallback to the file back-end.
*/

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::backend::{BackendError, CheckpointBackend};
use super::model::WorkflowCheckpoint;

pub struct SqliteBackend {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish()
    }
}

impl SqliteBackend {
    /// Connect (or create) the database at `database_url` and ensure the
    /// checkpoint table exists. Example URL: `sqlite://wayfarer.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        // Ensure the underlying sqlite file exists before connecting.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| BackendError::Transport {
                message: format!("connect {database_url}: {e}"),
            })?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                workflow_id   TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                body          TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(transport)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow ON checkpoints (workflow_id)",
        )
        .execute(&pool)
        .await
        .map_err(transport)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn transport(err: sqlx::Error) -> BackendError {
    BackendError::Transport {
        message: err.to_string(),
    }
}

#[async_trait]
impl CheckpointBackend for SqliteBackend {
    async fn put(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), BackendError> {
        let body = serde_json::to_string(checkpoint).map_err(|e| BackendError::Transport {
            message: format!("encode checkpoint record: {e}"),
        })?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (checkpoint_id, workflow_id, created_at, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (checkpoint_id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                created_at = excluded.created_at,
                body = excluded.body
            "#,
        )
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.workflow_id)
        .bind(checkpoint.created_at.to_rfc3339())
        .bind(&body)
        .execute(&*self.pool)
        .await
        .map_err(transport)?;
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, BackendError> {
        let row = sqlx::query("SELECT body FROM checkpoints WHERE checkpoint_id = ?1")
            .bind(checkpoint_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(transport)?;
        let Some(row) = row else { return Ok(None) };
        let body: String = row.try_get("body").map_err(transport)?;
        serde_json::from_str(&body).map(Some).map_err(|e| {
            BackendError::Corrupt {
                checkpoint_id: checkpoint_id.to_string(),
                message: e.to_string(),
            }
        })
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?1")
            .bind(checkpoint_id)
            .execute(&*self.pool)
            .await
            .map_err(transport)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(&self) -> Result<Vec<WorkflowCheckpoint>, BackendError> {
        let rows = sqlx::query("SELECT checkpoint_id, body FROM checkpoints")
            .fetch_all(&*self.pool)
            .await
            .map_err(transport)?;
        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("checkpoint_id").map_err(transport)?;
            let body: String = row.try_get("body").map_err(transport)?;
            match serde_json::from_str(&body) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    tracing::warn!(checkpoint_id = %id, error = %err, "skipping unreadable checkpoint row");
                }
            }
        }
        Ok(checkpoints)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::model::CheckpointMetadata;
    use chrono::Utc;

    fn checkpoint(id: &str, workflow_id: &str) -> WorkflowCheckpoint {
        WorkflowCheckpoint {
            checkpoint_id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: "research".to_string(),
            created_at: Utc::now(),
            agent_id: Some("brief".to_string()),
            stage_index: 1,
            snapshot: "{\"workflow_id\":\"wf_a\"}".to_string(),
            schema_version: 1,
            state_size_bytes: 23,
            label: None,
            metadata: CheckpointMetadata::automated("after-brief", vec!["clarify".into()]),
        }
    }

    #[tokio::test]
    async fn round_trip_through_sqlite() {
        let backend = SqliteBackend::connect("sqlite://:memory:").await.unwrap();
        let original = checkpoint("ckpt_sql_1", "wf_a");
        backend.put(&original).await.unwrap();
        let loaded = backend.get("ckpt_sql_1").await.unwrap().unwrap();
        assert_eq!(original, loaded);
    }

    #[tokio::test]
    async fn put_replaces_existing_record() {
        let backend = SqliteBackend::connect("sqlite://:memory:").await.unwrap();
        let mut cp = checkpoint("ckpt_sql_2", "wf_a");
        backend.put(&cp).await.unwrap();
        cp.stage_index = 2;
        backend.put(&cp).await.unwrap();
        let loaded = backend.get("ckpt_sql_2").await.unwrap().unwrap();
        assert_eq!(loaded.stage_index, 2);
        assert_eq!(backend.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = SqliteBackend::connect("sqlite://:memory:").await.unwrap();
        backend.put(&checkpoint("ckpt_sql_3", "wf_b")).await.unwrap();
        assert!(backend.delete("ckpt_sql_3").await.unwrap());
        assert!(!backend.delete("ckpt_sql_3").await.unwrap());
    }
}
