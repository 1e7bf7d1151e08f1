//! File-system checkpoint back-end.
//!
//! One file per checkpoint, named `<checkpoint_id>.json` (or `.json.gz` when
//! compression is on), inside a directory created lazily on first write.
//! Writes are durable via write-temp-then-rename; reads are atomic per file.
//! Distinct ids never target the same file, so concurrent independent
//! writers are safe; the number of in-flight writes is bounded by a
//! semaphore.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::sync::Semaphore;
use tracing::warn;
use uuid::Uuid;

use super::backend::{BackendError, CheckpointBackend};
use super::model::WorkflowCheckpoint;

const PLAIN_EXT: &str = "json";
const COMPRESSED_EXT: &str = "json.gz";

pub struct FileBackend {
    dir: PathBuf,
    compress: bool,
    write_permits: Arc<Semaphore>,
}

impl FileBackend {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, compress: bool, max_in_flight_writes: usize) -> Self {
        Self {
            dir: dir.into(),
            compress,
            write_permits: Arc::new(Semaphore::new(max_in_flight_writes.max(1))),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_id: &str, compressed: bool) -> PathBuf {
        let ext = if compressed { COMPRESSED_EXT } else { PLAIN_EXT };
        self.dir.join(format!("{checkpoint_id}.{ext}"))
    }

    fn encode(&self, checkpoint: &WorkflowCheckpoint) -> Result<Vec<u8>, BackendError> {
        let json = serde_json::to_vec(checkpoint).map_err(|e| BackendError::Io {
            message: format!("encode checkpoint record: {e}"),
        })?;
        if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            Ok(encoder.finish()?)
        } else {
            Ok(json)
        }
    }

    fn decode(
        checkpoint_id: &str,
        bytes: &[u8],
        compressed: bool,
    ) -> Result<WorkflowCheckpoint, BackendError> {
        let json = if compressed {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| BackendError::Corrupt {
                    checkpoint_id: checkpoint_id.to_string(),
                    message: format!("gzip stream: {e}"),
                })?;
            out
        } else {
            bytes.to_vec()
        };
        serde_json::from_slice(&json).map_err(|e| BackendError::Corrupt {
            checkpoint_id: checkpoint_id.to_string(),
            message: e.to_string(),
        })
    }

    /// Locate an existing file for the id, trying the configured extension
    /// first so toggling compression keeps old checkpoints readable.
    async fn existing_path(&self, checkpoint_id: &str) -> Option<(PathBuf, bool)> {
        for compressed in [self.compress, !self.compress] {
            let path = self.path_for(checkpoint_id, compressed);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some((path, compressed));
            }
        }
        None
    }

    fn id_from_file_name(name: &str) -> Option<(&str, bool)> {
        if let Some(id) = name.strip_suffix(".json.gz") {
            Some((id, true))
        } else {
            name.strip_suffix(".json").map(|id| (id, false))
        }
    }
}

#[async_trait]
impl CheckpointBackend for FileBackend {
    async fn put(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), BackendError> {
        let _permit = self
            .write_permits
            .acquire()
            .await
            .map_err(|_| BackendError::Io {
                message: "write semaphore closed".to_string(),
            })?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let bytes = self.encode(checkpoint)?;
        let final_path = self.path_for(&checkpoint.checkpoint_id, self.compress);
        let tmp_path = self.dir.join(format!(
            ".{}.tmp-{}",
            checkpoint.checkpoint_id,
            &Uuid::new_v4().simple().to_string()[..8]
        ));
        tokio::fs::write(&tmp_path, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, BackendError> {
        let Some((path, compressed)) = self.existing_path(checkpoint_id).await else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;
        Self::decode(checkpoint_id, &bytes, compressed).map(Some)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError> {
        match self.existing_path(checkpoint_id).await {
            Some((path, _)) => {
                tokio::fs::remove_file(&path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self) -> Result<Vec<WorkflowCheckpoint>, BackendError> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((id, compressed)) = Self::id_from_file_name(name) else {
                continue;
            };
            let bytes = tokio::fs::read(entry.path()).await?;
            match Self::decode(id, &bytes, compressed) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(checkpoint_id = id, error = %err, "skipping unreadable checkpoint file");
                }
            }
        }
        Ok(checkpoints)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::model::CheckpointMetadata;
    use chrono::Utc;

    fn checkpoint(id: &str) -> WorkflowCheckpoint {
        WorkflowCheckpoint {
            checkpoint_id: id.to_string(),
            workflow_id: "wf_a".to_string(),
            workflow_type: "research".to_string(),
            created_at: Utc::now(),
            agent_id: None,
            stage_index: 1,
            snapshot: "{\"workflow_id\":\"wf_a\"}".to_string(),
            schema_version: 1,
            state_size_bytes: 23,
            label: Some("manual".to_string()),
            metadata: CheckpointMetadata::automated("after-clarify", vec!["clarify".into()]),
        }
    }

    #[tokio::test]
    async fn round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), false, 4);
        let original = checkpoint("ckpt_file_1");
        backend.put(&original).await.unwrap();
        let loaded = backend.get("ckpt_file_1").await.unwrap().unwrap();
        assert_eq!(original, loaded);
    }

    #[tokio::test]
    async fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), true, 4);
        let original = checkpoint("ckpt_gz_1");
        backend.put(&original).await.unwrap();
        assert!(dir.path().join("ckpt_gz_1.json.gz").exists());
        let loaded = backend.get("ckpt_gz_1").await.unwrap().unwrap();
        assert_eq!(original, loaded);
    }

    #[tokio::test]
    async fn directory_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/checkpoints");
        let backend = FileBackend::new(&nested, false, 4);
        assert!(!nested.exists());
        backend.put(&checkpoint("ckpt_lazy")).await.unwrap();
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn missing_id_reads_as_none_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), false, 4);
        assert!(backend.get("ckpt_absent").await.unwrap().is_none());
        assert!(!backend.delete("ckpt_absent").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_reports_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), false, 4);
        backend.put(&checkpoint("ckpt_bad")).await.unwrap();
        std::fs::write(
            dir.path().join("ckpt_bad.json"),
            "{ invalid json content without closing",
        )
        .unwrap();
        let err = backend.get("ckpt_bad").await.unwrap_err();
        assert!(err.to_string().contains("not valid JSON"), "{err}");
    }

    #[tokio::test]
    async fn scan_skips_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), false, 4);
        backend.put(&checkpoint("ckpt_ok")).await.unwrap();
        std::fs::write(dir.path().join("ckpt_junk.json"), "not json").unwrap();
        let scanned = backend.scan().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].checkpoint_id, "ckpt_ok");
    }
}
