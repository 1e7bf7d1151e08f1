//! The checkpoint store.
//!
//! Policy lives here, back-ends stay dumb: the store enforces the snapshot
//! size cap, id uniqueness, per-workflow `created_at` monotonicity, retention,
//! and the primary→file fallback contract. Every observable operation emits a
//! checkpoint event through the observer hub; event emission never fails a
//! store call.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::config::{EngineConfig, StorageBackendKind};
use crate::observers::{CheckpointEvent, CheckpointEventKind, ObserverHub};
use crate::utils::IdGenerator;

use super::backend::{BackendError, CheckpointBackend};
use super::file_backend::FileBackend;
use super::model::{
    CheckpointMetadata, CheckpointStatistics, SNAPSHOT_SCHEMA_VERSION, WorkflowCheckpoint,
};
use super::snapshot::SnapshotError;

/// How many times `save` regenerates an id on collision before giving up.
const ID_COLLISION_RETRIES: usize = 4;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// Snapshot above the configured cap; nothing was written.
    #[error("checkpoint snapshot is {size} bytes, over the {limit}-byte cap")]
    #[diagnostic(
        code(wayfarer::store::size_exceeded),
        help("Raise max_checkpoint_size_bytes or trim the workflow's message log.")
    )]
    SizeExceeded { size: u64, limit: u64 },

    /// Every configured back-end refused the write.
    #[error("checkpoint storage failed: {message}")]
    #[diagnostic(code(wayfarer::store::storage))]
    Storage { message: String },

    #[error(transparent)]
    #[diagnostic(code(wayfarer::store::backend))]
    Backend(#[from] BackendError),

    #[error(transparent)]
    #[diagnostic(code(wayfarer::store::snapshot))]
    Snapshot(#[from] SnapshotError),
}

/// Everything `save` needs besides what it assigns itself (id, timestamps,
/// size).
#[derive(Clone, Debug)]
pub struct SaveRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub agent_id: Option<String>,
    pub stage_index: usize,
    /// Serialized workflow record.
    pub snapshot: String,
    pub label: Option<String>,
    pub metadata: CheckpointMetadata,
}

pub struct CheckpointStore {
    primary: Option<Arc<dyn CheckpointBackend>>,
    files: Arc<FileBackend>,
    mode: StorageBackendKind,
    max_size_bytes: u64,
    retention: usize,
    ids: IdGenerator,
    hub: Arc<ObserverHub>,
    /// Per-workflow high-water mark keeping (workflow_id, created_at)
    /// strictly increasing.
    last_created: Mutex<FxHashMap<String, DateTime<Utc>>>,
}

impl CheckpointStore {
    /// Build a store from config. In fallback mode without a usable primary
    /// back-end, the store degrades to file-only with a warning.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        primary: Option<Arc<dyn CheckpointBackend>>,
        hub: Arc<ObserverHub>,
    ) -> Self {
        let files = Arc::new(FileBackend::new(
            config.local_storage_directory.clone(),
            config.compress_snapshots,
            config.max_in_flight_checkpoint_writes,
        ));
        let mode = match (config.storage_backend, primary.is_some()) {
            (StorageBackendKind::PrimaryWithFileFallback, true) => {
                StorageBackendKind::PrimaryWithFileFallback
            }
            (StorageBackendKind::PrimaryWithFileFallback, false) => {
                warn!("no primary checkpoint backend available; using file backend only");
                StorageBackendKind::File
            }
            (StorageBackendKind::File, _) => StorageBackendKind::File,
        };
        Self {
            primary: if mode == StorageBackendKind::File {
                None
            } else {
                primary
            },
            files,
            mode,
            max_size_bytes: config.max_checkpoint_size_bytes,
            retention: config.max_checkpoints_per_workflow,
            ids: IdGenerator::new(),
            hub,
            last_created: Mutex::new(FxHashMap::default()),
        }
    }

    /// File-only store; the usual choice in tests.
    #[must_use]
    pub fn file_only(config: &EngineConfig, hub: Arc<ObserverHub>) -> Self {
        let mut config = config.clone();
        config.storage_backend = StorageBackendKind::File;
        Self::new(&config, None, hub)
    }

    /// Assign an id and UTC creation time, enforce the size cap, and write
    /// durably. In fallback mode a primary failure logs a warning and falls
    /// back to the file back-end; only when both fail does this return
    /// [`StoreError::Storage`].
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, reason = %request.metadata.reason))]
    pub async fn save(&self, request: SaveRequest) -> Result<WorkflowCheckpoint, StoreError> {
        let size = request.snapshot.len() as u64;
        if size > self.max_size_bytes {
            return Err(StoreError::SizeExceeded {
                size,
                limit: self.max_size_bytes,
            });
        }

        let created_at = self.monotonic_created_at(&request.workflow_id);
        let checkpoint_id = self.fresh_checkpoint_id().await?;
        let checkpoint = WorkflowCheckpoint {
            checkpoint_id,
            workflow_id: request.workflow_id,
            workflow_type: request.workflow_type,
            created_at,
            agent_id: request.agent_id,
            stage_index: request.stage_index,
            snapshot: request.snapshot,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            state_size_bytes: size,
            label: request.label,
            metadata: request.metadata,
        };

        let write_started = Instant::now();
        self.write(&checkpoint).await?;

        if self.retention > 0 {
            self.enforce_retention(&checkpoint.workflow_id).await;
        }

        let write_ms = write_started.elapsed().as_secs_f64() * 1000.0;
        self.hub.checkpoints.notify(
            &CheckpointEvent::new(
                &checkpoint.checkpoint_id,
                &checkpoint.workflow_id,
                CheckpointEventKind::Created,
            )
            .with_workflow_type(&checkpoint.workflow_type)
            .with_size(size)
            .with_automated(checkpoint.metadata.automated)
            .with_reason(&checkpoint.metadata.reason)
            .with_latency_ms(write_ms),
        );
        tracing::debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            size_bytes = size,
            write_ms,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Fetch a checkpoint, or `None` when absent. Corrupt records surface as
    /// errors and emit a `Failed` event.
    pub async fn load(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        let read_started = Instant::now();
        match self.read(checkpoint_id).await {
            Ok(Some(checkpoint)) => {
                self.hub.checkpoints.notify(
                    &CheckpointEvent::new(
                        checkpoint_id,
                        &checkpoint.workflow_id,
                        CheckpointEventKind::Loaded,
                    )
                    .with_workflow_type(&checkpoint.workflow_type)
                    .with_size(checkpoint.state_size_bytes)
                    .with_automated(checkpoint.metadata.automated)
                    .with_latency_ms(read_started.elapsed().as_secs_f64() * 1000.0),
                );
                Ok(Some(checkpoint))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.hub.checkpoints.notify(
                    &CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason(&err.to_string()),
                );
                Err(err.into())
            }
        }
    }

    /// Checkpoints of one workflow, newest first.
    pub async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError> {
        let mut checkpoints: Vec<WorkflowCheckpoint> = self
            .scan_all()
            .await?
            .into_iter()
            .filter(|c| c.workflow_id == workflow_id)
            .collect();
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    /// Most recent checkpoint of a workflow.
    pub async fn latest(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        Ok(self.list_for_workflow(workflow_id).await?.into_iter().next())
    }

    /// Remove one checkpoint. Missing ids are not errors; returns whether
    /// anything was removed.
    pub async fn delete(&self, checkpoint_id: &str) -> Result<bool, StoreError> {
        // Read first so the Deleted event can carry size and workflow id;
        // corrupt records still get deleted.
        let existing = self.read(checkpoint_id).await.ok().flatten();

        let mut deleted = false;
        if let Some(primary) = &self.primary {
            match primary.delete(checkpoint_id).await {
                Ok(removed) => deleted |= removed,
                Err(err) => {
                    warn!(backend = primary.name(), error = %err, "primary delete failed");
                }
            }
        }
        match self.files.delete(checkpoint_id).await {
            Ok(removed) => deleted |= removed,
            Err(err) => return Err(err.into()),
        }

        if deleted {
            let mut event = CheckpointEvent::new(
                checkpoint_id,
                existing.as_ref().map_or("", |c| c.workflow_id.as_str()),
                CheckpointEventKind::Deleted,
            );
            if let Some(checkpoint) = &existing {
                event = event
                    .with_workflow_type(&checkpoint.workflow_type)
                    .with_size(checkpoint.state_size_bytes)
                    .with_automated(checkpoint.metadata.automated);
            }
            self.hub.checkpoints.notify(&event);
        }
        Ok(deleted)
    }

    /// Remove every checkpoint of a workflow; returns the deleted ids.
    pub async fn delete_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let checkpoints = self.list_for_workflow(workflow_id).await?;
        let mut deleted = Vec::with_capacity(checkpoints.len());
        for checkpoint in checkpoints {
            if self.delete(&checkpoint.checkpoint_id).await? {
                deleted.push(checkpoint.checkpoint_id);
            }
        }
        Ok(deleted)
    }

    /// Scan-based aggregate statistics.
    pub async fn statistics(&self) -> Result<CheckpointStatistics, StoreError> {
        Ok(CheckpointStatistics::from_scan(&self.scan_all().await?))
    }

    /// Check that a checkpoint exists, has a non-empty snapshot, and that the
    /// snapshot parses. Never mutates state.
    pub async fn validate(&self, checkpoint_id: &str) -> (bool, Option<String>) {
        let checkpoint = match self.read(checkpoint_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                return (false, Some(format!("checkpoint {checkpoint_id} not found")));
            }
            Err(err) => {
                self.hub.checkpoints.notify(
                    &CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason(&err.to_string()),
                );
                return (false, Some(err.to_string()));
            }
        };
        if checkpoint.snapshot.trim().is_empty() {
            let message = format!("checkpoint {checkpoint_id} has an empty snapshot");
            self.notify_validation_failure(&checkpoint, &message);
            return (false, Some(message));
        }
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&checkpoint.snapshot) {
            let message = format!("snapshot is not valid JSON: {err}");
            self.notify_validation_failure(&checkpoint, &message);
            return (false, Some(message));
        }
        self.hub.checkpoints.notify(
            &CheckpointEvent::new(
                checkpoint_id,
                &checkpoint.workflow_id,
                CheckpointEventKind::Validated,
            )
            .with_workflow_type(&checkpoint.workflow_type)
            .with_automated(checkpoint.metadata.automated),
        );
        (true, None)
    }

    fn notify_validation_failure(&self, checkpoint: &WorkflowCheckpoint, message: &str) {
        self.hub.checkpoints.notify(
            &CheckpointEvent::new(
                &checkpoint.checkpoint_id,
                &checkpoint.workflow_id,
                CheckpointEventKind::Failed,
            )
            .with_workflow_type(&checkpoint.workflow_type)
            .with_reason(message),
        );
    }

    /// UTC now, nudged forward when needed so creation times per workflow
    /// strictly increase.
    fn monotonic_created_at(&self, workflow_id: &str) -> DateTime<Utc> {
        let mut last_created = self.last_created.lock();
        let mut now = Utc::now();
        if let Some(last) = last_created.get(workflow_id) {
            if now <= *last {
                now = *last + ChronoDuration::microseconds(1);
            }
        }
        last_created.insert(workflow_id.to_string(), now);
        now
    }

    async fn fresh_checkpoint_id(&self) -> Result<String, StoreError> {
        for _ in 0..ID_COLLISION_RETRIES {
            let id = self.ids.checkpoint_id();
            if !self.id_exists(&id).await {
                return Ok(id);
            }
            warn!(checkpoint_id = %id, "checkpoint id collision; regenerating");
        }
        Err(StoreError::Storage {
            message: "could not generate a unique checkpoint id".to_string(),
        })
    }

    async fn id_exists(&self, checkpoint_id: &str) -> bool {
        if let Some(primary) = &self.primary {
            if matches!(primary.get(checkpoint_id).await, Ok(Some(_)) | Err(_)) {
                // Treat backend errors as a possible collision; the id is
                // cheap to regenerate.
                return true;
            }
        }
        !matches!(self.files.get(checkpoint_id).await, Ok(None))
    }

    async fn write(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        match (&self.mode, &self.primary) {
            (StorageBackendKind::PrimaryWithFileFallback, Some(primary)) => {
                match primary.put(checkpoint).await {
                    Ok(()) => Ok(()),
                    Err(primary_err) => {
                        warn!(
                            backend = primary.name(),
                            error = %primary_err,
                            "primary checkpoint write failed; falling back to file backend"
                        );
                        self.files.put(checkpoint).await.map_err(|file_err| {
                            self.hub.checkpoints.notify(
                                &CheckpointEvent::new(
                                    &checkpoint.checkpoint_id,
                                    &checkpoint.workflow_id,
                                    CheckpointEventKind::Failed,
                                )
                                .with_reason("both storage backends failed"),
                            );
                            StoreError::Storage {
                                message: format!(
                                    "primary: {primary_err}; fallback: {file_err}"
                                ),
                            }
                        })
                    }
                }
            }
            _ => self.files.put(checkpoint).await.map_err(|err| {
                self.hub.checkpoints.notify(
                    &CheckpointEvent::new(
                        &checkpoint.checkpoint_id,
                        &checkpoint.workflow_id,
                        CheckpointEventKind::Failed,
                    )
                    .with_reason(&err.to_string()),
                );
                StoreError::Storage {
                    message: err.to_string(),
                }
            }),
        }
    }

    async fn read(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, BackendError> {
        if let Some(primary) = &self.primary {
            match primary.get(checkpoint_id).await {
                Ok(Some(checkpoint)) => return Ok(Some(checkpoint)),
                Ok(None) => {}
                Err(BackendError::Transport { message }) => {
                    warn!(error = %message, "primary checkpoint read failed; trying file backend");
                }
                Err(err) => return Err(err),
            }
        }
        self.files.get(checkpoint_id).await
    }

    async fn scan_all(&self) -> Result<Vec<WorkflowCheckpoint>, StoreError> {
        let mut seen: FxHashMap<String, WorkflowCheckpoint> = FxHashMap::default();
        if let Some(primary) = &self.primary {
            match primary.scan().await {
                Ok(checkpoints) => {
                    for checkpoint in checkpoints {
                        seen.insert(checkpoint.checkpoint_id.clone(), checkpoint);
                    }
                }
                Err(err) => {
                    warn!(backend = primary.name(), error = %err, "primary scan failed; using file backend only");
                }
            }
        }
        for checkpoint in self.files.scan().await? {
            seen.entry(checkpoint.checkpoint_id.clone())
                .or_insert(checkpoint);
        }
        Ok(seen.into_values().collect())
    }

    async fn enforce_retention(&self, workflow_id: &str) {
        let listed = match self.list_for_workflow(workflow_id).await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(workflow_id, error = %err, "retention scan failed");
                return;
            }
        };
        if listed.len() <= self.retention {
            return;
        }
        // Newest-first ordering: everything past the cap is oldest.
        for stale in &listed[self.retention..] {
            if let Err(err) = self.delete(&stale.checkpoint_id).await {
                warn!(
                    checkpoint_id = %stale.checkpoint_id,
                    error = %err,
                    "retention delete failed"
                );
            }
        }
    }
}
