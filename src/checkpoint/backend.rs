//! Pluggable checkpoint storage.
//!
//! Back-ends are opaque keyed storage: they persist whole
//! [`WorkflowCheckpoint`] records by checkpoint id and know nothing about
//! retention, size caps, or fallback — that policy lives in the store.
//!
//! All implementations must be `Send + Sync`; concurrent writers always
//! target distinct ids, so no cross-id coordination is required.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::model::WorkflowCheckpoint;

/// Errors from a storage back-end.
#[derive(Debug, Error, Diagnostic)]
pub enum BackendError {
    /// Filesystem-level failure.
    #[error("storage I/O error: {message}")]
    #[diagnostic(
        code(wayfarer::backend::io),
        help("Check the storage directory exists and is writable.")
    )]
    Io { message: String },

    /// Networked back-end could not be reached or rejected the call.
    #[error("storage transport error: {message}")]
    #[diagnostic(code(wayfarer::backend::transport))]
    Transport { message: String },

    /// The stored bytes for an id are not a parseable checkpoint record.
    #[error("checkpoint {checkpoint_id} is not valid JSON: {message}")]
    #[diagnostic(
        code(wayfarer::backend::corrupt),
        help("The record was tampered with or truncated; delete it or restore from the fallback backend.")
    )]
    Corrupt {
        checkpoint_id: String,
        message: String,
    },
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io {
            message: err.to_string(),
        }
    }
}

/// Opaque keyed storage for checkpoint records.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Persist a record under its checkpoint id, replacing any prior value.
    async fn put(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), BackendError>;

    /// Fetch a record. `Ok(None)` for absent ids; `Corrupt` when the stored
    /// bytes do not parse.
    async fn get(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, BackendError>;

    /// Remove a record; returns whether anything was removed. Idempotent.
    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError>;

    /// Scan every stored record. Unparseable entries are skipped with a
    /// warning so one corrupt record cannot poison listings.
    async fn scan(&self) -> Result<Vec<WorkflowCheckpoint>, BackendError>;

    /// Stable short name, used in log lines.
    fn name(&self) -> &'static str;
}

/// Volatile in-process back-end. Fast and non-durable; used in tests and as
/// a stand-in primary when no database is configured.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<FxHashMap<String, WorkflowCheckpoint>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryBackend {
    async fn put(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), BackendError> {
        self.inner
            .write()
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>, BackendError> {
        Ok(self.inner.read().get(checkpoint_id).cloned())
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError> {
        Ok(self.inner.write().remove(checkpoint_id).is_some())
    }

    async fn scan(&self) -> Result<Vec<WorkflowCheckpoint>, BackendError> {
        Ok(self.inner.read().values().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
