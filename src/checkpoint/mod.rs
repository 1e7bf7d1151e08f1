//! Checkpoint persistence: the data model, snapshot serialization, pluggable
//! storage back-ends, and the store that ties them together.
//!
//! A checkpoint is the unit of atomic progress: everything recovery needs is
//! inside it. The store enforces the size cap, retention, id uniqueness, and
//! the primary→file fallback contract; back-ends are dumb keyed storage.

pub mod backend;
pub mod file_backend;
pub mod model;
pub mod snapshot;
#[cfg(feature = "sqlite")]
pub mod sqlite_backend;
pub mod store;

pub use backend::{BackendError, CheckpointBackend, MemoryBackend};
pub use file_backend::FileBackend;
pub use model::{
    CheckpointMetadata, CheckpointStatistics, SNAPSHOT_SCHEMA_VERSION, WorkflowCheckpoint,
};
pub use snapshot::{SnapshotError, decode_snapshot, encode_snapshot};
#[cfg(feature = "sqlite")]
pub use sqlite_backend::SqliteBackend;
pub use store::{CheckpointStore, SaveRequest, StoreError};
