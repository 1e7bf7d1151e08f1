//! Engine configuration.
//!
//! All recognized knobs live on [`EngineConfig`]; nothing else in the crate
//! reads the environment. Defaults are production-leaning (durable primary
//! backend with file fallback, stage-boundary checkpoints on). Tests build a
//! config by mutating `EngineConfig::default()`.

use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Which persistence stack the checkpoint store uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// File back-end only. No network, suitable for tests and single-host runs.
    File,
    /// Primary (networked) back-end with transparent fallback to files on any
    /// transport failure.
    PrimaryWithFileFallback,
}

/// Every option the execution core recognizes.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Turn periodic (interval-driven) checkpoints on.
    pub enable_auto_checkpoints: bool,
    /// Interval between periodic checkpoints.
    pub auto_checkpoint_interval: Duration,
    /// Write before/after checkpoints at every stage boundary.
    pub checkpoint_after_each_agent: bool,
    /// Retained checkpoints per workflow; 0 means unlimited.
    pub max_checkpoints_per_workflow: usize,
    /// Snapshots above this UTF-8 byte length are rejected.
    pub max_checkpoint_size_bytes: u64,
    pub storage_backend: StorageBackendKind,
    /// Root directory of the file back-end; created lazily.
    pub local_storage_directory: PathBuf,
    /// Gzip snapshot files on write.
    pub compress_snapshots: bool,
    /// Connection URL for the primary back-end (sqlite KV).
    pub primary_database_url: String,
    /// A `Running` workflow older than this raises a long-running alert.
    pub long_running_threshold: Duration,
    /// Cumulative checkpoint bytes above this raise a storage alert.
    pub storage_alert_threshold_bytes: u64,
    /// Per-agent hard timeout; `stage_timeout` falls back to the default.
    pub stage_timeouts: FxHashMap<String, Duration>,
    pub default_stage_timeout: Duration,
    /// Per-agent retry budget; `retry_budget` falls back to the default.
    pub retry_max_attempts: FxHashMap<String, u32>,
    pub default_retry_max_attempts: u32,
    /// Process-wide cap on concurrently executing workflows. Workflows over
    /// the cap stay Queued until a slot frees.
    pub max_concurrent_workflows: usize,
    /// Bound on in-flight file back-end writes.
    pub max_in_flight_checkpoint_writes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_auto_checkpoints: true,
            auto_checkpoint_interval: Duration::from_secs(5 * 60),
            checkpoint_after_each_agent: true,
            max_checkpoints_per_workflow: 10,
            max_checkpoint_size_bytes: 50 * 1024 * 1024,
            storage_backend: StorageBackendKind::PrimaryWithFileFallback,
            local_storage_directory: PathBuf::from("./checkpoints"),
            compress_snapshots: false,
            primary_database_url: "sqlite://wayfarer-checkpoints.db".to_string(),
            long_running_threshold: Duration::from_secs(30 * 60),
            storage_alert_threshold_bytes: 5 * 1024 * 1024 * 1024,
            stage_timeouts: FxHashMap::default(),
            default_stage_timeout: Duration::from_secs(60),
            retry_max_attempts: FxHashMap::default(),
            default_retry_max_attempts: 1,
            max_concurrent_workflows: 16,
            max_in_flight_checkpoint_writes: 8,
        }
    }
}

impl EngineConfig {
    /// Default config with environment overrides applied.
    ///
    /// Recognized variables (loaded through `.env` when present):
    /// `WAYFARER_STORAGE_DIR`, `WAYFARER_STORAGE_BACKEND` (`file` |
    /// `primary-with-file-fallback`), `WAYFARER_PRIMARY_DB_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("WAYFARER_STORAGE_DIR") {
            config.local_storage_directory = PathBuf::from(dir);
        }
        if let Ok(kind) = std::env::var("WAYFARER_STORAGE_BACKEND") {
            match kind.as_str() {
                "file" => config.storage_backend = StorageBackendKind::File,
                "primary-with-file-fallback" => {
                    config.storage_backend = StorageBackendKind::PrimaryWithFileFallback;
                }
                other => {
                    tracing::warn!(value = other, "unrecognized WAYFARER_STORAGE_BACKEND; keeping default");
                }
            }
        }
        if let Ok(url) = std::env::var("WAYFARER_PRIMARY_DB_URL") {
            config.primary_database_url = url;
        }
        config
    }

    /// Hard timeout for one invocation of the given stage.
    #[must_use]
    pub fn stage_timeout(&self, agent_id: &str) -> Duration {
        self.stage_timeouts
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_stage_timeout)
    }

    /// Retry budget (total attempts) for the given stage.
    #[must_use]
    pub fn retry_budget(&self, agent_id: &str) -> u32 {
        self.retry_max_attempts
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_retry_max_attempts)
            .max(1)
    }

    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_storage_directory = dir.into();
        self
    }

    #[must_use]
    pub fn with_file_backend_only(mut self) -> Self {
        self.storage_backend = StorageBackendKind::File;
        self
    }

    #[must_use]
    pub fn with_stage_timeout(mut self, agent_id: &str, timeout: Duration) -> Self {
        self.stage_timeouts.insert(agent_id.to_string(), timeout);
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, agent_id: &str, attempts: u32) -> Self {
        self.retry_max_attempts
            .insert(agent_id.to_string(), attempts);
        self
    }

    /// Retry budgets of the stock research pipeline: clarify twice, brief
    /// once, researcher three times.
    #[must_use]
    pub fn with_research_retry_defaults(self) -> Self {
        self.with_retry_budget("clarify", 2)
            .with_retry_budget("brief", 1)
            .with_retry_budget("researcher", 3)
    }
}
