//! Checkpoint records and aggregate statistics.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Version stamped into every snapshot so future readers can migrate.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Bookkeeping attached to a checkpoint alongside the snapshot itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// `true` for checkpoints the executor wrote on its own (stage boundary,
    /// periodic, error recovery); `false` for user-initiated ones.
    pub automated: bool,
    /// Why the checkpoint exists: `before-<agent>`, `after-<agent>`,
    /// `pause:<why>`, `error-recovery:<message>`, `cancelled`, `auto`,
    /// `workflow-complete`, `resumed-after-<agent>`.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form context captured at save time.
    #[serde(default)]
    pub context: FxHashMap<String, serde_json::Value>,
    /// Agents completed at the moment of the checkpoint, in pipeline order.
    #[serde(default)]
    pub completed_agents: Vec<String>,
}

impl CheckpointMetadata {
    /// Automated checkpoint with the given reason tag.
    #[must_use]
    pub fn automated(reason: &str, completed_agents: Vec<String>) -> Self {
        Self {
            automated: true,
            reason: reason.to_string(),
            user_id: None,
            context: FxHashMap::default(),
            completed_agents,
        }
    }

    /// Manually requested checkpoint attributed to a user.
    #[must_use]
    pub fn manual(reason: &str, user_id: &str, completed_agents: Vec<String>) -> Self {
        Self {
            automated: false,
            reason: reason.to_string(),
            user_id: Some(user_id.to_string()),
            context: FxHashMap::default(),
            completed_agents,
        }
    }
}

/// A persisted stage-boundary snapshot of workflow progress.
///
/// Self-contained by construction: the `snapshot` text deserializes back into
/// the full workflow record, so loading a checkpoint plus knowing the
/// pipeline definition is sufficient to resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    /// The stage that was about to run or had just completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// 0-based stage index at checkpoint time.
    pub stage_index: usize,
    /// Opaque serialized workflow record (JSON text).
    pub snapshot: String,
    pub schema_version: u32,
    /// UTF-8 byte length of `snapshot`.
    pub state_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub metadata: CheckpointMetadata,
}

/// Aggregate view over everything in the store. Recomputable by scanning.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CheckpointStatistics {
    pub total_count: u64,
    pub average_size_bytes: f64,
    pub largest_size_bytes: u64,
    pub total_bytes: u64,
    /// Checkpoints created within the trailing 24 hours.
    pub created_last_24h: u64,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub newest_created_at: Option<DateTime<Utc>>,
}

impl CheckpointStatistics {
    /// Compute statistics from a scan.
    #[must_use]
    pub fn from_scan(checkpoints: &[WorkflowCheckpoint]) -> Self {
        if checkpoints.is_empty() {
            return Self::default();
        }
        let now = Utc::now();
        let total_count = checkpoints.len() as u64;
        let total_bytes: u64 = checkpoints.iter().map(|c| c.state_size_bytes).sum();
        let largest = checkpoints
            .iter()
            .map(|c| c.state_size_bytes)
            .max()
            .unwrap_or(0);
        let last_24h = checkpoints
            .iter()
            .filter(|c| now.signed_duration_since(c.created_at).num_hours() < 24)
            .count() as u64;
        let oldest = checkpoints.iter().map(|c| c.created_at).min();
        let newest = checkpoints.iter().map(|c| c.created_at).max();
        Self {
            total_count,
            average_size_bytes: total_bytes as f64 / total_count as f64,
            largest_size_bytes: largest,
            total_bytes,
            created_last_24h: last_24h,
            oldest_created_at: oldest,
            newest_created_at: newest,
        }
    }
}
