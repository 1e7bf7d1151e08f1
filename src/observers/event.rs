//! Events delivered through the observer fan-out.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowState;

/// Emitted on every accepted workflow state transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateEvent {
    pub workflow_id: String,
    pub workflow_type: String,
    /// `None` only for the initial Queued registration.
    pub previous: Option<WorkflowState>,
    pub next: WorkflowState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Seconds since the workflow started running, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

/// What happened to a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointEventKind {
    Created,
    Loaded,
    Deleted,
    Validated,
    /// A checkpoint operation failed (corrupt record, failed validation,
    /// storage error after fallback).
    Failed,
}

/// Emitted by the checkpoint store on every observable operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub checkpoint_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    pub kind: CheckpointEventKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the checkpoint was automated, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<bool>,
    /// Wall-clock duration of the save/load that produced this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl CheckpointEvent {
    #[must_use]
    pub fn new(checkpoint_id: &str, workflow_id: &str, kind: CheckpointEventKind) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: None,
            kind,
            at: Utc::now(),
            size_bytes: None,
            reason: None,
            automated: None,
            latency_ms: None,
        }
    }

    #[must_use]
    pub fn with_workflow_type(mut self, workflow_type: &str) -> Self {
        self.workflow_type = Some(workflow_type.to_string());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    #[must_use]
    pub fn with_automated(mut self, automated: bool) -> Self {
        self.automated = Some(automated);
        self
    }

    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}
