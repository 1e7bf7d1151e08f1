//! Workflow records and the workflow state machine.
//!
//! This module defines the two foundations everything else builds on:
//!
//! - [`WorkflowState`]: the lifecycle enum with its legal-transition table.
//!   The table is the single source of truth; the controller consults it and
//!   rejects anything else.
//! - [`WorkflowRecord`]: the in-memory unit of execution the pipeline
//!   executor mutates as stages complete. A checkpoint snapshot is exactly a
//!   serialized `WorkflowRecord`, so this struct plus the pipeline definition
//!   is sufficient to resume.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::Message;

/// Lifecycle state of a workflow.
///
/// Legal transitions:
///
/// ```text
/// Queued  → Running, Cancelled
/// Running → Paused, Completed, Failed, Cancelled
/// Paused  → Running, Failed, Cancelled
/// Completed / Failed / Cancelled: terminal
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Returns `true` when moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }

    /// Terminal states admit no successor.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Wire-format name, matching the status strings of the control surface.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Queued => "Queued",
            WorkflowState::Running => "Running",
            WorkflowState::Paused => "Paused",
            WorkflowState::Completed => "Completed",
            WorkflowState::Failed => "Failed",
            WorkflowState::Cancelled => "Cancelled",
        }
    }

    /// Short human description, used in status views and logs.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            WorkflowState::Queued => "accepted, waiting for an execution slot",
            WorkflowState::Running => "executing pipeline stages",
            WorkflowState::Paused => "paused at a stage boundary, resumable",
            WorkflowState::Completed => "finished successfully",
            WorkflowState::Failed => "stopped by an unrecovered stage error",
            WorkflowState::Cancelled => "stopped by a cancel request",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable execution record for one workflow.
///
/// Owned and mutated only by the executor driving that workflow. Everything a
/// resume needs lives here: the message log (replayed as stage input), which
/// agents already completed, and their recorded outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    /// Free-form name of the pipeline this workflow runs.
    pub workflow_type: String,
    /// The original user input that started the workflow.
    pub user_input: String,
    pub started_at: DateTime<Utc>,
    /// 0-based index of the stage about to run (or just completed).
    pub current_stage_index: usize,
    pub current_agent_id: Option<String>,
    /// Agents that finished, in pipeline order, without duplicates.
    pub completed_agents: Vec<String>,
    /// Agent id → textual stage output.
    pub stage_results: FxHashMap<String, String>,
    /// Append-only conversation log; reconstructs stage input on resume.
    pub log: Vec<Message>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub is_paused: bool,
    pub metadata: FxHashMap<String, serde_json::Value>,
}

impl WorkflowRecord {
    /// Create a fresh record. The message log starts empty; the executor
    /// seeds it with the user input before the first stage.
    #[must_use]
    pub fn new(workflow_id: &str, workflow_type: &str, user_input: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            user_input: user_input.to_string(),
            started_at: Utc::now(),
            current_stage_index: 0,
            current_agent_id: None,
            completed_agents: Vec::new(),
            stage_results: FxHashMap::default(),
            log: Vec::new(),
            paused_at: None,
            pause_reason: None,
            is_paused: false,
            metadata: FxHashMap::default(),
        }
    }

    /// Append a message to the log.
    pub fn append_message(&mut self, message: Message) {
        self.log.push(message);
    }

    /// Record a completed stage: its output and its place in the completed
    /// list. Keeps `current_stage_index == completed_agents.len()`.
    pub fn record_stage_result(&mut self, agent_id: &str, output: String) {
        self.stage_results.insert(agent_id.to_string(), output);
        if !self.completed_agents.iter().any(|a| a == agent_id) {
            self.completed_agents.push(agent_id.to_string());
        }
        self.current_stage_index = self.completed_agents.len();
    }

    /// Mark the record paused with a reason.
    pub fn mark_paused(&mut self, reason: &str) {
        self.is_paused = true;
        self.paused_at = Some(Utc::now());
        self.pause_reason = Some(reason.to_string());
    }

    /// Clear pause bookkeeping, typically right after a resume.
    pub fn clear_pause(&mut self) {
        self.is_paused = false;
        self.paused_at = None;
        self.pause_reason = None;
    }

    /// Output of the most recently completed stage, if any.
    #[must_use]
    pub fn last_stage_output(&self) -> Option<&str> {
        self.completed_agents
            .last()
            .and_then(|agent| self.stage_results.get(agent))
            .map(String::as_str)
    }
}
