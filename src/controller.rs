//! The pause/resume/cancel control plane.
//!
//! [`PauseResumeController`] is the global registry of per-workflow signals,
//! execution states, and cancellation sources, and the sole arbiter of state
//! transitions. All three maps live behind one mutex so callers always see a
//! consistent view; observer notifications are assembled under the lock and
//! delivered after it is released.
//!
//! Signals are set by external callers (the HTTP boundary) and cleared only
//! when the executor acts on them at a stage boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::WorkflowCheckpoint;
use crate::observers::{ObserverHub, WorkflowStateEvent};
use crate::workflow::WorkflowState;

/// Per-workflow pause/cancel request flags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PauseResumeSignal {
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Live view of one workflow's execution.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: WorkflowState,
    pub current_agent_id: Option<String>,
    pub current_stage_index: usize,
    pub total_stages: usize,
    pub completed_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub latest_checkpoint_id: Option<String>,
}

impl ExecutionState {
    fn placeholder(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_type: String::new(),
            state: WorkflowState::Queued,
            current_agent_id: None,
            current_stage_index: 0,
            total_stages: 0,
            completed_agents: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            latest_checkpoint_id: None,
        }
    }

    /// Wall-clock time since the workflow started running.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at
            .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ControllerError {
    /// The requested state change is not in the legal-transition table.
    #[error("invalid transition for {workflow_id}: {from} -> {to}")]
    #[diagnostic(
        code(wayfarer::controller::invalid_transition),
        help("Consult the workflow state machine; terminal states admit no successor.")
    )]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowState,
        to: WorkflowState,
    },
}

#[derive(Default)]
struct ControllerInner {
    signals: FxHashMap<String, PauseResumeSignal>,
    states: FxHashMap<String, ExecutionState>,
    tokens: FxHashMap<String, CancellationToken>,
}

/// Global registry and transition arbiter. Construct one per engine; tests
/// construct a fresh controller per case.
pub struct PauseResumeController {
    inner: Mutex<ControllerInner>,
    hub: Arc<ObserverHub>,
}

impl PauseResumeController {
    #[must_use]
    pub fn new(hub: Arc<ObserverHub>) -> Self {
        Self {
            inner: Mutex::new(ControllerInner::default()),
            hub,
        }
    }

    /// Register a workflow in the Queued state and hand back its
    /// cancellation token.
    pub fn register(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        total_stages: usize,
    ) -> CancellationToken {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .entry(workflow_id.to_string())
            .or_insert_with(|| ExecutionState::placeholder(workflow_id));
        state.workflow_type = workflow_type.to_string();
        state.total_stages = total_stages;
        inner.signals.entry(workflow_id.to_string()).or_default();
        inner
            .tokens
            .entry(workflow_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Request a pause. Idempotent: repeated requests update the timestamp
    /// but produce one observable transition.
    pub fn request_pause(&self, workflow_id: &str, reason: Option<&str>) {
        let mut inner = self.inner.lock();
        let signal = inner.signals.entry(workflow_id.to_string()).or_default();
        signal.pause_requested = true;
        signal.updated_at = Some(Utc::now());
        if let Some(reason) = reason {
            signal.reason = Some(reason.to_string());
        }
    }

    /// Request cancellation and fire the workflow's cancellation token.
    pub fn request_cancel(&self, workflow_id: &str) {
        let token = {
            let mut inner = self.inner.lock();
            let signal = inner.signals.entry(workflow_id.to_string()).or_default();
            signal.cancel_requested = true;
            signal.updated_at = Some(Utc::now());
            inner
                .tokens
                .entry(workflow_id.to_string())
                .or_insert_with(CancellationToken::new)
                .clone()
        };
        token.cancel();
    }

    /// Current signal; empty for unknown workflows.
    #[must_use]
    pub fn signal(&self, workflow_id: &str) -> PauseResumeSignal {
        self.inner
            .lock()
            .signals
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The workflow's cancellation token, created lazily. Subsequent calls
    /// return the same token.
    #[must_use]
    pub fn token(&self, workflow_id: &str) -> CancellationToken {
        self.inner
            .lock()
            .tokens
            .entry(workflow_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Clear the pause flag once the executor has acted on it.
    pub fn acknowledge_pause(&self, workflow_id: &str) {
        if let Some(signal) = self.inner.lock().signals.get_mut(workflow_id) {
            signal.pause_requested = false;
            signal.updated_at = Some(Utc::now());
        }
    }

    /// Clear the cancel flag once the executor has acted on it.
    pub fn acknowledge_cancel(&self, workflow_id: &str) {
        if let Some(signal) = self.inner.lock().signals.get_mut(workflow_id) {
            signal.cancel_requested = false;
            signal.updated_at = Some(Utc::now());
        }
    }

    /// Record the newest checkpoint on the execution state.
    pub fn on_checkpoint_saved(&self, workflow_id: &str, checkpoint: &WorkflowCheckpoint) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(workflow_id) {
            state.latest_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
            state.completed_agents = checkpoint.metadata.completed_agents.clone();
        }
    }

    /// Clear pause bookkeeping and transition back to Running after a
    /// resume.
    pub fn on_workflow_resumed(
        &self,
        workflow_id: &str,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<(), ControllerError> {
        {
            let mut inner = self.inner.lock();
            if let Some(state) = inner.states.get_mut(workflow_id) {
                state.latest_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
                state.current_stage_index = checkpoint.stage_index;
                state.current_agent_id = checkpoint.agent_id.clone();
                state.completed_agents = checkpoint.metadata.completed_agents.clone();
            }
        }
        self.transition(workflow_id, WorkflowState::Running, Some("resumed"))
    }

    /// Apply a state transition, rejecting anything outside the legal table.
    /// The matching workflow-state event is delivered after the internal
    /// lock is released.
    pub fn transition(
        &self,
        workflow_id: &str,
        next: WorkflowState,
        reason: Option<&str>,
    ) -> Result<(), ControllerError> {
        let event = {
            let mut inner = self.inner.lock();
            let state = inner
                .states
                .entry(workflow_id.to_string())
                .or_insert_with(|| ExecutionState::placeholder(workflow_id));
            let previous = state.state;
            if !previous.can_transition(next) {
                warn!(
                    workflow_id,
                    from = %previous,
                    to = %next,
                    "rejected invalid workflow transition"
                );
                return Err(ControllerError::InvalidTransition {
                    workflow_id: workflow_id.to_string(),
                    from: previous,
                    to: next,
                });
            }

            let now = Utc::now();
            let mut metadata = FxHashMap::default();
            match next {
                WorkflowState::Running => {
                    if state.started_at.is_none() {
                        state.started_at = Some(now);
                    }
                    if let Some(paused_at) = state.paused_at.take() {
                        let paused_for = (now - paused_at).to_std().unwrap_or_default();
                        metadata.insert(
                            "paused_for_seconds".to_string(),
                            serde_json::json!(paused_for.as_secs_f64()),
                        );
                    }
                }
                WorkflowState::Paused => {
                    state.paused_at = Some(now);
                }
                _ => {}
            }
            state.state = next;

            let elapsed_seconds = state
                .started_at
                .map(|started| (now - started).to_std().unwrap_or_default().as_secs_f64());
            WorkflowStateEvent {
                workflow_id: workflow_id.to_string(),
                workflow_type: state.workflow_type.clone(),
                previous: Some(previous),
                next,
                at: now,
                reason: reason.map(str::to_string),
                elapsed_seconds,
                metadata,
            }
        };
        debug!(
            workflow_id,
            from = ?event.previous,
            to = %event.next,
            "workflow transition"
        );
        self.hub.workflow_states.notify(&event);
        Ok(())
    }

    /// Live view of a workflow; creates a Queued placeholder if none exists.
    #[must_use]
    pub fn execution_state(&self, workflow_id: &str) -> ExecutionState {
        self.inner
            .lock()
            .states
            .entry(workflow_id.to_string())
            .or_insert_with(|| ExecutionState::placeholder(workflow_id))
            .clone()
    }

    /// Like [`execution_state`](Self::execution_state) but without creating
    /// a placeholder.
    #[must_use]
    pub fn try_execution_state(&self, workflow_id: &str) -> Option<ExecutionState> {
        self.inner.lock().states.get(workflow_id).cloned()
    }

    /// Update progress fields as the executor advances.
    pub fn update_progress(
        &self,
        workflow_id: &str,
        stage_index: usize,
        agent_id: Option<&str>,
        completed_agents: &[String],
    ) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(workflow_id) {
            state.current_stage_index = stage_index;
            state.current_agent_id = agent_id.map(str::to_string);
            state.completed_agents = completed_agents.to_vec();
        }
    }

    /// Drop the signal and cancellation source of a finished workflow. The
    /// execution state is kept for status queries.
    pub fn release(&self, workflow_id: &str) {
        let mut inner = self.inner.lock();
        inner.signals.remove(workflow_id);
        inner.tokens.remove(workflow_id);
    }

    /// Workflow ids with a tracked execution state.
    #[must_use]
    pub fn known_workflows(&self) -> Vec<String> {
        self.inner.lock().states.keys().cloned().collect()
    }

    /// Cancel every live workflow; called on engine teardown.
    pub fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = {
            let inner = self.inner.lock();
            inner.tokens.values().cloned().collect()
        };
        for token in tokens {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PauseResumeController {
        PauseResumeController::new(Arc::new(ObserverHub::new()))
    }

    #[test]
    fn register_creates_queued_state_and_token() {
        let controller = controller();
        let token = controller.register("wf_1", "research", 3);
        assert!(!token.is_cancelled());
        let state = controller.execution_state("wf_1");
        assert_eq!(state.state, WorkflowState::Queued);
        assert_eq!(state.total_stages, 3);
    }

    #[test]
    fn pause_request_is_idempotent() {
        let controller = controller();
        controller.register("wf_1", "research", 3);
        controller.request_pause("wf_1", Some("user asked"));
        controller.request_pause("wf_1", None);
        let signal = controller.signal("wf_1");
        assert!(signal.pause_requested);
        assert_eq!(signal.reason.as_deref(), Some("user asked"));

        controller.acknowledge_pause("wf_1");
        assert!(!controller.signal("wf_1").pause_requested);
    }

    #[test]
    fn cancel_fires_the_token() {
        let controller = controller();
        let token = controller.register("wf_1", "research", 3);
        controller.request_cancel("wf_1");
        assert!(token.is_cancelled());
        assert!(controller.signal("wf_1").cancel_requested);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let controller = controller();
        controller.register("wf_1", "research", 3);
        // Queued -> Paused is not in the table.
        let err = controller
            .transition("wf_1", WorkflowState::Paused, None)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));
        // The state is untouched.
        assert_eq!(
            controller.execution_state("wf_1").state,
            WorkflowState::Queued
        );
    }

    #[test]
    fn transition_stamps_started_and_paused() {
        let controller = controller();
        controller.register("wf_1", "research", 3);
        controller
            .transition("wf_1", WorkflowState::Running, None)
            .unwrap();
        let running = controller.execution_state("wf_1");
        assert!(running.started_at.is_some());

        controller
            .transition("wf_1", WorkflowState::Paused, Some("boundary"))
            .unwrap();
        assert!(controller.execution_state("wf_1").paused_at.is_some());

        controller
            .transition("wf_1", WorkflowState::Running, None)
            .unwrap();
        assert!(controller.execution_state("wf_1").paused_at.is_none());
    }

    #[test]
    fn unknown_workflow_yields_placeholder_and_empty_signal() {
        let controller = controller();
        assert_eq!(controller.signal("wf_missing"), PauseResumeSignal::default());
        let state = controller.execution_state("wf_missing");
        assert_eq!(state.state, WorkflowState::Queued);
    }

    #[test]
    fn shutdown_cancels_every_live_workflow() {
        let controller = controller();
        let a = controller.register("wf_a", "research", 1);
        let b = controller.register("wf_b", "research", 1);
        controller.shutdown();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
