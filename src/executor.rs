//! The pipeline executor.
//!
//! Drives an ordered stage list for one workflow: advancing the state
//! machine through the controller, persisting progress through the
//! checkpoint store, and honoring pause/cancel requests at stage boundaries.
//! One workflow is single-threaded — exactly one stage in flight — while
//! different workflows run on independent tasks.
//!
//! Pause surfaces as [`ExecutorError::Paused`], a control-flow signal
//! carrying `(workflow_id, checkpoint_id, reason)`; it is not a failure.
//! Cancellation is an ordinary outcome with state `Cancelled`.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::agents::middleware::{StagePolicy, decorate};
use crate::agents::{Agent, AgentContext, AgentError};
use crate::checkpoint::{
    CheckpointMetadata, CheckpointStore, SaveRequest, SnapshotError, StoreError, WorkflowCheckpoint,
    decode_snapshot, encode_snapshot,
};
use crate::config::EngineConfig;
use crate::controller::{ControllerError, PauseResumeController};
use crate::message::Message;
use crate::utils::IdGenerator;
use crate::workflow::{WorkflowRecord, WorkflowState};

/// The literal the clarification stage emits when it needs user input. The
/// match is case-insensitive substring; policy lives in
/// [`PipelineDefinition::triggers_early_exit`] so it can change in one place.
const CLARIFICATION_MARKER: &str = "clarification needed";

/// One stage of a pipeline: an id plus the agent that implements it.
#[derive(Clone)]
pub struct PipelineStage {
    pub agent_id: String,
    pub agent: Arc<dyn Agent>,
}

/// An ordered stage list defining one workflow type.
#[derive(Clone)]
pub struct PipelineDefinition {
    pub workflow_type: String,
    pub stages: Vec<PipelineStage>,
    /// Id of the stage whose "clarification needed" output short-circuits
    /// the pipeline, if the pipeline has one.
    pub clarification_stage: Option<String>,
}

impl PipelineDefinition {
    #[must_use]
    pub fn new(workflow_type: &str) -> Self {
        Self {
            workflow_type: workflow_type.to_string(),
            stages: Vec::new(),
            clarification_stage: None,
        }
    }

    #[must_use]
    pub fn with_stage(mut self, agent_id: &str, agent: Arc<dyn Agent>) -> Self {
        self.stages.push(PipelineStage {
            agent_id: agent_id.to_string(),
            agent,
        });
        self
    }

    #[must_use]
    pub fn with_clarification_stage(mut self, agent_id: &str) -> Self {
        self.clarification_stage = Some(agent_id.to_string());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.agent_id.as_str()).collect()
    }

    /// Whether `output` from `agent_id` short-circuits the pipeline.
    #[must_use]
    pub fn triggers_early_exit(&self, agent_id: &str, output: &str) -> bool {
        self.clarification_stage.as_deref() == Some(agent_id)
            && output.to_lowercase().contains(CLARIFICATION_MARKER)
    }
}

/// What a finished (or cancelled) run hands back.
#[derive(Clone, Debug)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub state: WorkflowState,
    /// Output of the last stage that ran (the clarification text on early
    /// exit, empty when nothing completed before cancellation).
    pub final_output: String,
    pub stage_results: FxHashMap<String, String>,
    pub completed_agents: Vec<String>,
    /// Checkpoint saves that failed and were swallowed during the run.
    pub checkpoint_save_failures: u64,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// Pause took effect at a stage boundary. A control-flow signal, not a
    /// failure: the carried checkpoint resumes the workflow.
    #[error("workflow {workflow_id} paused at checkpoint {checkpoint_id}: {reason}")]
    #[diagnostic(code(wayfarer::executor::paused))]
    Paused {
        workflow_id: String,
        checkpoint_id: String,
        reason: String,
    },

    /// A stage exhausted its retry budget; the workflow transitioned to
    /// Failed after writing an error-recovery checkpoint.
    #[error("stage {agent_id} of workflow {workflow_id} failed: {source}")]
    #[diagnostic(code(wayfarer::executor::stage))]
    Stage {
        workflow_id: String,
        agent_id: String,
        #[source]
        source: AgentError,
    },

    #[error("checkpoint not found: {0}")]
    #[diagnostic(code(wayfarer::executor::checkpoint_not_found))]
    CheckpointNotFound(String),

    #[error(transparent)]
    #[diagnostic(code(wayfarer::executor::snapshot))]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    #[diagnostic(code(wayfarer::executor::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(wayfarer::executor::transition))]
    Transition(#[from] ControllerError),
}

pub struct PipelineExecutor {
    controller: Arc<PauseResumeController>,
    store: Arc<CheckpointStore>,
    config: Arc<EngineConfig>,
    ids: IdGenerator,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new(
        controller: Arc<PauseResumeController>,
        store: Arc<CheckpointStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            controller,
            store,
            config,
            ids: IdGenerator::new(),
        }
    }

    /// Run a pipeline from the beginning.
    pub async fn run(
        &self,
        pipeline: &PipelineDefinition,
        user_input: &str,
        workflow_id: Option<String>,
    ) -> Result<WorkflowOutcome, ExecutorError> {
        self.run_with_metadata(pipeline, user_input, workflow_id, FxHashMap::default())
            .await
    }

    /// Run a pipeline from the beginning, attaching free-form metadata to
    /// the workflow record (and therefore every snapshot).
    #[instrument(skip_all, fields(workflow_type = %pipeline.workflow_type))]
    pub async fn run_with_metadata(
        &self,
        pipeline: &PipelineDefinition,
        user_input: &str,
        workflow_id: Option<String>,
        metadata: FxHashMap<String, serde_json::Value>,
    ) -> Result<WorkflowOutcome, ExecutorError> {
        let workflow_id = workflow_id.unwrap_or_else(|| self.ids.workflow_id());
        let token = self
            .controller
            .register(&workflow_id, &pipeline.workflow_type, pipeline.len());

        // A cancel can land between Start and the first boundary.
        if token.is_cancelled() || self.controller.signal(&workflow_id).cancel_requested {
            self.apply_transition(&workflow_id, WorkflowState::Cancelled, Some("cancelled before start"));
            self.controller.acknowledge_cancel(&workflow_id);
            self.controller.release(&workflow_id);
            return Ok(WorkflowOutcome {
                workflow_id,
                state: WorkflowState::Cancelled,
                final_output: String::new(),
                stage_results: FxHashMap::default(),
                completed_agents: Vec::new(),
                checkpoint_save_failures: 0,
            });
        }

        self.apply_transition(&workflow_id, WorkflowState::Running, None);

        let mut record = WorkflowRecord::new(&workflow_id, &pipeline.workflow_type, user_input);
        record.metadata = metadata;
        record.append_message(Message::user(user_input));
        self.drive(pipeline, record, false).await
    }

    /// Resume a workflow from a checkpoint, skipping completed stages.
    #[instrument(skip(self, pipeline), fields(workflow_type = %pipeline.workflow_type))]
    pub async fn resume(
        &self,
        pipeline: &PipelineDefinition,
        checkpoint_id: &str,
    ) -> Result<WorkflowOutcome, ExecutorError> {
        let checkpoint = self
            .store
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| ExecutorError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let mut record = decode_snapshot(&checkpoint.snapshot)?;
        record.clear_pause();

        self.controller
            .register(&record.workflow_id, &pipeline.workflow_type, pipeline.len());
        self.controller
            .on_workflow_resumed(&record.workflow_id, &checkpoint)?;
        info!(
            workflow_id = %record.workflow_id,
            checkpoint_id,
            completed = record.completed_agents.len(),
            "resuming workflow from checkpoint"
        );
        self.drive(pipeline, record, true).await
    }

    /// The main loop: one stage at a time, signals polled and checkpoints
    /// written at every boundary.
    async fn drive(
        &self,
        pipeline: &PipelineDefinition,
        mut record: WorkflowRecord,
        resumed: bool,
    ) -> Result<WorkflowOutcome, ExecutorError> {
        let workflow_id = record.workflow_id.clone();
        let token = self.controller.token(&workflow_id);
        let mut save_failures = 0u64;
        let mut last_auto_checkpoint = Instant::now();

        for (index, stage) in pipeline.stages.iter().enumerate() {
            if record.completed_agents.iter().any(|a| *a == stage.agent_id) {
                continue;
            }

            // Boundary: poll signals before committing to the stage.
            let signal = self.controller.signal(&workflow_id);
            if signal.cancel_requested || token.is_cancelled() {
                return Ok(self.finish_cancelled(&mut record, &mut save_failures).await);
            }
            if signal.pause_requested {
                let why = signal.reason.as_deref().unwrap_or("requested");
                return Err(self
                    .finish_paused(&mut record, why, &mut save_failures)
                    .await);
            }

            record.current_stage_index = index;
            record.current_agent_id = Some(stage.agent_id.clone());
            self.controller.update_progress(
                &workflow_id,
                index,
                Some(&stage.agent_id),
                &record.completed_agents,
            );

            if self.config.enable_auto_checkpoints
                && last_auto_checkpoint.elapsed() >= self.config.auto_checkpoint_interval
            {
                self.save_soft(&record, "auto", &mut save_failures).await;
                last_auto_checkpoint = Instant::now();
            }

            if self.config.checkpoint_after_each_agent {
                let reason = format!("before-{}", stage.agent_id);
                self.save_soft(&record, &reason, &mut save_failures).await;
            }

            match self.invoke_stage(stage, index, &record).await {
                Ok(response) => {
                    for message in response.messages {
                        let message = if message.agent_id.is_none() {
                            message.tagged(&stage.agent_id)
                        } else {
                            message
                        };
                        record.append_message(message);
                    }
                    record.record_stage_result(&stage.agent_id, response.output.clone());
                    self.controller.update_progress(
                        &workflow_id,
                        record.current_stage_index,
                        Some(&stage.agent_id),
                        &record.completed_agents,
                    );

                    if self.config.checkpoint_after_each_agent {
                        let reason = if resumed {
                            format!("resumed-after-{}", stage.agent_id)
                        } else {
                            format!("after-{}", stage.agent_id)
                        };
                        self.save_soft(&record, &reason, &mut save_failures).await;
                    }

                    if pipeline.triggers_early_exit(&stage.agent_id, &response.output) {
                        info!(
                            workflow_id = %workflow_id,
                            agent_id = %stage.agent_id,
                            "clarification requested; completing early"
                        );
                        self.apply_transition(
                            &workflow_id,
                            WorkflowState::Completed,
                            Some("clarification needed"),
                        );
                        self.controller.release(&workflow_id);
                        return Ok(WorkflowOutcome {
                            workflow_id,
                            state: WorkflowState::Completed,
                            final_output: response.output,
                            stage_results: record.stage_results,
                            completed_agents: record.completed_agents,
                            checkpoint_save_failures: save_failures,
                        });
                    }
                }
                Err(AgentError::Cancelled) => {
                    return Ok(self.finish_cancelled(&mut record, &mut save_failures).await);
                }
                Err(err) if token.is_cancelled() => {
                    // The stage surfaced some other error while cancellation
                    // was in flight; the cancel wins.
                    warn!(workflow_id = %workflow_id, error = %err, "stage error during cancellation");
                    return Ok(self.finish_cancelled(&mut record, &mut save_failures).await);
                }
                Err(err) => {
                    let reason = format!("error-recovery:{err}");
                    self.save_soft(&record, &reason, &mut save_failures).await;
                    self.apply_transition(
                        &workflow_id,
                        WorkflowState::Failed,
                        Some(&err.to_string()),
                    );
                    self.controller.release(&workflow_id);
                    return Err(ExecutorError::Stage {
                        workflow_id,
                        agent_id: stage.agent_id.clone(),
                        source: err,
                    });
                }
            }
        }

        // Final boundary: a cancel that landed during the last stage still
        // takes effect here.
        if self.controller.signal(&workflow_id).cancel_requested || token.is_cancelled() {
            return Ok(self.finish_cancelled(&mut record, &mut save_failures).await);
        }

        record.current_agent_id = None;
        self.save_soft(&record, "workflow-complete", &mut save_failures)
            .await;
        self.apply_transition(&workflow_id, WorkflowState::Completed, None);
        self.controller.release(&workflow_id);

        let final_output = record.last_stage_output().unwrap_or_default().to_string();
        Ok(WorkflowOutcome {
            workflow_id,
            state: WorkflowState::Completed,
            final_output,
            stage_results: record.stage_results,
            completed_agents: record.completed_agents,
            checkpoint_save_failures: save_failures,
        })
    }

    /// Decorate and invoke one stage under its configured hard timeout.
    async fn invoke_stage(
        &self,
        stage: &PipelineStage,
        index: usize,
        record: &WorkflowRecord,
    ) -> Result<crate::agents::AgentResponse, AgentError> {
        let policy = StagePolicy::default()
            .with_max_attempts(self.config.retry_budget(&stage.agent_id));
        let decorated = decorate(stage.agent.clone(), &policy);
        let ctx = AgentContext::new(
            &record.workflow_id,
            &stage.agent_id,
            index,
            self.controller.token(&record.workflow_id),
        );
        let timeout = self.config.stage_timeout(&stage.agent_id);
        let started = Instant::now();
        match tokio::time::timeout(timeout, decorated.run(&record.log, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                elapsed_ms: duration_ms(started.elapsed()),
            }),
        }
    }

    async fn finish_cancelled(
        &self,
        record: &mut WorkflowRecord,
        save_failures: &mut u64,
    ) -> WorkflowOutcome {
        let workflow_id = record.workflow_id.clone();
        self.save_soft(record, "cancelled", save_failures).await;
        self.apply_transition(&workflow_id, WorkflowState::Cancelled, Some("cancel requested"));
        self.controller.acknowledge_cancel(&workflow_id);
        self.controller.release(&workflow_id);
        WorkflowOutcome {
            workflow_id,
            state: WorkflowState::Cancelled,
            final_output: record.last_stage_output().unwrap_or_default().to_string(),
            stage_results: record.stage_results.clone(),
            completed_agents: record.completed_agents.clone(),
            checkpoint_save_failures: *save_failures,
        }
    }

    async fn finish_paused(
        &self,
        record: &mut WorkflowRecord,
        why: &str,
        save_failures: &mut u64,
    ) -> ExecutorError {
        let workflow_id = record.workflow_id.clone();
        record.mark_paused(why);
        let reason = format!("pause:{why}");
        let checkpoint_id = match self.save_checkpoint(record, &reason).await {
            Ok(checkpoint) => checkpoint.checkpoint_id,
            Err(err) => {
                // Without a pause checkpoint there is nothing to resume
                // from; surface the storage failure instead of pausing.
                warn!(workflow_id = %workflow_id, error = %err, "pause checkpoint failed");
                *save_failures += 1;
                self.apply_transition(&workflow_id, WorkflowState::Failed, Some("pause checkpoint failed"));
                self.controller.release(&workflow_id);
                return err.into();
            }
        };
        self.apply_transition(&workflow_id, WorkflowState::Paused, Some(why));
        self.controller.acknowledge_pause(&workflow_id);
        self.controller.release(&workflow_id);
        ExecutorError::Paused {
            workflow_id,
            checkpoint_id,
            reason,
        }
    }

    /// Save a checkpoint, reporting it to the controller on success.
    async fn save_checkpoint(
        &self,
        record: &WorkflowRecord,
        reason: &str,
    ) -> Result<WorkflowCheckpoint, StoreError> {
        let snapshot = encode_snapshot(record).map_err(StoreError::Snapshot)?;
        let checkpoint = self
            .store
            .save(SaveRequest {
                workflow_id: record.workflow_id.clone(),
                workflow_type: record.workflow_type.clone(),
                agent_id: record.current_agent_id.clone(),
                stage_index: record.current_stage_index,
                snapshot,
                label: None,
                metadata: CheckpointMetadata::automated(reason, record.completed_agents.clone()),
            })
            .await?;
        self.controller
            .on_checkpoint_saved(&record.workflow_id, &checkpoint);
        Ok(checkpoint)
    }

    /// Checkpoint whose failure must not abort a live workflow: log, count,
    /// move on.
    async fn save_soft(&self, record: &WorkflowRecord, reason: &str, save_failures: &mut u64) {
        if let Err(err) = self.save_checkpoint(record, reason).await {
            warn!(
                workflow_id = %record.workflow_id,
                reason,
                error = %err,
                "checkpoint save failed; continuing"
            );
            *save_failures += 1;
        }
    }

    /// Transitions the executor performs are legal by construction; a
    /// rejection here is logged by the controller and nothing else.
    fn apply_transition(&self, workflow_id: &str, next: WorkflowState, reason: Option<&str>) {
        let _ = self.controller.transition(workflow_id, next, reason);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
