//! The control surface the HTTP boundary consumes.
//!
//! [`WorkflowService`] wires the controller, checkpoint store, and executor
//! together and exposes exactly the operations an external request layer
//! needs: start, status, pause, resume, cancel, and checkpoint CRUD. Response
//! shapes are serde structs matching the wire contract; transient statuses
//! (`"Pausing"`, `"Cancelling"`) exist only in action receipts, never in the
//! state machine.
//!
//! Workflows execute on spawned tasks, one per workflow, gated by a
//! semaphore: over the concurrency cap they simply stay Queued until a
//! permit frees.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStatistics, CheckpointStore, WorkflowCheckpoint};
use crate::config::{EngineConfig, StorageBackendKind};
use crate::controller::PauseResumeController;
use crate::executor::{ExecutorError, PipelineDefinition, PipelineExecutor};
use crate::observers::{AlertObserver, ObserverHub, TelemetryObserver};
use crate::utils::IdGenerator;
use crate::workflow::WorkflowState;

/// Transient wire status returned by `pause` while the executor drains the
/// in-flight stage.
pub const STATUS_PAUSING: &str = "Pausing";
/// Transient wire status returned by `cancel`.
pub const STATUS_CANCELLING: &str = "Cancelling";

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    #[diagnostic(code(wayfarer::service::invalid_request))]
    InvalidRequest(String),

    #[error("not found: {0}")]
    #[diagnostic(code(wayfarer::service::not_found))]
    NotFound(String),

    /// The state machine does not allow the requested action right now.
    #[error("conflict: {0}")]
    #[diagnostic(code(wayfarer::service::conflict))]
    Conflict(String),

    #[error("storage failure: {0}")]
    #[diagnostic(code(wayfarer::service::storage))]
    Storage(String),
}

/// Result of `start_workflow`.
#[derive(Clone, Debug, Serialize)]
pub struct StartReceipt {
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Progress block inside a status view.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowProgress {
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
}

/// Result of `get_status`.
#[derive(Clone, Debug, Serialize)]
pub struct StatusView {
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub progress: WorkflowProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_checkpoint_id: Option<String>,
}

/// Result of pause/resume/cancel.
#[derive(Clone, Debug, Serialize)]
pub struct ActionReceipt {
    pub workflow_id: String,
    pub action: String,
    pub success: bool,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// A checkpoint without its snapshot body; what listings and lookups return.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointView {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub stage_index: usize,
    pub schema_version: u32,
    pub state_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub automated: bool,
    pub reason: String,
    pub completed_agents: Vec<String>,
}

impl From<&WorkflowCheckpoint> for CheckpointView {
    fn from(checkpoint: &WorkflowCheckpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            workflow_id: checkpoint.workflow_id.clone(),
            workflow_type: checkpoint.workflow_type.clone(),
            created_at: checkpoint.created_at,
            agent_id: checkpoint.agent_id.clone(),
            stage_index: checkpoint.stage_index,
            schema_version: checkpoint.schema_version,
            state_size_bytes: checkpoint.state_size_bytes,
            label: checkpoint.label.clone(),
            automated: checkpoint.metadata.automated,
            reason: checkpoint.metadata.reason.clone(),
            completed_agents: checkpoint.metadata.completed_agents.clone(),
        }
    }
}

/// One page of a checkpoint listing, newest first.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointPage {
    pub checkpoints: Vec<CheckpointView>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
}

/// Result of `validate_checkpoint`.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub checkpoint_id: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub validation_messages: Vec<String>,
}

/// Result of delete operations.
#[derive(Clone, Debug, Serialize)]
pub struct DeleteReceipt {
    pub deleted_count: usize,
    pub deleted_checkpoint_ids: Vec<String>,
    pub message: String,
}

pub struct WorkflowService {
    config: Arc<EngineConfig>,
    hub: Arc<ObserverHub>,
    controller: Arc<PauseResumeController>,
    store: Arc<CheckpointStore>,
    executor: Arc<PipelineExecutor>,
    pipelines: Mutex<FxHashMap<String, Arc<PipelineDefinition>>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<FxHashMap<String, JoinHandle<()>>>,
    ids: IdGenerator,
}

impl WorkflowService {
    /// Build a service, connecting the primary back-end when configured.
    /// A primary that fails to connect degrades to file-only storage with a
    /// warning, matching the fallback contract.
    pub async fn new(config: EngineConfig) -> Self {
        let hub = Arc::new(ObserverHub::new());
        let primary = Self::connect_primary(&config).await;
        let store = Arc::new(CheckpointStore::new(&config, primary, hub.clone()));
        Self::with_parts(config, hub, store)
    }

    /// Assemble from pre-built parts; used by tests that need a specific
    /// store or hub.
    #[must_use]
    pub fn with_parts(
        config: EngineConfig,
        hub: Arc<ObserverHub>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        let config = Arc::new(config);
        let controller = Arc::new(PauseResumeController::new(hub.clone()));
        let executor = Arc::new(PipelineExecutor::new(
            controller.clone(),
            store.clone(),
            config.clone(),
        ));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));
        Self {
            config,
            hub,
            controller,
            store,
            executor,
            pipelines: Mutex::new(FxHashMap::default()),
            permits,
            tasks: Mutex::new(FxHashMap::default()),
            ids: IdGenerator::new(),
        }
    }

    #[cfg(feature = "sqlite")]
    async fn connect_primary(
        config: &EngineConfig,
    ) -> Option<Arc<dyn crate::checkpoint::CheckpointBackend>> {
        if config.storage_backend != StorageBackendKind::PrimaryWithFileFallback {
            return None;
        }
        match crate::checkpoint::SqliteBackend::connect(&config.primary_database_url).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                warn!(
                    url = %config.primary_database_url,
                    error = %err,
                    "primary backend unavailable; degrading to file storage"
                );
                None
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    async fn connect_primary(
        config: &EngineConfig,
    ) -> Option<Arc<dyn crate::checkpoint::CheckpointBackend>> {
        if config.storage_backend == StorageBackendKind::PrimaryWithFileFallback {
            warn!("built without the sqlite feature; degrading to file storage");
        }
        None
    }

    /// Register a pipeline definition under its workflow type.
    pub fn register_pipeline(&self, pipeline: PipelineDefinition) {
        self.pipelines
            .lock()
            .insert(pipeline.workflow_type.clone(), Arc::new(pipeline));
    }

    /// Subscribe a telemetry observer to both subjects and hand it back for
    /// scraping.
    pub fn attach_telemetry(&self) -> Arc<TelemetryObserver> {
        let telemetry = Arc::new(TelemetryObserver::new());
        self.hub.workflow_states.subscribe(telemetry.clone());
        self.hub.checkpoints.subscribe(telemetry.clone());
        telemetry
    }

    /// Subscribe an alert observer posting to `endpoint`, using the
    /// configured long-running and storage thresholds.
    pub fn attach_alerting(&self, endpoint: &str) -> Arc<AlertObserver> {
        let alerts = Arc::new(AlertObserver::new(
            endpoint,
            "wayfarer",
            self.config.long_running_threshold,
            self.config.storage_alert_threshold_bytes,
        ));
        self.hub.workflow_states.subscribe(alerts.clone());
        self.hub.checkpoints.subscribe(alerts.clone());
        alerts
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<ObserverHub> {
        &self.hub
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<PauseResumeController> {
        &self.controller
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Accept a workflow and queue it for execution. The optional config map
    /// becomes the workflow record's free-form metadata and rides along in
    /// every snapshot.
    pub fn start_workflow(
        &self,
        workflow_type: &str,
        input: &str,
    ) -> Result<StartReceipt, ServiceError> {
        self.start_workflow_with_config(workflow_type, input, None)
    }

    /// [`start_workflow`](Self::start_workflow) with an explicit config map.
    pub fn start_workflow_with_config(
        &self,
        workflow_type: &str,
        input: &str,
        config: Option<FxHashMap<String, serde_json::Value>>,
    ) -> Result<StartReceipt, ServiceError> {
        if input.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "workflow input must not be empty".to_string(),
            ));
        }
        let pipeline = self
            .pipelines
            .lock()
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!("unknown workflow type: {workflow_type}"))
            })?;
        if pipeline.is_empty() {
            return Err(ServiceError::InvalidRequest(format!(
                "workflow type {workflow_type} has no stages"
            )));
        }

        let workflow_id = self.ids.workflow_id();
        let created_at = Utc::now();
        self.controller
            .register(&workflow_id, workflow_type, pipeline.len());

        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let input = input.to_string();
        let task_workflow_id = workflow_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match executor
                .run_with_metadata(
                    &pipeline,
                    &input,
                    Some(task_workflow_id.clone()),
                    config.unwrap_or_default(),
                )
                .await
            {
                Ok(outcome) => {
                    info!(
                        workflow_id = %outcome.workflow_id,
                        state = %outcome.state,
                        "workflow finished"
                    );
                }
                Err(ExecutorError::Paused {
                    workflow_id,
                    checkpoint_id,
                    ..
                }) => {
                    debug!(%workflow_id, %checkpoint_id, "workflow paused");
                }
                Err(err) => {
                    error!(workflow_id = %task_workflow_id, error = %err, "workflow failed");
                }
            }
        });
        self.tasks.lock().insert(workflow_id.clone(), handle);

        info!(workflow_id = %workflow_id, workflow_type, "workflow accepted");
        Ok(StartReceipt {
            workflow_id,
            status: WorkflowState::Queued.as_str().to_string(),
            created_at,
            message: Some("workflow accepted".to_string()),
        })
    }

    /// Live status of a workflow.
    pub fn get_status(&self, workflow_id: &str) -> Result<StatusView, ServiceError> {
        let state = self
            .controller
            .try_execution_state(workflow_id)
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {workflow_id}")))?;
        let elapsed_seconds = state
            .elapsed()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let completed = state.completed_agents.len();
        let estimated_remaining_seconds = if completed > 0
            && !state.state.is_terminal()
            && state.total_stages > completed
        {
            Some(elapsed_seconds / completed as f64 * (state.total_stages - completed) as f64)
        } else {
            None
        };
        Ok(StatusView {
            workflow_id: state.workflow_id.clone(),
            status: state.state.as_str().to_string(),
            created_at: state.created_at,
            started_at: state.started_at,
            progress: WorkflowProgress {
                current_step: state.current_stage_index,
                total_steps: state.total_stages,
                current_agent: state.current_agent_id.clone(),
                elapsed_seconds,
                estimated_remaining_seconds,
            },
            latest_checkpoint_id: state.latest_checkpoint_id,
        })
    }

    /// Ask a Running workflow to pause at its next stage boundary.
    pub fn pause(&self, workflow_id: &str) -> Result<ActionReceipt, ServiceError> {
        let state = self
            .controller
            .try_execution_state(workflow_id)
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {workflow_id}")))?;
        if state.state != WorkflowState::Running {
            return Err(ServiceError::Conflict(format!(
                "workflow {workflow_id} is {}, not Running",
                state.state
            )));
        }
        self.controller.request_pause(workflow_id, None);
        Ok(ActionReceipt {
            workflow_id: workflow_id.to_string(),
            action: "pause".to_string(),
            success: true,
            status: STATUS_PAUSING.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Resume a Paused workflow from its latest checkpoint.
    pub async fn resume(&self, workflow_id: &str) -> Result<ActionReceipt, ServiceError> {
        let state = self
            .controller
            .try_execution_state(workflow_id)
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {workflow_id}")))?;
        if state.state != WorkflowState::Paused {
            return Err(ServiceError::Conflict(format!(
                "workflow {workflow_id} is {}, not Paused",
                state.state
            )));
        }
        let pipeline = self
            .pipelines
            .lock()
            .get(&state.workflow_type)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("pipeline for type {}", state.workflow_type))
            })?;
        let checkpoint = self
            .store
            .latest(workflow_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("no checkpoint for workflow {workflow_id}"))
            })?;

        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let task_workflow_id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match executor
                .resume(&pipeline, &checkpoint.checkpoint_id)
                .await
            {
                Ok(outcome) => {
                    info!(
                        workflow_id = %outcome.workflow_id,
                        state = %outcome.state,
                        "resumed workflow finished"
                    );
                }
                Err(ExecutorError::Paused {
                    workflow_id,
                    checkpoint_id,
                    ..
                }) => {
                    debug!(%workflow_id, %checkpoint_id, "resumed workflow paused again");
                }
                Err(err) => {
                    error!(workflow_id = %task_workflow_id, error = %err, "resumed workflow failed");
                }
            }
        });
        self.tasks.lock().insert(workflow_id.to_string(), handle);

        Ok(ActionReceipt {
            workflow_id: workflow_id.to_string(),
            action: "resume".to_string(),
            success: true,
            status: WorkflowState::Running.as_str().to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Request cancellation. Takes effect at the next stage boundary.
    pub fn cancel(&self, workflow_id: &str) -> Result<ActionReceipt, ServiceError> {
        if self.controller.try_execution_state(workflow_id).is_none() {
            return Err(ServiceError::NotFound(format!("workflow {workflow_id}")));
        }
        self.controller.request_cancel(workflow_id);
        Ok(ActionReceipt {
            workflow_id: workflow_id.to_string(),
            action: "cancel".to_string(),
            success: true,
            status: STATUS_CANCELLING.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Page through a workflow's checkpoints, newest first. `page` is
    /// 1-based.
    pub async fn list_checkpoints(
        &self,
        workflow_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<CheckpointPage, ServiceError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let all = self
            .store
            .list_for_workflow(workflow_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        let total_count = all.len();
        let checkpoints = all
            .iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(CheckpointView::from)
            .collect();
        Ok(CheckpointPage {
            checkpoints,
            page,
            page_size,
            total_count,
        })
    }

    pub async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<CheckpointView, ServiceError> {
        let checkpoint = self
            .store
            .load(checkpoint_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        Ok(CheckpointView::from(&checkpoint))
    }

    pub async fn get_latest_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<CheckpointView, ServiceError> {
        let checkpoint = self
            .store
            .latest(workflow_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("no checkpoint for workflow {workflow_id}"))
            })?;
        Ok(CheckpointView::from(&checkpoint))
    }

    /// Validate a checkpoint without mutating anything.
    pub async fn validate_checkpoint(&self, checkpoint_id: &str) -> ValidationReport {
        let (is_valid, error_message) = self.store.validate(checkpoint_id).await;
        let validation_messages = if is_valid {
            vec![
                "checkpoint record found".to_string(),
                "snapshot is non-empty".to_string(),
                "snapshot parses as JSON".to_string(),
            ]
        } else {
            error_message.clone().into_iter().collect()
        };
        ValidationReport {
            checkpoint_id: checkpoint_id.to_string(),
            is_valid,
            error_message,
            validation_messages,
        }
    }

    /// Delete one checkpoint; missing ids are not errors.
    pub async fn delete_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<DeleteReceipt, ServiceError> {
        let deleted = self
            .store
            .delete(checkpoint_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        Ok(if deleted {
            DeleteReceipt {
                deleted_count: 1,
                deleted_checkpoint_ids: vec![checkpoint_id.to_string()],
                message: format!("deleted checkpoint {checkpoint_id}"),
            }
        } else {
            DeleteReceipt {
                deleted_count: 0,
                deleted_checkpoint_ids: vec![],
                message: format!("checkpoint {checkpoint_id} not found; nothing deleted"),
            }
        })
    }

    /// Delete every checkpoint of a workflow.
    pub async fn delete_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<DeleteReceipt, ServiceError> {
        let deleted_checkpoint_ids = self
            .store
            .delete_for_workflow(workflow_id)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        Ok(DeleteReceipt {
            deleted_count: deleted_checkpoint_ids.len(),
            message: format!(
                "deleted {} checkpoint(s) for workflow {workflow_id}",
                deleted_checkpoint_ids.len()
            ),
            deleted_checkpoint_ids,
        })
    }

    /// Scan-based store statistics.
    pub async fn checkpoint_statistics(&self) -> Result<CheckpointStatistics, ServiceError> {
        self.store
            .statistics()
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))
    }

    /// Cancel every live workflow and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.controller.shutdown();
        let handles: Vec<(String, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        for (workflow_id, handle) in handles {
            if let Err(err) = handle.await {
                warn!(%workflow_id, error = %err, "workflow task join failed during shutdown");
            }
        }
    }

    /// Block until the workflow's task (if any) has exited. Test helper;
    /// status queries remain valid afterwards.
    pub async fn wait_for(&self, workflow_id: &str) {
        let handle = self.tasks.lock().remove(workflow_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
