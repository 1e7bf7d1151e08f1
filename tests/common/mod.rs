//! Shared helpers for integration tests: scripted agents and a pre-wired
//! engine over a temporary storage directory.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use wayfarer::agents::{Agent, AgentContext, AgentError, AgentResponse};
use wayfarer::checkpoint::CheckpointStore;
use wayfarer::config::EngineConfig;
use wayfarer::controller::PauseResumeController;
use wayfarer::executor::{PipelineDefinition, PipelineExecutor};
use wayfarer::message::Message;
use wayfarer::observers::ObserverHub;

/// Engine wiring shared by most tests: file-only storage in a temp dir.
pub struct TestEngine {
    pub hub: Arc<ObserverHub>,
    pub controller: Arc<PauseResumeController>,
    pub store: Arc<CheckpointStore>,
    pub executor: PipelineExecutor,
    pub config: Arc<EngineConfig>,
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_file_backend_only()
        .with_storage_dir(dir)
}

pub fn engine_with_config(config: EngineConfig) -> TestEngine {
    wayfarer::utils::init_tracing();
    let hub = Arc::new(ObserverHub::new());
    let controller = Arc::new(PauseResumeController::new(hub.clone()));
    let store = Arc::new(CheckpointStore::file_only(&config, hub.clone()));
    let config = Arc::new(config);
    let executor = PipelineExecutor::new(controller.clone(), store.clone(), config.clone());
    TestEngine {
        hub,
        controller,
        store,
        executor,
        config,
    }
}

pub fn engine(dir: &Path) -> TestEngine {
    engine_with_config(test_config(dir))
}

/// Always succeeds with a fixed output, counting invocations.
pub struct ScriptedAgent {
    output: String,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(output: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                output: output.to_string(),
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(
        &self,
        _messages: &[Message],
        _ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentResponse::text(&self.output))
    }
}

/// Always fails, counting invocations.
pub struct FailingAgent {
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingAgent {
    pub fn new(message: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                message: message.to_string(),
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Agent for FailingAgent {
    async fn run(
        &self,
        _messages: &[Message],
        _ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Provider {
            provider: "test",
            message: self.message.clone(),
        })
    }
}

/// Fails the first `fail_times` invocations, then succeeds.
pub struct FlakyAgent {
    output: String,
    fail_times: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyAgent {
    pub fn new(output: &str, fail_times: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                output: output.to_string(),
                fail_times,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    async fn run(
        &self,
        _messages: &[Message],
        _ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            Err(AgentError::Other(format!("transient failure {attempt}")))
        } else {
            Ok(AgentResponse::text(&self.output))
        }
    }
}

/// Blocks after entry until released, reporting entry and observing the
/// cancellation token. Lets tests land pause/cancel requests while a stage
/// is deterministically in flight.
pub struct GatedAgent {
    output: String,
    entered_tx: flume::Sender<()>,
    release_rx: flume::Receiver<()>,
    calls: Arc<AtomicUsize>,
    observed_cancel: Arc<AtomicBool>,
}

pub struct GateHandle {
    entered_rx: flume::Receiver<()>,
    release_tx: flume::Sender<()>,
    pub calls: Arc<AtomicUsize>,
    pub observed_cancel: Arc<AtomicBool>,
}

impl GateHandle {
    /// Wait until the stage is in flight.
    pub async fn entered(&self) {
        self.entered_rx
            .recv_async()
            .await
            .expect("gated agent dropped before entering");
    }

    /// Let the stage finish.
    pub fn release(&self) {
        let _ = self.release_tx.send(());
    }
}

impl GatedAgent {
    pub fn new(output: &str) -> (Arc<Self>, GateHandle) {
        let (entered_tx, entered_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded();
        let calls = Arc::new(AtomicUsize::new(0));
        let observed_cancel = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                output: output.to_string(),
                entered_tx,
                release_rx,
                calls: calls.clone(),
                observed_cancel: observed_cancel.clone(),
            }),
            GateHandle {
                entered_rx,
                release_tx,
                calls,
                observed_cancel,
            },
        )
    }
}

#[async_trait]
impl Agent for GatedAgent {
    async fn run(
        &self,
        _messages: &[Message],
        ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered_tx.send(());
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                self.observed_cancel.store(true, Ordering::SeqCst);
                Err(AgentError::Cancelled)
            }
            _ = self.release_rx.recv_async() => Ok(AgentResponse::text(&self.output)),
        }
    }
}

/// The canonical three-stage research pipeline of the test suite.
pub fn research_pipeline(
    clarify: Arc<dyn Agent>,
    brief: Arc<dyn Agent>,
    researcher: Arc<dyn Agent>,
) -> PipelineDefinition {
    PipelineDefinition::new("research")
        .with_stage("clarify", clarify)
        .with_stage("brief", brief)
        .with_stage("researcher", researcher)
        .with_clarification_stage("clarify")
}
