//! # Wayfarer: a resumable research-workflow execution core
//!
//! Wayfarer drives long-running, multi-stage pipelines of black-box *agents*
//! safely across failures and user intervention: start, advance, pause at
//! stage boundaries, persist state, resume from persisted state, cancel,
//! observe.
//!
//! ## Core concepts
//!
//! - **Agents**: async units of work behind one trait ([`agents::Agent`]),
//!   decorated with logging / timing / retry middleware
//! - **Pipelines**: ordered stage lists defining a workflow type
//! - **Checkpoints**: self-contained snapshots written at every stage
//!   boundary; the unit of atomic progress
//! - **Controller**: the pause/resume/cancel control plane and the sole
//!   arbiter of state transitions
//! - **Observers**: fan-out of workflow-state and checkpoint events into
//!   telemetry and alerting
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use wayfarer::agents::{Agent, AgentContext, AgentError, AgentResponse};
//! use wayfarer::config::EngineConfig;
//! use wayfarer::executor::PipelineDefinition;
//! use wayfarer::message::Message;
//! use wayfarer::service::WorkflowService;
//!
//! struct ClarifyAgent;
//!
//! #[async_trait]
//! impl Agent for ClarifyAgent {
//!     async fn run(
//!         &self,
//!         _messages: &[Message],
//!         _ctx: &AgentContext,
//!     ) -> Result<AgentResponse, AgentError> {
//!         Ok(AgentResponse::text("Query is clear"))
//!     }
//! }
//!
//! # async fn example() {
//! let service = WorkflowService::new(EngineConfig::from_env()).await;
//! service.register_pipeline(
//!     PipelineDefinition::new("research")
//!         .with_stage("clarify", Arc::new(ClarifyAgent))
//!         .with_clarification_stage("clarify"),
//! );
//! let receipt = service
//!     .start_workflow("research", "What is quantum computing?")
//!     .unwrap();
//! println!("accepted {}", receipt.workflow_id);
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`message`] — append-only conversation log entries
//! - [`workflow`] — workflow records and the state machine
//! - [`agents`] — the stage contract and middleware decorators
//! - [`checkpoint`] — snapshot serialization, back-ends, and the store
//! - [`controller`] — pause/resume/cancel signals and transitions
//! - [`executor`] — the per-workflow stage loop
//! - [`observers`] — subject/observer fan-out, telemetry, alerts
//! - [`service`] — the control surface the HTTP boundary consumes
//! - [`config`] — every recognized engine option

pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod executor;
pub mod message;
pub mod observers;
pub mod service;
pub mod utils;
pub mod workflow;
