//! The stage contract.
//!
//! A pipeline stage (an *agent*) is any object exposing one asynchronous
//! operation: [`Agent::run`], taking the workflow's message log and returning
//! new messages plus a textual output. Agents must be stateless across calls:
//! re-invoking one with identical input must be safe, which is what makes
//! retry and resume possible.
//!
//! Middleware decorates agents without changing the contract; see
//! [`middleware`].

pub mod middleware;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

pub use middleware::{LoggingMiddleware, RetryMiddleware, StagePolicy, TimingMiddleware, decorate};

/// Execution context handed to each stage invocation.
///
/// Carries the workflow identity for logging and the workflow's cancellation
/// token. Stages doing long I/O should honor the token promptly; the executor
/// additionally checks it at every stage boundary.
#[derive(Clone, Debug)]
pub struct AgentContext {
    pub workflow_id: String,
    pub agent_id: String,
    /// 0-based index of this stage in the pipeline.
    pub stage_index: usize,
    pub cancellation: CancellationToken,
}

impl AgentContext {
    #[must_use]
    pub fn new(workflow_id: &str, agent_id: &str, stage_index: usize, cancellation: CancellationToken) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            agent_id: agent_id.to_string(),
            stage_index,
            cancellation,
        }
    }
}

/// What a stage hands back on success.
#[derive(Clone, Debug, Default)]
pub struct AgentResponse {
    /// Messages to append to the workflow log. The executor tags each with
    /// the agent id if the stage did not.
    pub messages: Vec<Message>,
    /// The stage's textual result, recorded in the stage-result map.
    pub output: String,
}

impl AgentResponse {
    /// Response carrying one assistant message whose content is the output.
    #[must_use]
    pub fn text(output: &str) -> Self {
        Self {
            messages: vec![Message::assistant(output)],
            output: output.to_string(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

/// Errors a stage can raise.
///
/// `Cancelled` is special: retry middleware aborts immediately instead of
/// re-attempting, and the executor converts it into a `Cancelled` workflow
/// outcome rather than a failure.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    /// The workflow's cancellation token fired while the stage was running.
    #[error("stage cancelled")]
    #[diagnostic(code(wayfarer::agent::cancelled))]
    Cancelled,

    /// The stage exceeded its configured hard timeout.
    #[error("stage timed out after {elapsed_ms} ms")]
    #[diagnostic(
        code(wayfarer::agent::timeout),
        help("Raise the per-stage timeout for this agent or split the stage.")
    )]
    Timeout { elapsed_ms: u64 },

    /// An upstream provider (LLM, search, scraper) rejected the call.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(wayfarer::agent::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// The stage considered its input unusable.
    #[error("invalid stage input: {0}")]
    #[diagnostic(code(wayfarer::agent::invalid_input))]
    InvalidInput(String),

    /// Anything else the stage wants to surface.
    #[error("stage error: {0}")]
    #[diagnostic(code(wayfarer::agent::other))]
    Other(String),
}

impl AgentError {
    /// `true` for errors retry middleware is allowed to absorb.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentError::Cancelled)
    }
}

/// A single pipeline stage.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use wayfarer::agents::{Agent, AgentContext, AgentError, AgentResponse};
/// use wayfarer::message::Message;
///
/// struct EchoAgent;
///
/// #[async_trait]
/// impl Agent for EchoAgent {
///     async fn run(
///         &self,
///         messages: &[Message],
///         _ctx: &AgentContext,
///     ) -> Result<AgentResponse, AgentError> {
///         let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
///         Ok(AgentResponse::text(last))
///     }
/// }
/// ```
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the stage against the current message log.
    async fn run(
        &self,
        messages: &[Message],
        ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError>;
}
