//! Stage middleware: logging, timing, and retry decorators.
//!
//! Middleware are plain structs, each holding the next layer as an
//! `Arc<dyn Agent>` — a composable decorator list, not an inheritance
//! hierarchy. [`decorate`] assembles the canonical chain
//! `Retry → Timing → Logging → stage`, which guarantees that every retry
//! attempt is individually timed and logged, and that the retry layer sees
//! raw stage errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::Message;

use super::{Agent, AgentContext, AgentError, AgentResponse};

/// Per-stage decoration knobs.
#[derive(Clone, Debug)]
pub struct StagePolicy {
    /// Total invocation attempts (1 = no retry).
    pub max_attempts: u32,
    /// Latency above this logs a slow-stage warning.
    pub slow_threshold: Duration,
    /// Base back-off delay; attempt `k` waits `min(base · 2^k, cap)`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            slow_threshold: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
        }
    }
}

impl StagePolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

/// Wrap a stage in the canonical middleware chain.
///
/// Outermost to innermost: `Retry → Timing → Logging → stage`.
#[must_use]
pub fn decorate(stage: Arc<dyn Agent>, policy: &StagePolicy) -> Arc<dyn Agent> {
    let logged = Arc::new(LoggingMiddleware::new(stage));
    let timed = Arc::new(TimingMiddleware::new(logged, policy.slow_threshold));
    Arc::new(RetryMiddleware::new(
        timed,
        policy.max_attempts,
        policy.backoff_base,
        policy.backoff_cap,
    ))
}

/// Emits a structured record on stage entry and exit. Stateless.
pub struct LoggingMiddleware {
    inner: Arc<dyn Agent>,
}

impl LoggingMiddleware {
    #[must_use]
    pub fn new(inner: Arc<dyn Agent>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Agent for LoggingMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let input_preview = messages
            .last()
            .map(|m| truncate(&m.content, 120))
            .unwrap_or_default();
        info!(
            workflow_id = %ctx.workflow_id,
            agent_id = %ctx.agent_id,
            stage_index = ctx.stage_index,
            input_messages = messages.len(),
            %input_preview,
            "stage starting"
        );
        match self.inner.run(messages, ctx).await {
            Ok(response) => {
                info!(
                    workflow_id = %ctx.workflow_id,
                    agent_id = %ctx.agent_id,
                    output_messages = response.messages.len(),
                    "stage succeeded"
                );
                Ok(response)
            }
            Err(err) => {
                warn!(
                    workflow_id = %ctx.workflow_id,
                    agent_id = %ctx.agent_id,
                    error = %err,
                    "stage failed"
                );
                Err(err)
            }
        }
    }
}

/// Measures wall-clock latency; warns past the slow threshold. Does not
/// alter the response.
pub struct TimingMiddleware {
    inner: Arc<dyn Agent>,
    slow_threshold: Duration,
}

impl TimingMiddleware {
    #[must_use]
    pub fn new(inner: Arc<dyn Agent>, slow_threshold: Duration) -> Self {
        Self {
            inner,
            slow_threshold,
        }
    }
}

#[async_trait]
impl Agent for TimingMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let started = Instant::now();
        let result = self.inner.run(messages, ctx).await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_threshold {
            warn!(
                workflow_id = %ctx.workflow_id,
                agent_id = %ctx.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow stage"
            );
        } else {
            debug!(
                workflow_id = %ctx.workflow_id,
                agent_id = %ctx.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "stage timing"
            );
        }
        result
    }
}

/// Re-invokes the wrapped stage up to `max_attempts` times on retryable
/// errors, with capped exponential back-off between attempts. Cancellation
/// aborts immediately; the last failure is re-raised unchanged.
pub struct RetryMiddleware {
    inner: Arc<dyn Agent>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl RetryMiddleware {
    #[must_use]
    pub fn new(
        inner: Arc<dyn Agent>,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

#[async_trait]
impl Agent for RetryMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut attempt = 1u32;
        loop {
            match self.inner.run(messages, ctx).await {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    debug!(
                        workflow_id = %ctx.workflow_id,
                        agent_id = %ctx.agent_id,
                        attempts = attempt,
                        "retry budget exhausted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        workflow_id = %ctx.workflow_id,
                        agent_id = %ctx.agent_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "stage attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancellation.cancelled() => return Err(AgentError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
