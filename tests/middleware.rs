//! Middleware behavior: retry budgets, back-off abort on cancellation, and
//! error passthrough.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use wayfarer::agents::middleware::{RetryMiddleware, StagePolicy, decorate};
use wayfarer::agents::{Agent, AgentContext, AgentError};

mod common;
use common::{FailingAgent, FlakyAgent, ScriptedAgent};

fn ctx(token: CancellationToken) -> AgentContext {
    AgentContext::new("wf_mw", "stage", 0, token)
}

#[tokio::test]
async fn retry_absorbs_transient_failures_within_budget() {
    let (flaky, calls) = FlakyAgent::new("finally", 2);
    let decorated = decorate(flaky, &StagePolicy::default().with_max_attempts(3));

    let response = decorated
        .run(&[], &ctx(CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(response.output, "finally");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_reraises_the_original_error_after_the_last_attempt() {
    let (failing, calls) = FailingAgent::new("backend down");
    let decorated = decorate(failing, &StagePolicy::default().with_max_attempts(2));

    let err = decorated
        .run(&[], &ctx(CancellationToken::new()))
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        AgentError::Provider { provider, message } => {
            assert_eq!(provider, "test");
            assert_eq!(message, "backend down");
        }
        other => panic!("expected the raw provider error, got {other}"),
    }
}

#[tokio::test]
async fn a_budget_of_one_means_no_retry() {
    let (failing, calls) = FailingAgent::new("once");
    let decorated = decorate(failing, &StagePolicy::default());

    decorated
        .run(&[], &ctx(CancellationToken::new()))
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_is_never_retried() {
    struct CancelledAgent;

    #[async_trait::async_trait]
    impl wayfarer::agents::Agent for CancelledAgent {
        async fn run(
            &self,
            _messages: &[wayfarer::message::Message],
            _ctx: &AgentContext,
        ) -> Result<wayfarer::agents::AgentResponse, AgentError> {
            Err(AgentError::Cancelled)
        }
    }

    let decorated = decorate(
        Arc::new(CancelledAgent),
        &StagePolicy::default().with_max_attempts(5),
    );
    let started = Instant::now();
    let err = decorated
        .run(&[], &ctx(CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    // No back-off sleeps happened.
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn cancellation_aborts_a_pending_backoff() {
    let (failing, calls) = FailingAgent::new("always");
    let retry = Arc::new(RetryMiddleware::new(
        failing,
        10,
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));

    let token = CancellationToken::new();
    let context = ctx(token.clone());
    let handle = tokio::spawn(async move {
        wayfarer::agents::Agent::run(&*retry, &[], &context).await
    });

    // First attempt fails immediately; the middleware is now sleeping a
    // 5-second back-off. Cancel instead of waiting it out.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no further attempts after cancel");
}

#[tokio::test]
async fn successful_stages_pass_through_untouched() {
    let (scripted, calls) = ScriptedAgent::new("unchanged output");
    let decorated = decorate(scripted, &StagePolicy::default().with_max_attempts(3));

    let response = decorated
        .run(&[], &ctx(CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(response.output, "unchanged output");
    assert_eq!(response.messages.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
