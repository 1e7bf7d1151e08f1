//! Observer fan-out integration: causal ordering, failure isolation, and
//! alert delivery over HTTP.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;

use wayfarer::observers::{
    AlertObserver, ChannelObserver, CheckpointEvent, CheckpointEventKind, Observer, ObserverHub,
    TelemetryObserver, WorkflowStateEvent,
};
use wayfarer::workflow::WorkflowState;

mod common;
use common::{ScriptedAgent, engine, research_pipeline};

#[tokio::test]
async fn a_full_run_feeds_telemetry_through_the_hub() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let telemetry = Arc::new(TelemetryObserver::new());
    engine.hub.workflow_states.subscribe(telemetry.clone());
    engine.hub.checkpoints.subscribe(telemetry.clone());

    let (clarify, _) = ScriptedAgent::new("Query is clear");
    let (brief, _) = ScriptedAgent::new("Brief: b");
    let (researcher, _) = ScriptedAgent::new("Facts: f");
    let pipeline = research_pipeline(clarify, brief, researcher);

    engine.executor.run(&pipeline, "input", None).await.unwrap();

    let labels: &[(&str, &str)] = &[("type", "research")];
    assert_eq!(telemetry.counter("workflow.started.total", labels), 1);
    assert_eq!(telemetry.counter("workflow.completed.total", labels), 1);
    assert_eq!(telemetry.gauge("workflows.active", labels), 0);
    // 3 before + 3 after + workflow-complete.
    assert_eq!(
        telemetry.counter(
            "checkpoint.saved.total",
            &[("type", "research"), ("automated", "true")]
        ),
        7
    );
    assert!(telemetry.gauge("checkpoints.storage.bytes", &[]) > 0);
    assert_eq!(
        telemetry.histogram_count("workflow.duration.seconds", labels),
        1
    );
}

#[tokio::test]
async fn checkpoint_events_arrive_in_causal_order_per_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let (tx, rx) = flume::unbounded();
    engine
        .hub
        .checkpoints
        .subscribe(Arc::new(ChannelObserver::new(tx)));

    let (clarify, _) = ScriptedAgent::new("Query is clear");
    let (brief, _) = ScriptedAgent::new("Brief: b");
    let (researcher, _) = ScriptedAgent::new("Facts: f");
    let pipeline = research_pipeline(clarify, brief, researcher);
    let outcome = engine.executor.run(&pipeline, "input", None).await.unwrap();

    let events: Vec<CheckpointEvent> = rx.drain().collect();
    let reasons: Vec<&str> = events
        .iter()
        .filter(|e| e.workflow_id == outcome.workflow_id)
        .filter_map(|e| e.reason.as_deref())
        .collect();
    assert_eq!(
        reasons,
        vec![
            "before-clarify",
            "after-clarify",
            "before-brief",
            "after-brief",
            "before-researcher",
            "after-researcher",
            "workflow-complete",
        ]
    );
    assert!(events.iter().all(|e| e.kind == CheckpointEventKind::Created));
}

#[tokio::test]
async fn failed_transitions_post_a_critical_alert() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/alerts")
                .json_body_includes(
                    r#"[{"labels": {"alertname": "WorkflowFailed", "severity": "critical"}}]"#,
                );
            then.status(200);
        })
        .await;

    let alerts = Arc::new(AlertObserver::new(
        &server.url("/alerts"),
        "wayfarer",
        Duration::from_secs(1800),
        u64::MAX,
    ));

    let event = WorkflowStateEvent {
        workflow_id: "wf_alert".to_string(),
        workflow_type: "research".to_string(),
        previous: Some(WorkflowState::Running),
        next: WorkflowState::Failed,
        at: chrono::Utc::now(),
        reason: Some("stage exhausted retries".to_string()),
        elapsed_seconds: Some(12.0),
        metadata: Default::default(),
    };
    Observer::<WorkflowStateEvent>::observe(&*alerts, &event).unwrap();

    // Delivery is fire-and-forget on a spawned task; poll briefly.
    for _ in 0..50 {
        if mock.hits_async().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn validation_failures_post_a_warning_alert() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/alerts").json_body_includes(
                r#"[{"labels": {"alertname": "CheckpointValidationFailed", "severity": "warning"}}]"#,
            );
            then.status(200);
        })
        .await;

    let alerts = Arc::new(AlertObserver::new(
        &server.url("/alerts"),
        "wayfarer",
        Duration::from_secs(1800),
        u64::MAX,
    ));
    let event = CheckpointEvent::new("ckpt_bad", "wf_alert", CheckpointEventKind::Failed)
        .with_reason("snapshot is not valid JSON: EOF");
    Observer::<CheckpointEvent>::observe(&*alerts, &event).unwrap();

    for _ in 0..50 {
        if mock.hits_async().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn storage_above_threshold_raises_one_warning() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/alerts").json_body_includes(
                r#"[{"labels": {"alertname": "CheckpointStorageHigh"}}]"#,
            );
            then.status(200);
        })
        .await;

    let alerts = Arc::new(AlertObserver::new(
        &server.url("/alerts"),
        "wayfarer",
        Duration::from_secs(1800),
        1000,
    ));

    // Two oversized checkpoints; the alert fires once, not per event.
    for id in ["ckpt_s1", "ckpt_s2"] {
        let event = CheckpointEvent::new(id, "wf_storage", CheckpointEventKind::Created)
            .with_size(900);
        Observer::<CheckpointEvent>::observe(&*alerts, &event).unwrap();
    }

    for _ in 0..50 {
        if mock.hits_async().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(alerts.tracked_storage_bytes(), 1800);
}

#[tokio::test]
async fn transport_failures_never_propagate() {
    // Nothing listens on this port; the observer must still return Ok.
    let alerts = Arc::new(AlertObserver::new(
        "http://127.0.0.1:9/alerts",
        "wayfarer",
        Duration::from_secs(1800),
        u64::MAX,
    ));
    let event = WorkflowStateEvent {
        workflow_id: "wf_x".to_string(),
        workflow_type: "research".to_string(),
        previous: Some(WorkflowState::Running),
        next: WorkflowState::Failed,
        at: chrono::Utc::now(),
        reason: None,
        elapsed_seconds: None,
        metadata: Default::default(),
    };
    assert!(Observer::<WorkflowStateEvent>::observe(&*alerts, &event).is_ok());
    // Give the spawned POST time to fail quietly.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn hub_isolation_between_subjects() {
    let hub = ObserverHub::new();
    let (state_tx, state_rx) = flume::unbounded();
    hub.workflow_states
        .subscribe(Arc::new(ChannelObserver::new(state_tx)));

    hub.checkpoints.notify(&CheckpointEvent::new(
        "ckpt_1",
        "wf_1",
        CheckpointEventKind::Created,
    ));
    assert!(state_rx.try_recv().is_err(), "wrong subject must stay silent");
}
