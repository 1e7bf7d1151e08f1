//! Threshold alerting fed by the observer fan-out.
//!
//! Rules:
//! - `Failed` transition → critical alert.
//! - `Running` transition on a workflow older than the long-running
//!   threshold → warning.
//! - Cumulative checkpoint storage above the storage threshold → warning.
//! - `Failed` checkpoint event → validation-failure warning.
//!
//! Alerts are POSTed to an external endpoint as a JSON list of
//! `{labels, annotations, startsAt}` objects. The POST happens on a spawned
//! task; transport failures are logged and never propagate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::workflow::WorkflowState;

use super::event::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
use super::subject::{Observer, ObserverError};

pub struct AlertObserver {
    client: reqwest::Client,
    endpoint: String,
    service: String,
    long_running_threshold: Duration,
    storage_threshold_bytes: u64,
    storage_bytes: AtomicU64,
    storage_alert_raised: AtomicBool,
}

impl AlertObserver {
    #[must_use]
    pub fn new(
        endpoint: &str,
        service: &str,
        long_running_threshold: Duration,
        storage_threshold_bytes: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            service: service.to_string(),
            long_running_threshold,
            storage_threshold_bytes,
            storage_bytes: AtomicU64::new(0),
            storage_alert_raised: AtomicBool::new(false),
        }
    }

    /// Cumulative checkpoint storage observed so far.
    #[must_use]
    pub fn tracked_storage_bytes(&self) -> u64 {
        self.storage_bytes.load(Ordering::Relaxed)
    }

    fn alert(&self, alertname: &str, severity: &str, summary: String, description: String, workflow_id: Option<&str>) -> Value {
        let mut labels = json!({
            "alertname": alertname,
            "severity": severity,
            "service": self.service,
        });
        if let Some(id) = workflow_id {
            labels["workflow_id"] = json!(id);
        }
        json!({
            "labels": labels,
            "annotations": {
                "summary": summary,
                "description": description,
            },
            "startsAt": Utc::now().to_rfc3339(),
        })
    }

    fn dispatch(&self, alerts: Vec<Value>) {
        if alerts.is_empty() {
            return;
        }
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        // Fire and forget; callbacks must stay non-blocking. Outside a tokio
        // runtime (plain unit tests) the alert is dropped with a debug log.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match client.post(&endpoint).json(&alerts).send().await {
                        Ok(response) if !response.status().is_success() => {
                            warn!(status = %response.status(), "alert endpoint rejected alerts");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "failed to deliver alerts");
                        }
                    }
                });
            }
            Err(_) => {
                debug!(count = alerts.len(), "no async runtime; dropping alerts");
            }
        }
    }
}

impl Observer<WorkflowStateEvent> for AlertObserver {
    fn observe(&self, event: &WorkflowStateEvent) -> Result<(), ObserverError> {
        let mut alerts = Vec::new();
        match event.next {
            WorkflowState::Failed => {
                alerts.push(self.alert(
                    "WorkflowFailed",
                    "critical",
                    format!("workflow {} failed", event.workflow_id),
                    event
                        .reason
                        .clone()
                        .unwrap_or_else(|| "stage error exhausted its retry budget".to_string()),
                    Some(&event.workflow_id),
                ));
            }
            WorkflowState::Running => {
                if let Some(elapsed) = event.elapsed_seconds {
                    if elapsed > self.long_running_threshold.as_secs_f64() {
                        alerts.push(self.alert(
                            "WorkflowLongRunning",
                            "warning",
                            format!("workflow {} running for {elapsed:.0}s", event.workflow_id),
                            format!(
                                "exceeds the long-running threshold of {}s",
                                self.long_running_threshold.as_secs()
                            ),
                            Some(&event.workflow_id),
                        ));
                    }
                }
            }
            _ => {}
        }
        self.dispatch(alerts);
        Ok(())
    }

    fn name(&self) -> String {
        "AlertObserver".to_string()
    }
}

impl Observer<CheckpointEvent> for AlertObserver {
    fn observe(&self, event: &CheckpointEvent) -> Result<(), ObserverError> {
        let mut alerts = Vec::new();
        match event.kind {
            CheckpointEventKind::Created => {
                if let Some(size) = event.size_bytes {
                    let total = self.storage_bytes.fetch_add(size, Ordering::Relaxed) + size;
                    if total > self.storage_threshold_bytes
                        && !self.storage_alert_raised.swap(true, Ordering::Relaxed)
                    {
                        alerts.push(self.alert(
                            "CheckpointStorageHigh",
                            "warning",
                            format!("checkpoint storage at {total} bytes"),
                            format!(
                                "cumulative checkpoint storage exceeds {} bytes",
                                self.storage_threshold_bytes
                            ),
                            None,
                        ));
                    }
                }
            }
            CheckpointEventKind::Deleted => {
                if let Some(size) = event.size_bytes {
                    let total = self
                        .storage_bytes
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                            Some(current.saturating_sub(size))
                        })
                        .unwrap_or(0)
                        .saturating_sub(size);
                    if total <= self.storage_threshold_bytes {
                        self.storage_alert_raised.store(false, Ordering::Relaxed);
                    }
                }
            }
            CheckpointEventKind::Failed => {
                alerts.push(self.alert(
                    "CheckpointValidationFailed",
                    "warning",
                    format!("checkpoint {} failed", event.checkpoint_id),
                    event
                        .reason
                        .clone()
                        .unwrap_or_else(|| "checkpoint operation failed".to_string()),
                    Some(&event.workflow_id),
                ));
            }
            _ => {}
        }
        self.dispatch(alerts);
        Ok(())
    }

    fn name(&self) -> String {
        "AlertObserver".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer(storage_threshold: u64) -> AlertObserver {
        AlertObserver::new(
            "http://127.0.0.1:0/alerts",
            "wayfarer",
            Duration::from_secs(1800),
            storage_threshold,
        )
    }

    #[test]
    fn storage_accounting_follows_create_and_delete() {
        let alerts = observer(u64::MAX);
        let created = CheckpointEvent::new("ckpt_1", "wf_1", CheckpointEventKind::Created)
            .with_size(1000);
        Observer::<CheckpointEvent>::observe(&alerts, &created).unwrap();
        assert_eq!(alerts.tracked_storage_bytes(), 1000);

        let deleted = CheckpointEvent::new("ckpt_1", "wf_1", CheckpointEventKind::Deleted)
            .with_size(1000);
        Observer::<CheckpointEvent>::observe(&alerts, &deleted).unwrap();
        assert_eq!(alerts.tracked_storage_bytes(), 0);
    }

    #[test]
    fn alert_payload_has_alertmanager_shape() {
        let alerts = observer(0);
        let value = alerts.alert(
            "WorkflowFailed",
            "critical",
            "workflow wf_1 failed".to_string(),
            "details".to_string(),
            Some("wf_1"),
        );
        assert_eq!(value["labels"]["alertname"], "WorkflowFailed");
        assert_eq!(value["labels"]["severity"], "critical");
        assert_eq!(value["labels"]["service"], "wayfarer");
        assert_eq!(value["labels"]["workflow_id"], "wf_1");
        assert!(value["annotations"]["summary"].is_string());
        assert!(value["startsAt"].is_string());
    }
}
