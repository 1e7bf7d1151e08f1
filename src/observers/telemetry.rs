//! In-process telemetry fed by the observer fan-out.
//!
//! Counters, histograms, and gauges are kept behind one mutex and read back
//! through [`TelemetryObserver::snapshot`]. Series are keyed as
//! `name{label=value,…}` with labels in a fixed order, so tests and
//! exporters can address them as plain strings.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::workflow::WorkflowState;

use super::event::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
use super::subject::{Observer, ObserverError};

/// Point-in-time copy of every series.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub counters: FxHashMap<String, u64>,
    pub histograms: FxHashMap<String, Vec<f64>>,
    pub gauges: FxHashMap<String, i64>,
}

/// Aggregates workflow and checkpoint events into metric series.
#[derive(Default)]
pub struct TelemetryObserver {
    inner: Mutex<TelemetrySnapshot>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl TelemetryObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.lock().clone()
    }

    /// Current value of a counter series (0 when never incremented).
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.inner
            .lock()
            .counters
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Current value of a gauge series.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.inner
            .lock()
            .gauges
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Number of samples recorded into a histogram series.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        self.inner
            .lock()
            .histograms
            .get(&series_key(name, labels))
            .map_or(0, Vec::len)
    }

    fn add_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .inner
            .lock()
            .counters
            .entry(series_key(name, labels))
            .or_insert(0) += 1;
    }

    fn record(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.inner
            .lock()
            .histograms
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }

    fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let mut inner = self.inner.lock();
        let slot = inner.gauges.entry(series_key(name, labels)).or_insert(0);
        *slot = slot.saturating_add(delta);
    }
}

impl Observer<WorkflowStateEvent> for TelemetryObserver {
    fn observe(&self, event: &WorkflowStateEvent) -> Result<(), ObserverError> {
        let labels: &[(&str, &str)] = &[("type", event.workflow_type.as_str())];
        match event.next {
            WorkflowState::Queued => {}
            WorkflowState::Running => match event.previous {
                Some(WorkflowState::Paused) => {
                    self.add_counter("workflow.resumed.total", labels);
                    self.add_gauge("workflows.paused", labels, -1);
                    if let Some(paused_for) = event
                        .metadata
                        .get("paused_for_seconds")
                        .and_then(serde_json::Value::as_f64)
                    {
                        self.record("workflow.resume.latency.seconds", labels, paused_for);
                    }
                }
                _ => {
                    self.add_counter("workflow.started.total", labels);
                    self.add_gauge("workflows.active", labels, 1);
                }
            },
            WorkflowState::Paused => {
                self.add_counter("workflow.paused.total", labels);
                self.add_gauge("workflows.paused", labels, 1);
            }
            WorkflowState::Completed => {
                self.add_counter("workflow.completed.total", labels);
                self.add_gauge("workflows.active", labels, -1);
                if let Some(elapsed) = event.elapsed_seconds {
                    self.record("workflow.duration.seconds", labels, elapsed);
                }
            }
            WorkflowState::Failed => {
                self.add_counter("workflow.failed.total", labels);
                self.add_gauge("workflows.active", labels, -1);
                if let Some(elapsed) = event.elapsed_seconds {
                    self.record("workflow.duration.seconds", labels, elapsed);
                }
            }
            WorkflowState::Cancelled => {
                self.add_counter("workflow.cancelled.total", labels);
                if matches!(
                    event.previous,
                    Some(WorkflowState::Running) | Some(WorkflowState::Paused)
                ) {
                    self.add_gauge("workflows.active", labels, -1);
                }
                if matches!(event.previous, Some(WorkflowState::Paused)) {
                    self.add_gauge("workflows.paused", labels, -1);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        "TelemetryObserver".to_string()
    }
}

impl Observer<CheckpointEvent> for TelemetryObserver {
    fn observe(&self, event: &CheckpointEvent) -> Result<(), ObserverError> {
        let workflow_type = event.workflow_type.as_deref().unwrap_or("unknown");
        let automated = match event.automated {
            Some(true) => "true",
            Some(false) => "false",
            None => "unknown",
        };
        let labels: &[(&str, &str)] = &[("type", workflow_type), ("automated", automated)];
        match event.kind {
            CheckpointEventKind::Created => {
                self.add_counter("checkpoint.saved.total", labels);
                self.add_gauge("checkpoints.active", &[], 1);
                if let Some(size) = event.size_bytes {
                    self.record("checkpoint.size.bytes", labels, size as f64);
                    self.add_gauge("checkpoints.storage.bytes", &[], size as i64);
                }
                if let Some(latency) = event.latency_ms {
                    self.record("checkpoint.save.latency.ms", labels, latency);
                }
            }
            CheckpointEventKind::Loaded => {
                self.add_counter("checkpoint.loaded.total", labels);
                if let Some(latency) = event.latency_ms {
                    self.record("checkpoint.load.latency.ms", labels, latency);
                }
            }
            CheckpointEventKind::Deleted => {
                self.add_counter("checkpoint.deleted.total", labels);
                self.add_gauge("checkpoints.active", &[], -1);
                if let Some(size) = event.size_bytes {
                    self.add_gauge("checkpoints.storage.bytes", &[], -(size as i64));
                }
            }
            CheckpointEventKind::Validated => {
                self.add_counter("checkpoint.validated.total", labels);
            }
            CheckpointEventKind::Failed => {
                self.add_counter("checkpoint.errored.total", labels);
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        "TelemetryObserver".to_string()
    }
}
