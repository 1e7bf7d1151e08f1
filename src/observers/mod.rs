//! Observer fan-out: two subjects (workflow-state and checkpoint events),
//! plus the built-in telemetry and alert sinks.
//!
//! Delivery is serialized per subject: the observer list is snapshotted
//! under the subject's lock, then each observer is invoked in order.
//! Observer failures are caught and logged; they never reach the executor.

pub mod alerts;
pub mod event;
pub mod subject;
pub mod telemetry;

pub use alerts::AlertObserver;
pub use event::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
pub use subject::{ChannelObserver, Observer, ObserverError, ObserverHub, Subject};
pub use telemetry::{TelemetryObserver, TelemetrySnapshot};
