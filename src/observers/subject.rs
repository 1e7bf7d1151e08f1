//! Subject/observer plumbing.
//!
//! A [`Subject`] holds its observer list behind its own mutex. `notify` takes
//! a snapshot of the list under the lock, releases it, then invokes each
//! observer in subscription order. Observer failures are caught and logged;
//! they never propagate back into the executor. Per subject, notifications
//! for one workflow are therefore delivered in causal order.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use super::event::{CheckpointEvent, WorkflowStateEvent};

/// Error an observer may surface from its callback; logged, never rethrown.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives one category of event.
pub trait Observer<E>: Send + Sync {
    fn observe(&self, event: &E) -> Result<(), ObserverError>;

    /// Stable identifier; also the handle used to unsubscribe.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// One fan-out point for a single event category.
pub struct Subject<E> {
    observers: Mutex<Vec<Arc<dyn Observer<E>>>>,
}

impl<E> Default for Subject<E> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for Subject<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl<E> Subject<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<E>>) {
        self.observers.lock().push(observer);
    }

    /// Remove every observer with the given name. Returns how many were
    /// removed.
    pub fn unsubscribe(&self, name: &str) -> usize {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|o| o.name() != name);
        before - observers.len()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Deliver `event` to every observer, in order. Failures are logged and
    /// swallowed.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Arc<dyn Observer<E>>> = self.observers.lock().clone();
        for observer in snapshot {
            if let Err(err) = observer.observe(event) {
                warn!(observer = %observer.name(), error = %err, "observer failed; continuing");
            }
        }
    }
}

/// The two fan-out points of the engine.
#[derive(Debug, Default)]
pub struct ObserverHub {
    pub workflow_states: Subject<WorkflowStateEvent>,
    pub checkpoints: Subject<CheckpointEvent>,
}

impl ObserverHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Forwards events into a flume channel, for streaming consumers and tests.
pub struct ChannelObserver<E> {
    tx: flume::Sender<E>,
}

impl<E> ChannelObserver<E> {
    #[must_use]
    pub fn new(tx: flume::Sender<E>) -> Self {
        Self { tx }
    }
}

impl<E: Clone + Send + Sync> Observer<E> for ChannelObserver<E> {
    fn observe(&self, event: &E) -> Result<(), ObserverError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ObserverError::new("channel receiver dropped"))
    }

    fn name(&self) -> String {
        "ChannelObserver".to_string()
    }
}
