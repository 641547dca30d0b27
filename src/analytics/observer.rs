//! Flush observers.

use std::sync::{Arc, PoisonError, RwLock};

use crate::analytics::event::TrackedEvent;

/// Called once per event after a flush was durably stored.
pub type TrackCallback = Arc<dyn Fn(&TrackedEvent) + Send + Sync>;

/// Ordered observer list.
#[derive(Default)]
pub struct ObserverList {
    callbacks: RwLock<Vec<TrackCallback>>,
}

impl ObserverList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every observer with `callback`.
    pub fn replace(&self, callback: TrackCallback) {
        *self.callbacks.write().unwrap_or_else(PoisonError::into_inner) = vec![callback];
    }

    /// Append an observer.
    pub fn push(&self, callback: TrackCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Remove all observers.
    pub fn clear(&self) {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether there are no observers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer for every event, events in slice order.
    ///
    /// Observers run on a snapshot of the list, so they may register others.
    pub fn notify(&self, events: &[TrackedEvent]) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if callbacks.is_empty() {
            return;
        }
        for event in events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }
}
