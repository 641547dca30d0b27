//! Event Store
//!
//! Flushed events are kept as a map from event name to the ordered list of events
//! recorded under that name, stored under a single key of the shared store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::analytics::event::TrackedEvent;
use crate::core::hash::{StateHash, StateHasher};
use crate::storage::kv::{KeyValueStore, StoreError};

/// Persisted layout: event name -> events in flush order.
pub type SavedEvents = BTreeMap<String, Vec<TrackedEvent>>;

/// Append-by-name persistence for flushed events.
#[derive(Clone)]
pub struct EventStore {
    storage: Arc<dyn KeyValueStore>,
    data_key: String,
}

impl EventStore {
    /// Create a store writing under `data_key` of `storage`.
    pub fn new(storage: Arc<dyn KeyValueStore>, data_key: impl Into<String>) -> Self {
        Self {
            storage,
            data_key: data_key.into(),
        }
    }

    /// Key the event map is stored under.
    pub fn data_key(&self) -> &str {
        &self.data_key
    }

    /// Read everything saved so far.
    pub fn load(&self) -> Result<SavedEvents, StoreError> {
        match self.storage.get(&self.data_key)? {
            Some(Value::Null) | None => Ok(SavedEvents::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    /// Events saved under one name, oldest first.
    pub fn events_named(&self, name: &str) -> Result<Vec<TrackedEvent>, StoreError> {
        Ok(self.load()?.remove(name).unwrap_or_default())
    }

    /// Append events to their name's sequence, in slice order.
    ///
    /// One read-modify-write of the whole map; nothing is written if any step fails.
    pub fn save_events(&self, events: &[TrackedEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut saved = self.load()?;
        for event in events {
            saved
                .entry(event.properties.name.clone())
                .or_default()
                .push(event.clone());
        }

        self.storage.set(&self.data_key, serde_json::to_value(&saved)?)?;
        debug!("Saved {} events under {}", events.len(), self.data_key);
        Ok(())
    }

    /// Total number of stored events.
    pub fn total_events(&self) -> Result<usize, StoreError> {
        Ok(self.load()?.values().map(Vec::len).sum())
    }

    /// Fingerprint of the stored data (names and message ids, in order).
    pub fn digest(&self) -> Result<StateHash, StoreError> {
        let saved = self.load()?;
        let mut hasher = StateHasher::for_store();
        hasher.update_u64(saved.len() as u64);
        for (name, events) in &saved {
            hasher.update_str(name);
            hasher.update_u64(events.len() as u64);
            for event in events {
                hasher.update_uuid(&event.message_id);
            }
        }
        Ok(hasher.finalize())
    }
}
