//! Storage Layer
//!
//! Durable state owned by the host: shared and park-scoped JSON key/value
//! stores, the append-by-name event store, and the park id.

pub mod kv;
pub mod events;
pub mod park;

pub use kv::{KeyValueStore, MemoryStore, JsonFileStore, StoreError};
pub use events::{EventStore, SavedEvents};
pub use park::get_park_id;
