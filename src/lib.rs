//! # Park Analytics
//!
//! Buffered analytics collector for park sessions. Application code tracks
//! events; the collector enriches them with park context, queues them and
//! writes them to durable storage in batches. Every queue change goes through a
//! replicated action channel so all participants of a multiplayer session hold
//! the same queue and store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PARK ANALYTICS                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Shared primitives                        │
//! │  ├── clock.rs     - Message ids and timestamps               │
//! │  ├── hash.rs      - Queue and store digests                  │
//! │  └── sync.rs      - Lock helpers                             │
//! │                                                              │
//! │  analytics/       - Collector (deterministic reducer)        │
//! │  ├── event.rs     - Tracked event and context snapshot       │
//! │  ├── metadata.rs  - Context assembly from the host           │
//! │  ├── accumulator.rs - Queue, threshold, flush transitions    │
//! │  ├── observer.rs  - Flush observers                          │
//! │  └── tracker.rs   - `Analytics` facade                       │
//! │                                                              │
//! │  actions/         - Two-phase named actions                  │
//! │  ├── protocol.rs  - Results and session frames               │
//! │  ├── channel.rs   - Registration, local FIFO dispatch        │
//! │  ├── session.rs   - Sequencer and replicated participants    │
//! │  ├── bindings.rs  - enqueue / flushAndSave actions           │
//! │  └── hooks.rs     - Load-or-quit final flush                 │
//! │                                                              │
//! │  storage/         - Durable state                            │
//! │  ├── kv.rs        - Memory and JSON file key/value stores    │
//! │  ├── events.rs    - Append-by-name event store               │
//! │  └── park.rs      - Park id                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Guarantee
//!
//! `track` and `flush` only submit candidate actions. The queue changes in
//! the execute phase, which every participant runs for every accepted action
//! in one global order. Given the same committed log, every replica ends with
//! the same queue digest and the same stored events.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod config;
pub mod analytics;
pub mod actions;
pub mod storage;

// Re-export commonly used types
pub use config::{AnalyticsConfig, DEFAULT_FLUSH_THRESHOLD, MAX_QUEUE_LENGTH};
pub use analytics::{Analytics, AnalyticsError, InitOptions, TrackProps, TrackedEvent};
pub use actions::{ActionChannel, HookRegistry, LocalActionChannel, Participant, Sequencer};
pub use storage::{EventStore, JsonFileStore, KeyValueStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
