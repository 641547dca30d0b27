//! Analytics Module
//!
//! Event model, metadata, the accumulator reducer and the facade.
//!
//! ## Module Structure
//!
//! - `event`: Tracked event and its context snapshot
//! - `metadata`: Context assembly from the host
//! - `accumulator`: Queue, threshold and flush transitions
//! - `observer`: Flush observers
//! - `tracker`: `Analytics` handle (`init`, `track`, `flush`)

pub mod event;
pub mod metadata;
pub mod accumulator;
pub mod observer;
pub mod tracker;

// Re-export key types
pub use event::{EventContext, EventMetadata, NetworkMode, TrackProps, TrackedEvent};
pub use metadata::{HostContext, HostMetadata, MetadataProvider, SimulatedHost, StaticMetadata};
pub use accumulator::{Accumulator, AccumulatorState, AnalyticsError, EnqueueOutcome};
pub use observer::{ObserverList, TrackCallback};
pub use tracker::{Analytics, InitOptions};
