//! Tracked Events
//!
//! The committed unit of telemetry and the context snapshot it carries.
//! Field names follow the stored JSON layout (camelCase).

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

// =============================================================================
// CONTEXT SNAPSHOT
// =============================================================================

/// Scenario the park was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioInfo {
    /// Scenario file on disk.
    pub file_name: String,
    /// Scenario display name.
    pub scenario_name: String,
    /// Park name chosen by the player.
    pub name: String,
}

/// In-game calendar position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InGameDate {
    /// Park year, starting at 1.
    pub year: u32,
    /// Month index (0 = March).
    pub month: u32,
    /// Day of the month, starting at 1.
    pub day: u32,
    /// Ticks since the park opened.
    pub ticks_elapsed: u64,
    /// Progress through the current month.
    pub month_progress: u32,
}

/// Park identity and position in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkContext {
    /// Session-scoped park id (see `storage::park`).
    pub id: i64,
    /// Scenario the park came from.
    pub scenario: ScenarioInfo,
    /// Calendar position when the event was built.
    pub in_game_date: InGameDate,
}

/// Versions of the collector and host API that produced the event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryContext {
    /// Collector version.
    pub plugin_version: String,
    /// Host plugin API version.
    pub api_version: u32,
    /// Name of the plugin that embeds the collector.
    pub event_plugin_source: String,
}

/// Host network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Single player.
    #[default]
    None,
    /// Hosting a multiplayer session.
    Server,
    /// Joined a multiplayer session.
    Client,
}

/// Network side of the context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContext {
    /// Host network mode.
    pub network_mode: NetworkMode,
}

/// Context snapshot attached to every event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Park identity and date.
    pub park: ParkContext,
    /// Collector and plugin versions.
    pub library: LibraryContext,
    /// Network mode.
    pub network: NetworkContext,
    /// Host execution mode (`normal`, `title`, `scenario_editor`, ...).
    pub mode: String,
}

// =============================================================================
// PROPERTIES
// =============================================================================

/// Key reserved for the event name inside `properties`.
pub const NAME_PROPERTY: &str = "name";

/// Caller-supplied event properties.
///
/// `name` is the logical event type; everything else is kept verbatim.
/// Additional properties never contain [`NAME_PROPERTY`], so the serialized
/// object always carries the real name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackProps {
    /// Event name, also the key the event is stored under.
    pub name: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TrackProps {
    /// Properties carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }

    /// Add a property (builder style).
    ///
    /// A property under [`NAME_PROPERTY`] is dropped; set `name` instead.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a property. Returns `false` if `key` is reserved.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if key == NAME_PROPERTY {
            warn!("Ignoring reserved property {:?} on event {}", NAME_PROPERTY, self.name);
            return false;
        }
        self.extra.insert(key, value.into());
        true
    }

    /// Look up an additional property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Additional properties, without the name.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

impl From<&str> for TrackProps {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for TrackProps {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

// =============================================================================
// TRACKED EVENT
// =============================================================================

/// Metadata produced for one event before the caller's properties are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    /// Context snapshot.
    pub context: EventContext,
    /// Fresh message id.
    pub message_id: Uuid,
    /// ISO-8601 creation time.
    pub timestamp: String,
}

/// A committed unit of telemetry.
///
/// Immutable once built: owned by the pending submission, then the queue,
/// then the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    /// Context snapshot taken at `track` time.
    pub context: EventContext,
    /// Globally unique id, used by downstream consumers for dedup/ordering.
    #[serde(rename = "messageID")]
    pub message_id: Uuid,
    /// ISO-8601 creation time.
    pub timestamp: String,
    /// Caller properties.
    pub properties: TrackProps,
}

impl TrackedEvent {
    /// Attach properties to freshly generated metadata.
    pub fn new(metadata: EventMetadata, properties: TrackProps) -> Self {
        Self {
            context: metadata.context,
            message_id: metadata.message_id,
            timestamp: metadata.timestamp,
            properties,
        }
    }

    /// Logical event name.
    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// Serialize to a JSON value (action args, storage).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
