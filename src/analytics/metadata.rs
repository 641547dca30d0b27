//! Event Metadata
//!
//! Assembles the context snapshot attached to each tracked event from the host's
//! current state, plus a fresh message id and timestamp.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::analytics::event::{
    EventContext, EventMetadata, InGameDate, LibraryContext, NetworkContext, NetworkMode,
    ParkContext, ScenarioInfo,
};
use crate::core::clock::{iso_timestamp, new_message_id};
use crate::storage::kv::KeyValueStore;
use crate::storage::park::get_park_id;

/// Produces metadata for a new event.
pub trait MetadataProvider: Send + Sync {
    /// Snapshot the context and generate a message id and timestamp.
    fn metadata(&self, plugin_name: &str) -> EventMetadata;
}

/// Read-only view of the host's current state.
pub trait HostContext: Send + Sync {
    /// Loaded scenario and park name.
    fn scenario(&self) -> ScenarioInfo;
    /// Current in-game date.
    fn in_game_date(&self) -> InGameDate;
    /// Host plugin API version.
    fn api_version(&self) -> u32;
    /// Network mode of this participant.
    fn network_mode(&self) -> NetworkMode;
    /// Host execution mode.
    fn mode(&self) -> String;
}

// =============================================================================
// HOST-BACKED PROVIDER
// =============================================================================

/// Builds metadata from a live host and park-scoped storage.
pub struct HostMetadata {
    host: Arc<dyn HostContext>,
    park_storage: Arc<dyn KeyValueStore>,
    park_id_key: String,
    plugin_version: String,
}

impl HostMetadata {
    /// Create a provider.
    pub fn new(
        host: Arc<dyn HostContext>,
        park_storage: Arc<dyn KeyValueStore>,
        park_id_key: impl Into<String>,
        plugin_version: impl Into<String>,
    ) -> Self {
        Self {
            host,
            park_storage,
            park_id_key: park_id_key.into(),
            plugin_version: plugin_version.into(),
        }
    }
}

impl MetadataProvider for HostMetadata {
    fn metadata(&self, plugin_name: &str) -> EventMetadata {
        // An unreadable park store must not stop tracking; the event goes out with id 0.
        let park_id = get_park_id(self.park_storage.as_ref(), &self.park_id_key)
            .unwrap_or_else(|e| {
                warn!("Could not read park id: {}", e);
                0
            });

        EventMetadata {
            context: EventContext {
                park: ParkContext {
                    id: park_id,
                    scenario: self.host.scenario(),
                    in_game_date: self.host.in_game_date(),
                },
                library: LibraryContext {
                    plugin_version: self.plugin_version.clone(),
                    api_version: self.host.api_version(),
                    event_plugin_source: plugin_name.to_string(),
                },
                network: NetworkContext {
                    network_mode: self.host.network_mode(),
                },
                mode: self.host.mode(),
            },
            message_id: new_message_id(),
            timestamp: iso_timestamp(),
        }
    }
}

// =============================================================================
// STATIC PROVIDER
// =============================================================================

/// Fixed context with fresh ids and timestamps. Useful off-host.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    context: EventContext,
}

impl StaticMetadata {
    /// Create a provider that always reports `context`.
    pub fn new(context: EventContext) -> Self {
        Self { context }
    }
}

impl MetadataProvider for StaticMetadata {
    fn metadata(&self, plugin_name: &str) -> EventMetadata {
        let mut context = self.context.clone();
        context.library.event_plugin_source = plugin_name.to_string();
        EventMetadata {
            context,
            message_id: new_message_id(),
            timestamp: iso_timestamp(),
        }
    }
}

// =============================================================================
// SIMULATED HOST
// =============================================================================

/// Days in each park month (March through October).
const DAYS_IN_MONTH: [u32; 8] = [31, 30, 31, 30, 31, 31, 30, 31];

/// Ticks in one in-game day.
const TICKS_PER_DAY: u64 = 400;

/// Mutable host state behind [`SimulatedHost`].
#[derive(Debug, Clone)]
pub struct HostState {
    /// Loaded scenario.
    pub scenario: ScenarioInfo,
    /// Current calendar position.
    pub date: InGameDate,
    /// Host plugin API version.
    pub api_version: u32,
    /// Single player, server or client.
    pub network_mode: NetworkMode,
    /// Host execution mode.
    pub mode: String,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            scenario: ScenarioInfo::default(),
            date: InGameDate {
                year: 1,
                month: 0,
                day: 1,
                ticks_elapsed: 0,
                month_progress: 0,
            },
            api_version: 77,
            network_mode: NetworkMode::None,
            mode: "normal".to_string(),
        }
    }
}

/// In-process stand-in for the host game, driven by the caller.
#[derive(Debug, Default)]
pub struct SimulatedHost {
    state: RwLock<HostState>,
}

impl SimulatedHost {
    /// Create a host with the given starting state.
    pub fn new(state: HostState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a scenario.
    pub fn load_scenario(&self, scenario: ScenarioInfo) {
        self.write(|s| s.scenario = scenario);
    }

    /// Switch network mode.
    pub fn set_network_mode(&self, mode: NetworkMode) {
        self.write(|s| s.network_mode = mode);
    }

    /// Advance the simulation clock by `ticks`, rolling days, months and years.
    pub fn advance_ticks(&self, ticks: u64) {
        self.write(|s| {
            let date = &mut s.date;
            for _ in 0..ticks {
                date.ticks_elapsed += 1;
                if date.ticks_elapsed % TICKS_PER_DAY != 0 {
                    continue;
                }
                date.day += 1;
                let month_index = (date.month as usize) % DAYS_IN_MONTH.len();
                if date.day > DAYS_IN_MONTH[month_index] {
                    date.day = 1;
                    date.month += 1;
                    if date.month as usize >= DAYS_IN_MONTH.len() {
                        date.month = 0;
                        date.year += 1;
                    }
                }
                let days = DAYS_IN_MONTH[date.month as usize % DAYS_IN_MONTH.len()];
                date.month_progress = (date.day - 1) * 0x10000 / days;
            }
        });
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> HostState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn write(&self, f: impl FnOnce(&mut HostState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }
}

impl HostContext for SimulatedHost {
    fn scenario(&self) -> ScenarioInfo {
        self.snapshot().scenario
    }

    fn in_game_date(&self) -> InGameDate {
        self.snapshot().date
    }

    fn api_version(&self) -> u32 {
        self.snapshot().api_version
    }

    fn network_mode(&self) -> NetworkMode {
        self.snapshot().network_mode
    }

    fn mode(&self) -> String {
        self.snapshot().mode
    }
}
