//! Collector Configuration
//!
//! Action names and storage keys are configuration, not literals, so several
//! plugins can embed the collector in one host without clashing.

use std::path::PathBuf;

/// Default number of queued events that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 25;

/// Hard cap on queued events; thresholds are clamped to it.
pub const MAX_QUEUE_LENGTH: usize = 1000;

/// Default plugin name used to tag metadata before `init`.
pub const DEFAULT_PLUGIN_NAME: &str = "openrct2-analytics-sdk";

/// Names of the two replicated analytics actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionKeys {
    /// Enqueue one event.
    pub enqueue: String,
    /// Flush and save queued events.
    pub flush_and_save: String,
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Version reported in `library.pluginVersion`.
    pub plugin_version: String,
    /// Action name for enqueueing an event.
    pub analytics_event_enqueue_key: String,
    /// Action name for flushing the queue to storage.
    pub analytics_flush_and_save_key: String,
    /// Shared-storage key holding saved events.
    pub data_key: String,
    /// Park-storage key holding the park id.
    pub park_id_key: String,
    /// Threshold applied at startup (overridden by `init`).
    pub flush_threshold: f64,
    /// Log queue activity.
    pub enable_debug_logging: bool,
    /// File backing the shared store (binary only; `None` keeps it in memory).
    pub store_path: Option<PathBuf>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            analytics_event_enqueue_key: "analytics.enqueue".to_string(),
            analytics_flush_and_save_key: "analytics.flushAndSave".to_string(),
            data_key: "analytics.events".to_string(),
            park_id_key: "analytics.parkId".to_string(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD as f64,
            enable_debug_logging: false,
            store_path: None,
        }
    }
}

impl AnalyticsConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(version) = std::env::var("ANALYTICS_PLUGIN_VERSION") {
            config.plugin_version = version;
        }
        if let Some(threshold) = std::env::var("ANALYTICS_FLUSH_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            config.flush_threshold = threshold;
        }
        config.enable_debug_logging = std::env::var("ANALYTICS_DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        config.store_path = std::env::var("ANALYTICS_STORE_PATH").ok().map(PathBuf::from);

        match std::env::var("ANALYTICS_NAMESPACE") {
            Ok(ns) if !ns.is_empty() => config.with_namespace(&ns),
            _ => config,
        }
    }

    /// Prefix the action names with a namespace (`"{ns}.{key}"`).
    ///
    /// Storage keys are left alone: saved events stay readable whichever
    /// plugin wrote them.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.analytics_event_enqueue_key = namespaced(namespace, &self.analytics_event_enqueue_key);
        self.analytics_flush_and_save_key = namespaced(namespace, &self.analytics_flush_and_save_key);
        self
    }

    /// The configured action names.
    pub fn action_keys(&self) -> ActionKeys {
        ActionKeys {
            enqueue: self.analytics_event_enqueue_key.clone(),
            flush_and_save: self.analytics_flush_and_save_key.clone(),
        }
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}.{}", namespace, key)
}
