//! Analytics Facade
//!
//! The handle application code holds. `track` and `flush` only submit
//! candidate actions; the queue changes when the channel executes them.
//!
//! ```text
//! track(props) ──▶ metadata + props ──▶ enqueue ──▶ [query] ──▶ [execute]
//!                                                                  │
//!                                           len ≥ threshold ◀──────┘
//!                                                  │
//!                    observers ◀── store ◀── [execute] ◀── flush
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::bindings::{
    submit_flush, AnalyticsBindings, AnalyticsGate, FlushSubmission, FlushTrigger,
};
use crate::actions::channel::ActionChannel;
use crate::actions::hooks::{flush_on_load_or_quit, HostHooks};
use crate::actions::protocol::ActionResult;
use crate::analytics::accumulator::{Accumulator, AccumulatorState, AnalyticsError};
use crate::analytics::event::{TrackProps, TrackedEvent};
use crate::analytics::metadata::MetadataProvider;
use crate::analytics::observer::{ObserverList, TrackCallback};
use crate::config::{ActionKeys, AnalyticsConfig, DEFAULT_PLUGIN_NAME};
use crate::core::hash::StateHash;
use crate::core::sync::lock;
use crate::storage::events::EventStore;
use crate::storage::kv::KeyValueStore;

/// Options applied by [`Analytics::init`].
#[derive(Clone)]
pub struct InitOptions {
    /// Tags `library.eventPluginSource` on every event.
    pub plugin_name: String,
    /// Flush threshold; the configured one is kept when `None`.
    pub flush_threshold: Option<f64>,
    /// Sole flush observer.
    pub track_callback: Option<TrackCallback>,
    /// Prefix for the action names.
    pub custom_namespace: Option<String>,
    /// Log queue activity.
    pub enable_debug_logging: bool,
}

impl InitOptions {
    /// Options for `plugin_name`, everything else default.
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            flush_threshold: None,
            track_callback: None,
            custom_namespace: None,
            enable_debug_logging: false,
        }
    }

    /// Set the flush threshold.
    pub fn with_flush_threshold(mut self, threshold: f64) -> Self {
        self.flush_threshold = Some(threshold);
        self
    }

    /// Set the flush observer.
    pub fn with_track_callback(mut self, callback: impl Fn(&TrackedEvent) + Send + Sync + 'static) -> Self {
        self.track_callback = Some(Arc::new(callback));
        self
    }

    /// Prefix the action names.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.custom_namespace = Some(namespace.into());
        self
    }

    /// Enable queue activity logging.
    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.enable_debug_logging = enabled;
        self
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        Self::new(DEFAULT_PLUGIN_NAME)
    }
}

struct AnalyticsInner {
    config: AnalyticsConfig,
    channel: Arc<dyn ActionChannel>,
    metadata: Arc<dyn MetadataProvider>,
    bindings: AnalyticsBindings,
    keys: RwLock<ActionKeys>,
    initialized: AtomicBool,
}

/// Event collector handle. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<AnalyticsInner>,
}

impl Analytics {
    /// Create a collector submitting through `channel` and storing into `storage`.
    ///
    /// Nothing is registered until [`init`](Self::init).
    pub fn new(
        config: &AnalyticsConfig,
        channel: Arc<dyn ActionChannel>,
        metadata: Arc<dyn MetadataProvider>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self, AnalyticsError> {
        let mut accumulator = Accumulator::new();
        accumulator.set_flush_threshold(config.flush_threshold)?;
        accumulator.set_debug_logging(config.enable_debug_logging);

        let bindings = AnalyticsBindings {
            accumulator: Arc::new(Mutex::new(accumulator)),
            gate: Arc::new(AnalyticsGate::default()),
            store: EventStore::new(storage, config.data_key.clone()),
            observers: Arc::new(ObserverList::new()),
        };

        Ok(Self {
            inner: Arc::new(AnalyticsInner {
                config: config.clone(),
                channel,
                metadata,
                bindings,
                keys: RwLock::new(config.action_keys()),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    /// Register the analytics actions, subscribe the load-or-quit flush and apply `options`.
    ///
    /// A second call changes nothing and returns
    /// [`AnalyticsError::DuplicateInitialization`]; the collector keeps working.
    pub fn init(&self, hooks: &dyn HostHooks, options: InitOptions) -> Result<(), AnalyticsError> {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("{}", AnalyticsError::DuplicateInitialization);
            return Err(AnalyticsError::DuplicateInitialization);
        }

        let threshold = match options.flush_threshold.map(Accumulator::normalize_threshold).transpose() {
            Ok(threshold) => threshold,
            Err(e) => {
                self.inner.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let keys = match &options.custom_namespace {
            Some(ns) => self.inner.config.clone().with_namespace(ns).action_keys(),
            None => self.inner.config.action_keys(),
        };

        if let Err(e) = self.inner.bindings.register(&self.inner.channel, &keys) {
            warn!("{} ({})", AnalyticsError::DuplicateInitialization, e);
            self.inner.initialized.store(false, Ordering::SeqCst);
            return Err(AnalyticsError::DuplicateInitialization);
        }

        {
            let mut acc = lock(&self.inner.bindings.accumulator);
            acc.set_plugin_name(options.plugin_name.clone());
            acc.set_debug_logging(options.enable_debug_logging || self.inner.config.enable_debug_logging);
            if let Some(threshold) = threshold {
                // Already validated and normalized.
                acc.set_flush_threshold(threshold as f64)?;
            }
        }
        if let Some(callback) = options.track_callback {
            self.inner.bindings.observers.replace(callback);
        }
        *self.inner.keys.write().unwrap_or_else(PoisonError::into_inner) = keys.clone();

        flush_on_load_or_quit(hooks, self);

        info!(
            "Analytics initialized for {} ({}, {})",
            options.plugin_name, keys.enqueue, keys.flush_and_save
        );
        Ok(())
    }

    /// Record an event. Accepts a bare name or full properties.
    ///
    /// Returns the event's message id. The event is queued once the channel
    /// accepts the enqueue; a refusal is logged and the event dropped.
    pub fn track(&self, props: impl Into<TrackProps>) -> Uuid {
        let props = props.into();
        let plugin_name = lock(&self.inner.bindings.accumulator).plugin_name().to_string();
        let event = TrackedEvent::new(self.inner.metadata.metadata(&plugin_name), props);
        let message_id = event.message_id;

        let args = match event.to_value() {
            Ok(args) => args,
            Err(e) => {
                error!("Could not encode event {}: {}", event.name(), e);
                return message_id;
            }
        };

        let name = event.properties.name;
        self.inner.channel.execute_action(
            &self.action_keys().enqueue,
            args,
            Some(Box::new(move |result: ActionResult| {
                if let Some(error) = result.error {
                    warn!("Dropped event {}: {}", name, AnalyticsError::ActionRejected(error));
                }
            })),
        );
        message_id
    }

    /// Submit the whole queue for storage. Returns whether anything was submitted.
    pub fn flush(&self) -> bool {
        self.flush_then(|_| {})
    }

    /// Like [`flush`](Self::flush), calling `on_settled` once the outcome is known.
    ///
    /// An empty queue settles immediately with `Ok`.
    pub fn flush_then(&self, on_settled: impl FnOnce(Result<(), AnalyticsError>) + Send + 'static) -> bool {
        let submission = submit_flush(
            &self.inner.bindings.accumulator,
            self.inner.channel.as_ref(),
            &self.action_keys().flush_and_save,
            FlushTrigger::Explicit,
            Some(Box::new(on_settled)),
        );
        matches!(submission, FlushSubmission::Submitted { .. })
    }

    /// Set the flush threshold (clamped to 1000, rounded up, at least 1).
    pub fn set_flush_threshold(&self, threshold: f64) -> Result<usize, AnalyticsError> {
        lock(&self.inner.bindings.accumulator).set_flush_threshold(threshold)
    }

    /// Replace all flush observers with `callback`.
    pub fn set_track_callback(&self, callback: impl Fn(&TrackedEvent) + Send + Sync + 'static) {
        self.inner.bindings.observers.replace(Arc::new(callback));
    }

    /// Add a flush observer after the existing ones.
    pub fn add_observer(&self, callback: impl Fn(&TrackedEvent) + Send + Sync + 'static) {
        self.inner.bindings.observers.push(Arc::new(callback));
    }

    /// Switch the analytics feature on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.bindings.gate.set_enabled(enabled);
    }

    /// Whether the analytics feature is on.
    pub fn is_enabled(&self) -> bool {
        self.inner.bindings.gate.is_enabled()
    }

    /// Whether `init` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Action names currently in use.
    pub fn action_keys(&self) -> ActionKeys {
        self.inner.keys.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current flush threshold.
    pub fn flush_threshold(&self) -> usize {
        lock(&self.inner.bindings.accumulator).flush_threshold()
    }

    /// Plugin name tagging new events.
    pub fn plugin_name(&self) -> String {
        lock(&self.inner.bindings.accumulator).plugin_name().to_string()
    }

    /// Number of queued events.
    pub fn queue_len(&self) -> usize {
        lock(&self.inner.bindings.accumulator).len()
    }

    /// Copy of the queued events.
    pub fn queued_events(&self) -> Vec<TrackedEvent> {
        lock(&self.inner.bindings.accumulator).queue().to_vec()
    }

    /// Accumulator state.
    pub fn state(&self) -> AccumulatorState {
        lock(&self.inner.bindings.accumulator).state()
    }

    /// Queue fingerprint.
    pub fn digest(&self) -> StateHash {
        lock(&self.inner.bindings.accumulator).digest()
    }

    /// Persisted events.
    pub fn store(&self) -> &EventStore {
        &self.inner.bindings.store
    }
}
