//! Analytics Action Bindings
//!
//! Exposes the accumulator's two transitions as named actions. The query phase
//! only validates; all queue changes happen in the execute phase, which the
//! channel runs once per accepted submission in the global order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::actions::channel::{ActionChannel, ActionHandler, ChannelError, ResultCallback};
use crate::actions::protocol::{ActionError, ActionErrorCode, ActionResult};
use crate::analytics::accumulator::{Accumulator, AnalyticsError, EnqueueOutcome};
use crate::analytics::event::TrackedEvent;
use crate::analytics::observer::ObserverList;
use crate::config::ActionKeys;
use crate::core::sync::lock;
use crate::storage::events::EventStore;

/// Accumulator shared between the facade and the bindings.
pub type SharedAccumulator = Arc<Mutex<Accumulator>>;

/// Receives the outcome of a submitted flush.
pub type FlushCallback = Box<dyn FnOnce(Result<(), AnalyticsError>) + Send>;

// =============================================================================
// GATE
// =============================================================================

/// Host-side switch for the analytics feature.
#[derive(Debug)]
pub struct AnalyticsGate {
    enabled: AtomicBool,
}

impl AnalyticsGate {
    /// Create a gate.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Whether analytics is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Switch analytics on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Query-phase check.
    pub fn check(&self) -> Result<(), ActionError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(ActionError::disabled())
        }
    }
}

impl Default for AnalyticsGate {
    fn default() -> Self {
        Self::new(true)
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// `enqueue(event)`: append one event, submit a flush when the threshold is reached.
pub struct EnqueueAction {
    accumulator: SharedAccumulator,
    gate: Arc<AnalyticsGate>,
    channel: Weak<dyn ActionChannel>,
    flush_key: String,
}

impl ActionHandler for EnqueueAction {
    fn query(&self, _args: &Value) -> ActionResult {
        if let Err(error) = self.gate.check() {
            return ActionResult::rejected(error);
        }
        let acc = lock(&self.accumulator);
        if !acc.has_capacity() {
            return ActionResult::rejected(queue_full(acc.len()));
        }
        ActionResult::ok()
    }

    fn execute(&self, args: Value) -> ActionResult {
        let event = match TrackedEvent::from_value(args.clone()) {
            Ok(event) => event,
            Err(e) => return ActionResult::rejected(ActionError::invalid_args(e)),
        };

        let outcome = lock(&self.accumulator).apply_enqueue(event);
        match outcome {
            Ok(EnqueueOutcome::Queued { .. }) => {}
            Ok(EnqueueOutcome::FlushDue { .. }) => {
                if let Some(channel) = self.channel.upgrade() {
                    submit_flush(
                        &self.accumulator,
                        channel.as_ref(),
                        &self.flush_key,
                        FlushTrigger::Threshold,
                        None,
                    );
                }
            }
            Err(e) => return ActionResult::rejected(action_error(&e)),
        }

        ActionResult::with_data(args)
    }
}

/// `flush(events)`: persist a queue prefix, drop it from the queue, notify observers.
pub struct FlushAction {
    accumulator: SharedAccumulator,
    gate: Arc<AnalyticsGate>,
    store: EventStore,
    observers: Arc<ObserverList>,
}

impl ActionHandler for FlushAction {
    fn query(&self, _args: &Value) -> ActionResult {
        match self.gate.check() {
            Ok(()) => ActionResult::ok(),
            Err(error) => ActionResult::rejected(error),
        }
    }

    fn execute(&self, args: Value) -> ActionResult {
        let events: Vec<TrackedEvent> = match serde_json::from_value(args.clone()) {
            Ok(events) => events,
            Err(e) => return ActionResult::rejected(ActionError::invalid_args(e)),
        };

        {
            let mut acc = lock(&self.accumulator);
            if let Err(e) = acc.check_flush(&events) {
                return ActionResult::rejected(action_error(&e));
            }
            if let Err(e) = self.store.save_events(&events) {
                return ActionResult::rejected(ActionError::new(
                    ActionErrorCode::StorageFailed,
                    "Storage Failed",
                    e.to_string(),
                ));
            }
            if let Err(e) = acc.apply_flush(&events) {
                return ActionResult::rejected(action_error(&e));
            }
        }

        self.observers.notify(&events);
        ActionResult::with_data(args)
    }
}

// =============================================================================
// REGISTRATION
// =============================================================================

/// Everything the two actions operate on.
#[derive(Clone)]
pub struct AnalyticsBindings {
    /// Queue and threshold.
    pub accumulator: SharedAccumulator,
    /// Feature switch checked in the query phase.
    pub gate: Arc<AnalyticsGate>,
    /// Destination of flushed events.
    pub store: EventStore,
    /// Notified after each stored flush.
    pub observers: Arc<ObserverList>,
}

impl AnalyticsBindings {
    /// Register the enqueue and flush actions under `keys`.
    ///
    /// Fails if either name is already taken; the earlier registration stays.
    pub fn register(&self, channel: &Arc<dyn ActionChannel>, keys: &ActionKeys) -> Result<(), ChannelError> {
        channel.register_action(
            &keys.enqueue,
            Arc::new(EnqueueAction {
                accumulator: self.accumulator.clone(),
                gate: self.gate.clone(),
                channel: Arc::downgrade(channel),
                flush_key: keys.flush_and_save.clone(),
            }),
        )?;
        channel.register_action(
            &keys.flush_and_save,
            Arc::new(FlushAction {
                accumulator: self.accumulator.clone(),
                gate: self.gate.clone(),
                store: self.store.clone(),
                observers: self.observers.clone(),
            }),
        )?;
        debug!("Registered {} and {}", keys.enqueue, keys.flush_and_save);
        Ok(())
    }
}

// =============================================================================
// FLUSH SUBMISSION
// =============================================================================

/// What prompted a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    /// Queue reached the threshold; skipped while a flush is in flight.
    Threshold,
    /// Caller asked for it; submitted whenever the queue is non-empty.
    Explicit,
}

/// Result of [`submit_flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushSubmission {
    /// Snapshot submitted.
    Submitted {
        /// Events in the snapshot.
        events: usize,
    },
    /// Nothing to submit.
    Skipped,
    /// Snapshot could not be encoded.
    EncodeFailed,
}

/// Snapshot the queue and submit it as a flush.
///
/// `on_settled` is always called exactly once when the result is known
/// (immediately when nothing was submitted).
pub(crate) fn submit_flush(
    accumulator: &SharedAccumulator,
    channel: &dyn ActionChannel,
    flush_key: &str,
    trigger: FlushTrigger,
    on_settled: Option<FlushCallback>,
) -> FlushSubmission {
    let snapshot = {
        let mut acc = lock(accumulator);
        if trigger == FlushTrigger::Threshold && !acc.should_submit_flush() {
            None
        } else {
            acc.begin_flush()
        }
    };

    let Some(events) = snapshot else {
        if let Some(on_settled) = on_settled {
            on_settled(Ok(()));
        }
        return FlushSubmission::Skipped;
    };

    let args = match serde_json::to_value(&events) {
        Ok(args) => args,
        Err(e) => {
            lock(accumulator).settle_flush();
            let err = AnalyticsError::FlushFailed(ActionError::invalid_args(e));
            error!("{}", err);
            if let Some(on_settled) = on_settled {
                on_settled(Err(err));
            }
            return FlushSubmission::EncodeFailed;
        }
    };

    let count = events.len();
    let acc = accumulator.clone();
    let callback: ResultCallback = Box::new(move |result: ActionResult| {
        lock(&acc).settle_flush();
        let outcome = flush_outcome(result, count);
        if let Some(on_settled) = on_settled {
            on_settled(outcome);
        }
    });

    channel.execute_action(flush_key, args, Some(callback));
    FlushSubmission::Submitted { events: count }
}

fn flush_outcome(result: ActionResult, count: usize) -> Result<(), AnalyticsError> {
    let Some(error) = result.error else {
        debug!("Flush of {} events stored", count);
        return Ok(());
    };

    let err = match error.code {
        // Another flush already stored these events.
        ActionErrorCode::StaleFlush => {
            debug!("Flush of {} events superseded", count);
            return Err(AnalyticsError::StaleFlush);
        }
        ActionErrorCode::StorageFailed | ActionErrorCode::InvalidArgs => {
            let err = AnalyticsError::FlushFailed(error);
            error!("{}", err);
            err
        }
        _ => {
            let err = AnalyticsError::ActionRejected(error);
            warn!("{}", err);
            err
        }
    };
    Err(err)
}

fn queue_full(len: usize) -> ActionError {
    ActionError::new(
        ActionErrorCode::QueueFull,
        "Queue Full",
        format!("{} events are already queued", len),
    )
}

fn action_error(err: &AnalyticsError) -> ActionError {
    match err {
        AnalyticsError::QueueFull(len) => queue_full(*len),
        AnalyticsError::StaleFlush => ActionError::new(
            ActionErrorCode::StaleFlush,
            "Stale Flush",
            err.to_string(),
        ),
        AnalyticsError::ActionRejected(e) | AnalyticsError::FlushFailed(e) => e.clone(),
        other => ActionError::invalid_args(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::channel::LocalActionChannel;
    use crate::analytics::event::{EventContext, EventMetadata, TrackProps};
    use crate::storage::kv::{KeyValueStore, MemoryStore, StoreError};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".to_string()))
        }
    }

    fn event(name: &str) -> TrackedEvent {
        TrackedEvent::new(
            EventMetadata {
                context: EventContext::default(),
                message_id: Uuid::new_v4(),
                timestamp: "2024-05-01T12:00:00.000Z".to_string(),
            },
            TrackProps::named(name),
        )
    }

    fn keys() -> ActionKeys {
        ActionKeys {
            enqueue: "analytics.enqueue".to_string(),
            flush_and_save: "analytics.flushAndSave".to_string(),
        }
    }

    fn setup(
        threshold: f64,
        storage: Arc<dyn KeyValueStore>,
    ) -> (Arc<dyn ActionChannel>, AnalyticsBindings) {
        let mut acc = Accumulator::new();
        acc.set_flush_threshold(threshold).unwrap();
        let bindings = AnalyticsBindings {
            accumulator: Arc::new(Mutex::new(acc)),
            gate: Arc::new(AnalyticsGate::default()),
            store: EventStore::new(storage, "analytics.events"),
            observers: Arc::new(ObserverList::new()),
        };
        let channel: Arc<dyn ActionChannel> = Arc::new(LocalActionChannel::new());
        bindings.register(&channel, &keys()).unwrap();
        (channel, bindings)
    }

    /// Local channel that counts flush submissions and can hold them back.
    #[derive(Default)]
    struct CountingChannel {
        inner: LocalActionChannel,
        flush_submissions: AtomicUsize,
        hold_flushes: AtomicBool,
        held: Mutex<Vec<(String, Value, Option<ResultCallback>)>>,
    }

    impl CountingChannel {
        fn flush_submissions(&self) -> usize {
            self.flush_submissions.load(Ordering::SeqCst)
        }

        fn release_held(&self) {
            let held = std::mem::take(&mut *lock(&self.held));
            for (name, args, callback) in held {
                self.inner.execute_action(&name, args, callback);
            }
        }
    }

    impl ActionChannel for CountingChannel {
        fn register_action(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<(), ChannelError> {
            self.inner.register_action(name, handler)
        }

        fn execute_action(&self, name: &str, args: Value, callback: Option<ResultCallback>) {
            if name == keys().flush_and_save {
                self.flush_submissions.fetch_add(1, Ordering::SeqCst);
                if self.hold_flushes.load(Ordering::SeqCst) {
                    lock(&self.held).push((name.to_string(), args, callback));
                    return;
                }
            }
            self.inner.execute_action(name, args, callback);
        }

        fn is_registered(&self, name: &str) -> bool {
            self.inner.is_registered(name)
        }
    }

    fn capture() -> (Arc<Mutex<Option<ActionResult>>>, ResultCallback) {
        let slot = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        (slot, Box::new(move |r: ActionResult| *lock(&writer) = Some(r)))
    }

    #[test]
    fn test_register_twice_fails() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        assert_eq!(
            bindings.register(&channel, &keys()),
            Err(ChannelError::AlreadyRegistered("analytics.enqueue".to_string()))
        );
    }

    #[test]
    fn test_enqueue_echoes_event() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        let e = event("ride_built");
        let (result, callback) = capture();

        channel.execute_action("analytics.enqueue", e.to_value().unwrap(), Some(callback));

        assert_eq!(lock(&result).clone(), Some(ActionResult::with_data(e.to_value().unwrap())));
        assert_eq!(lock(&bindings.accumulator).queue(), &[e]);
    }

    #[test]
    fn test_disabled_gate_rejects_both() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        bindings.gate.set_enabled(false);

        let (result, callback) = capture();
        channel.execute_action("analytics.enqueue", event("a").to_value().unwrap(), Some(callback));
        let error = lock(&result).clone().and_then(|r| r.error).unwrap();
        assert_eq!(error, ActionError::disabled());

        let (result, callback) = capture();
        channel.execute_action("analytics.flushAndSave", json!([]), Some(callback));
        assert_eq!(
            lock(&result).clone().and_then(|r| r.error).map(|e| e.code),
            Some(ActionErrorCode::Disabled)
        );
        assert!(lock(&bindings.accumulator).is_empty());
    }

    #[test]
    fn test_malformed_event_rejected() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        let (result, callback) = capture();

        channel.execute_action("analytics.enqueue", json!({ "name": "x" }), Some(callback));

        assert_eq!(
            lock(&result).clone().and_then(|r| r.error).map(|e| e.code),
            Some(ActionErrorCode::InvalidArgs)
        );
        assert!(lock(&bindings.accumulator).is_empty());
    }

    #[test]
    fn test_threshold_submits_single_flush() {
        let (channel, bindings) = setup(2.0, Arc::new(MemoryStore::new()));

        channel.execute_action("analytics.enqueue", event("a").to_value().unwrap(), None);
        assert_eq!(bindings.store.total_events().unwrap(), 0);

        channel.execute_action("analytics.enqueue", event("b").to_value().unwrap(), None);
        assert!(lock(&bindings.accumulator).is_empty());
        assert_eq!(bindings.store.total_events().unwrap(), 2);
        assert_eq!(lock(&bindings.accumulator).flushes_in_flight(), 0);
    }

    #[test]
    fn test_one_flush_submission_per_threshold_crossing() {
        let (_, bindings) = setup(2.0, Arc::new(MemoryStore::new()));
        let counting = Arc::new(CountingChannel::default());
        let channel: Arc<dyn ActionChannel> = counting.clone();
        bindings.register(&channel, &keys()).unwrap();
        let enqueue = |name: &str| {
            channel.execute_action("analytics.enqueue", event(name).to_value().unwrap(), None)
        };

        counting.hold_flushes.store(true, Ordering::SeqCst);
        enqueue("a");
        assert_eq!(counting.flush_submissions(), 0);
        enqueue("b");
        assert_eq!(counting.flush_submissions(), 1);

        // Threshold still met, but the first flush has not settled.
        enqueue("c");
        enqueue("d");
        assert_eq!(counting.flush_submissions(), 1);
        assert_eq!(lock(&bindings.accumulator).flushes_in_flight(), 1);

        counting.hold_flushes.store(false, Ordering::SeqCst);
        counting.release_held();
        assert_eq!(bindings.store.total_events().unwrap(), 2);
        assert_eq!(lock(&bindings.accumulator).len(), 2);
        assert_eq!(lock(&bindings.accumulator).flushes_in_flight(), 0);
        assert_eq!(counting.flush_submissions(), 1);

        enqueue("e");
        assert_eq!(counting.flush_submissions(), 2);
        assert_eq!(bindings.store.total_events().unwrap(), 5);
        assert!(lock(&bindings.accumulator).is_empty());
    }

    #[test]
    fn test_stale_flush_writes_nothing() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        let e = event("a");
        channel.execute_action("analytics.enqueue", e.to_value().unwrap(), None);

        let snapshot = json!([e.to_value().unwrap()]);
        channel.execute_action("analytics.flushAndSave", snapshot.clone(), None);
        assert_eq!(bindings.store.total_events().unwrap(), 1);

        let (result, callback) = capture();
        channel.execute_action("analytics.flushAndSave", snapshot, Some(callback));
        assert_eq!(
            lock(&result).clone().and_then(|r| r.error).map(|e| e.code),
            Some(ActionErrorCode::StaleFlush)
        );
        assert_eq!(bindings.store.total_events().unwrap(), 1);
    }

    #[test]
    fn test_storage_failure_keeps_queue() {
        let (channel, bindings) = setup(25.0, Arc::new(FailingStore));
        channel.execute_action("analytics.enqueue", event("a").to_value().unwrap(), None);
        channel.execute_action("analytics.enqueue", event("b").to_value().unwrap(), None);
        let before = lock(&bindings.accumulator).queue().to_vec();

        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let submitted = submit_flush(
            &bindings.accumulator,
            channel.as_ref(),
            "analytics.flushAndSave",
            FlushTrigger::Explicit,
            Some(Box::new(move |r: Result<(), AnalyticsError>| *lock(&slot) = Some(r))),
        );

        assert_eq!(submitted, FlushSubmission::Submitted { events: 2 });
        assert!(matches!(
            lock(&outcome).take(),
            Some(Err(AnalyticsError::FlushFailed(ActionError { code: ActionErrorCode::StorageFailed, .. })))
        ));
        assert_eq!(lock(&bindings.accumulator).queue(), before.as_slice());
        assert_eq!(lock(&bindings.accumulator).flushes_in_flight(), 0);
    }

    #[test]
    fn test_empty_flush_skipped() {
        let (channel, bindings) = setup(25.0, Arc::new(MemoryStore::new()));
        let settled = Arc::new(Mutex::new(None));
        let slot = settled.clone();

        let submitted = submit_flush(
            &bindings.accumulator,
            channel.as_ref(),
            "analytics.flushAndSave",
            FlushTrigger::Explicit,
            Some(Box::new(move |r: Result<(), AnalyticsError>| *lock(&slot) = Some(r.is_ok()))),
        );

        assert_eq!(submitted, FlushSubmission::Skipped);
        assert_eq!(*lock(&settled), Some(true));
    }

    #[test]
    fn test_queue_cap_rejected_in_query() {
        let (channel, bindings) = setup(1000.0, Arc::new(MemoryStore::new()));
        // Fill the queue directly so no flush drains it.
        for i in 0..1000 {
            lock(&bindings.accumulator).apply_enqueue(event(&format!("e{}", i))).unwrap();
        }
        assert!(!lock(&bindings.accumulator).has_capacity());

        let (result, callback) = capture();
        channel.execute_action("analytics.enqueue", event("late").to_value().unwrap(), Some(callback));
        assert_eq!(
            lock(&result).clone().and_then(|r| r.error).map(|e| e.code),
            Some(ActionErrorCode::QueueFull)
        );
    }
}
