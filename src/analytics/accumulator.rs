//! Event Accumulator
//!
//! Owns the pending event queue and the flush threshold. The accumulator is a
//! reducer: it only changes in response to accepted enqueue/flush effects, which
//! the action channel delivers in one total order on every participant.
//!
//! ## State Machine
//!
//! ```text
//!  Idle ──enqueue──▶ Accumulating ──len ≥ threshold──▶ Flushing
//!   ▲                    ▲                               │
//!   └──── flush ok ──────┴──────── flush failed ─────────┘
//!                                  (Saturated until the next
//!                                   enqueue resubmits)
//! ```

use thiserror::Error;
use tracing::debug;

use crate::actions::protocol::ActionError;
use crate::analytics::event::TrackedEvent;
use crate::config::{DEFAULT_FLUSH_THRESHOLD, DEFAULT_PLUGIN_NAME, MAX_QUEUE_LENGTH};
use crate::core::hash::{StateHash, StateHasher};

/// Collector errors.
///
/// None of these escape as panics; each is returned to the immediate caller or
/// logged where it occurs.
#[derive(Debug, Clone, Error)]
pub enum AnalyticsError {
    /// Threshold below 1.
    #[error("Flush threshold must be greater than 0 (got {threshold})")]
    InvalidConfiguration {
        /// Rejected value.
        threshold: f64,
    },

    /// The channel's query phase refused a submission.
    #[error("Action rejected: {0}")]
    ActionRejected(ActionError),

    /// The flush effect reported an error; the queue was left intact.
    #[error("Error flushing events: {0}")]
    FlushFailed(ActionError),

    /// Actions were already registered by an earlier `init`.
    #[error("Error registering actions. Did you call init() a second time?")]
    DuplicateInitialization,

    /// Final flush on load/quit was not confirmed before the hook returned.
    #[error("Final flush was not confirmed before teardown")]
    LostShutdownFlush,

    /// Queue is at its hard cap.
    #[error("Event queue is full ({0} events)")]
    QueueFull(usize),

    /// Flush payload is no longer the front of the queue.
    #[error("Flush payload is no longer at the front of the queue")]
    StaleFlush,
}

/// Observable accumulator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// Queue empty.
    Idle,
    /// Below threshold.
    Accumulating {
        /// Events queued.
        queued: usize,
    },
    /// At or above threshold with no flush in flight (a flush failed).
    Saturated {
        /// Events queued.
        queued: usize,
    },
    /// A flush submitted by this participant is awaiting its result.
    Flushing {
        /// Events queued.
        queued: usize,
    },
}

/// Result of applying an accepted enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued below threshold.
    Queued {
        /// Queue length after the append.
        len: usize,
    },
    /// Queue reached the threshold; a flush should be submitted.
    FlushDue {
        /// Queue length after the append.
        len: usize,
    },
}

/// Pending-event queue and threshold policy.
#[derive(Debug, Clone)]
pub struct Accumulator {
    /// Events in acceptance order.
    queue: Vec<TrackedEvent>,
    /// Queue length that triggers a flush.
    flush_threshold: usize,
    /// Tags `library.eventPluginSource`.
    plugin_name: String,
    /// Flushes submitted by this participant without a result yet.
    flushes_in_flight: usize,
    /// Log queue activity.
    debug_logging: bool,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    /// Create an empty accumulator with the default threshold.
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            flushes_in_flight: 0,
            debug_logging: false,
        }
    }

    /// Set the flush threshold.
    ///
    /// Values above [`MAX_QUEUE_LENGTH`] are clamped, fractional values round up.
    /// Values below 1 are rejected and leave the threshold unchanged.
    pub fn set_flush_threshold(&mut self, threshold: f64) -> Result<usize, AnalyticsError> {
        self.flush_threshold = Self::normalize_threshold(threshold)?;
        self.log(format_args!("Flush threshold set to {}", self.flush_threshold));
        Ok(self.flush_threshold)
    }

    /// Validate and normalize a threshold without applying it.
    pub fn normalize_threshold(threshold: f64) -> Result<usize, AnalyticsError> {
        if threshold.is_nan() || threshold < 1.0 {
            return Err(AnalyticsError::InvalidConfiguration { threshold });
        }
        Ok(threshold.min(MAX_QUEUE_LENGTH as f64).ceil() as usize)
    }

    /// Current flush threshold.
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Plugin name used to tag metadata.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Set the plugin name.
    pub fn set_plugin_name(&mut self, name: impl Into<String>) {
        self.plugin_name = name.into();
    }

    /// Enable queue activity logging.
    pub fn set_debug_logging(&mut self, enabled: bool) {
        self.debug_logging = enabled;
    }

    /// Whether queue activity logging is on.
    pub fn debug_logging(&self) -> bool {
        self.debug_logging
    }

    /// Queued events, oldest first.
    pub fn queue(&self) -> &[TrackedEvent] {
        &self.queue
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether another event fits under the hard cap.
    pub fn has_capacity(&self) -> bool {
        self.queue.len() < MAX_QUEUE_LENGTH
    }

    /// Flushes awaiting a result.
    pub fn flushes_in_flight(&self) -> usize {
        self.flushes_in_flight
    }

    /// Current state.
    pub fn state(&self) -> AccumulatorState {
        let queued = self.queue.len();
        if self.flushes_in_flight > 0 {
            AccumulatorState::Flushing { queued }
        } else if queued == 0 {
            AccumulatorState::Idle
        } else if queued >= self.flush_threshold {
            AccumulatorState::Saturated { queued }
        } else {
            AccumulatorState::Accumulating { queued }
        }
    }

    /// Apply an accepted enqueue.
    ///
    /// Appends in acceptance order and reports whether the threshold was reached.
    /// The length check runs inside the ordered effect, so no other effect can
    /// interleave between the append and the check.
    pub fn apply_enqueue(&mut self, event: TrackedEvent) -> Result<EnqueueOutcome, AnalyticsError> {
        if !self.has_capacity() {
            return Err(AnalyticsError::QueueFull(self.queue.len()));
        }

        self.log(format_args!(
            "Enqueueing event {} ({} queued)",
            event.properties.name,
            self.queue.len()
        ));
        self.queue.push(event);

        let len = self.queue.len();
        if len >= self.flush_threshold {
            self.log(format_args!(
                "Queue length {} exceeds threshold {}, flushing",
                len, self.flush_threshold
            ));
            Ok(EnqueueOutcome::FlushDue { len })
        } else {
            Ok(EnqueueOutcome::Queued { len })
        }
    }

    /// Whether a threshold-triggered flush should be submitted now.
    ///
    /// Suppressed while this participant already has a flush in flight.
    pub fn should_submit_flush(&self) -> bool {
        self.queue.len() >= self.flush_threshold && self.flushes_in_flight == 0
    }

    /// Snapshot the queue for a flush submission and mark it in flight.
    ///
    /// Returns `None` for an empty queue.
    pub fn begin_flush(&mut self) -> Option<Vec<TrackedEvent>> {
        if self.queue.is_empty() {
            self.log(format_args!("Nothing to flush"));
            return None;
        }
        self.flushes_in_flight += 1;
        self.log(format_args!("Flushing {} events", self.queue.len()));
        Some(self.queue.clone())
    }

    /// Record that a submitted flush got its result, whatever it was.
    pub fn settle_flush(&mut self) {
        self.flushes_in_flight = self.flushes_in_flight.saturating_sub(1);
    }

    /// Check that `events` is still the front of the queue.
    ///
    /// A flush snapshot goes stale once an earlier flush removed its events.
    pub fn check_flush(&self, events: &[TrackedEvent]) -> Result<(), AnalyticsError> {
        let is_prefix = events.len() <= self.queue.len()
            && events
                .iter()
                .zip(&self.queue)
                .all(|(flushed, queued)| flushed.message_id == queued.message_id);

        if is_prefix {
            Ok(())
        } else {
            Err(AnalyticsError::StaleFlush)
        }
    }

    /// Apply a flush whose events were durably stored: drop them from the front.
    ///
    /// Events accepted after the flush snapshot was taken stay queued.
    pub fn apply_flush(&mut self, events: &[TrackedEvent]) -> Result<(), AnalyticsError> {
        self.check_flush(events)?;
        self.queue.drain(..events.len());
        self.log(format_args!("Events flushed ({} remain)", self.queue.len()));
        Ok(())
    }

    /// Fingerprint of the queue contents, equal on replicas that applied the same log.
    pub fn digest(&self) -> StateHash {
        let mut hasher = StateHasher::for_queue();
        hasher.update_u32(self.flush_threshold as u32);
        hasher.update_u64(self.queue.len() as u64);
        for event in &self.queue {
            hasher.update_uuid(&event.message_id);
        }
        hasher.finalize()
    }

    fn log(&self, message: std::fmt::Arguments<'_>) {
        if self.debug_logging {
            debug!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::event::{EventContext, EventMetadata, TrackProps};
    use proptest::prelude::*;
    use uuid::Uuid;

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

    fn with_threshold(threshold: f64) -> Accumulator {
        let mut acc = Accumulator::new();
        acc.set_flush_threshold(threshold).unwrap();
        acc
    }

    #[test]
    fn test_defaults() {
        let acc = Accumulator::new();
        assert_eq!(acc.flush_threshold(), 25);
        assert_eq!(acc.plugin_name(), "openrct2-analytics-sdk");
        assert_eq!(acc.state(), AccumulatorState::Idle);
    }

    #[test]
    fn test_threshold_bounds() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.set_flush_threshold(1.0).unwrap(), 1);
        assert_eq!(acc.set_flush_threshold(2.2).unwrap(), 3);
        assert_eq!(acc.set_flush_threshold(1000.0).unwrap(), 1000);
        assert_eq!(acc.set_flush_threshold(5000.0).unwrap(), 1000);
    }

    #[test]
    fn test_invalid_threshold_keeps_previous() {
        let mut acc = with_threshold(10.0);
        assert!(matches!(
            acc.set_flush_threshold(0.0),
            Err(AnalyticsError::InvalidConfiguration { .. })
        ));
        assert!(acc.set_flush_threshold(-3.0).is_err());
        assert!(acc.set_flush_threshold(f64::NAN).is_err());
        assert_eq!(acc.flush_threshold(), 10);
    }

    #[test]
    fn test_below_threshold_only_queues() {
        let mut acc = with_threshold(5.0);
        for i in 0..4 {
            let outcome = acc.apply_enqueue(event("a")).unwrap();
            assert_eq!(outcome, EnqueueOutcome::Queued { len: i + 1 });
        }
        assert_eq!(acc.len(), 4);
        assert_eq!(acc.state(), AccumulatorState::Accumulating { queued: 4 });
    }

    #[test]
    fn test_threshold_reports_flush_due() {
        let mut acc = with_threshold(3.0);
        acc.apply_enqueue(event("a")).unwrap();
        acc.apply_enqueue(event("b")).unwrap();
        let outcome = acc.apply_enqueue(event("c")).unwrap();

        assert_eq!(outcome, EnqueueOutcome::FlushDue { len: 3 });
        assert!(acc.should_submit_flush());
    }

    #[test]
    fn test_flush_in_flight_suppresses_resubmission() {
        let mut acc = with_threshold(2.0);
        acc.apply_enqueue(event("a")).unwrap();
        acc.apply_enqueue(event("b")).unwrap();

        let snapshot = acc.begin_flush().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(acc.state(), AccumulatorState::Flushing { queued: 2 });

        acc.apply_enqueue(event("c")).unwrap();
        assert!(!acc.should_submit_flush());

        acc.settle_flush();
        assert!(acc.should_submit_flush());
    }

    #[test]
    fn test_apply_flush_removes_prefix_only() {
        let mut acc = with_threshold(2.0);
        acc.apply_enqueue(event("a")).unwrap();
        acc.apply_enqueue(event("b")).unwrap();
        let snapshot = acc.begin_flush().unwrap();

        let late = event("c");
        acc.apply_enqueue(late.clone()).unwrap();

        acc.apply_flush(&snapshot).unwrap();
        acc.settle_flush();

        assert_eq!(acc.queue(), &[late]);
        assert_eq!(acc.state(), AccumulatorState::Accumulating { queued: 1 });
    }

    #[test]
    fn test_stale_flush_rejected() {
        let mut acc = with_threshold(2.0);
        acc.apply_enqueue(event("a")).unwrap();
        acc.apply_enqueue(event("b")).unwrap();

        let first = acc.begin_flush().unwrap();
        let second = acc.begin_flush().unwrap();

        acc.apply_flush(&first).unwrap();
        assert!(matches!(acc.apply_flush(&second), Err(AnalyticsError::StaleFlush)));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_failed_flush_leaves_queue_saturated() {
        let mut acc = with_threshold(2.0);
        acc.apply_enqueue(event("a")).unwrap();
        acc.apply_enqueue(event("b")).unwrap();
        let before = acc.queue().to_vec();

        acc.begin_flush().unwrap();
        acc.settle_flush();

        assert_eq!(acc.queue(), before.as_slice());
        assert_eq!(acc.state(), AccumulatorState::Saturated { queued: 2 });
        assert!(acc.should_submit_flush());
    }

    #[test]
    fn test_empty_queue_not_flushed() {
        let mut acc = Accumulator::new();
        assert!(acc.begin_flush().is_none());
        assert_eq!(acc.flushes_in_flight(), 0);
    }

    #[test]
    fn test_hard_cap() {
        let mut acc = with_threshold(1000.0);
        for _ in 0..MAX_QUEUE_LENGTH {
            acc.apply_enqueue(event("x")).unwrap();
        }
        assert!(!acc.has_capacity());
        assert!(matches!(
            acc.apply_enqueue(event("x")),
            Err(AnalyticsError::QueueFull(1000))
        ));
        assert_eq!(acc.len(), MAX_QUEUE_LENGTH);
    }

    #[test]
    fn test_digest_follows_queue() {
        let mut a = with_threshold(10.0);
        let mut b = with_threshold(10.0);
        let e = event("a");

        a.apply_enqueue(e.clone()).unwrap();
        assert_ne!(a.digest(), b.digest());

        b.apply_enqueue(e).unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    proptest! {
        #[test]
        fn prop_threshold_in_range_rounds_up(t in 1.0f64..=1000.0) {
            let mut acc = Accumulator::new();
            prop_assert_eq!(acc.set_flush_threshold(t).unwrap(), t.ceil() as usize);
        }

        #[test]
        fn prop_threshold_above_cap_clamps(t in 1000.0f64..1.0e9) {
            let mut acc = Accumulator::new();
            prop_assert_eq!(acc.set_flush_threshold(t).unwrap(), MAX_QUEUE_LENGTH);
        }

        #[test]
        fn prop_threshold_below_one_rejected(t in -1.0e9f64..1.0) {
            let mut acc = Accumulator::new();
            prop_assert!(acc.set_flush_threshold(t).is_err());
            prop_assert_eq!(acc.flush_threshold(), DEFAULT_FLUSH_THRESHOLD);
        }

        #[test]
        fn prop_enqueues_below_threshold_never_flush(threshold in 2usize..50, extra in 0usize..50) {
            let n = extra % threshold;
            let mut acc = Accumulator::new();
            acc.set_flush_threshold(threshold as f64).unwrap();
            for i in 0..n {
                let outcome = acc.apply_enqueue(event("p")).unwrap();
                prop_assert_eq!(outcome, EnqueueOutcome::Queued { len: i + 1 });
            }
            prop_assert_eq!(acc.len(), n);
        }
    }
}
