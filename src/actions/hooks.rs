//! Host Hooks
//!
//! The host announces every executed action to subscribers. The collector
//! subscribes once to force a final flush when the park is left.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::analytics::accumulator::AnalyticsError;
use crate::analytics::tracker::Analytics;

/// Host action executed when the player loads another park or quits.
pub const LOAD_OR_QUIT_ACTION: &str = "loadorquit";

/// Event tracked right before the final flush.
pub const LOAD_OR_QUIT_EVENT: &str = "Load or quit";

/// Subscription handle.
pub type SubscriptionId = u64;

/// Payload of the host's action-executed hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionExecuteEvent {
    /// Name of the executed action.
    pub action: String,
    /// Player that triggered it, if any.
    pub player: Option<i32>,
}

impl ActionExecuteEvent {
    /// Event for `action` with no player.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            player: None,
        }
    }
}

/// Hook subscriber.
pub type HookCallback = Arc<dyn Fn(&ActionExecuteEvent) + Send + Sync>;

/// Host hook subscription.
pub trait HostHooks: Send + Sync {
    /// Subscribe to the action-executed hook.
    fn subscribe_action_execute(&self, callback: HookCallback) -> SubscriptionId;
}

/// In-process hook bus.
#[derive(Default)]
pub struct HookRegistry {
    subscribers: RwLock<Vec<(SubscriptionId, HookCallback)>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every subscriber, in subscription order.
    pub fn emit(&self, event: &ActionExecuteEvent) {
        let subscribers: Vec<HookCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        debug!("Hook action.execute {} -> {} subscribers", event.action, subscribers.len());
        for callback in subscribers {
            callback(event);
        }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl HostHooks for HookRegistry {
    fn subscribe_action_execute(&self, callback: HookCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }
}

/// Track a final event and flush whenever the host runs [`LOAD_OR_QUIT_ACTION`].
pub fn flush_on_load_or_quit(hooks: &dyn HostHooks, analytics: &Analytics) -> SubscriptionId {
    let analytics = analytics.clone();
    hooks.subscribe_action_execute(Arc::new(move |event: &ActionExecuteEvent| {
        if event.action != LOAD_OR_QUIT_ACTION {
            return;
        }

        info!("Park closing, flushing analytics");
        analytics.track(LOAD_OR_QUIT_EVENT);

        let confirmed = Arc::new(AtomicBool::new(false));
        let flag = confirmed.clone();
        analytics.flush_then(move |_| flag.store(true, Ordering::SeqCst));

        // Teardown follows the hook; anything unconfirmed now may never be stored.
        if !confirmed.load(Ordering::SeqCst) {
            warn!("{}", AnalyticsError::LostShutdownFlush);
        }
    }))
}
