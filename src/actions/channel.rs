//! Action Channel
//!
//! The host's named-operation mechanism: handlers are registered once under a
//! name, and submissions go through a query (validate) phase and an execute
//! (effect) phase. Every accepted effect runs exactly once, in one total order,
//! and its result is handed to the submitter's callback.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::actions::protocol::{ActionError, ActionResult};
use crate::core::sync::lock;

/// Callback receiving an action's final result.
pub type ResultCallback = Box<dyn FnOnce(ActionResult) + Send>;

/// A registered two-phase action.
pub trait ActionHandler: Send + Sync {
    /// Validate a submission. Must not change state.
    fn query(&self, args: &Value) -> ActionResult;

    /// Apply the effect.
    fn execute(&self, args: Value) -> ActionResult;
}

/// Named-operation registration and dispatch.
pub trait ActionChannel: Send + Sync {
    /// Register a handler. Each name can be registered once.
    fn register_action(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<(), ChannelError>;

    /// Submit an action. Fire-and-forget: the result arrives through `callback`,
    /// possibly before this returns, possibly much later.
    fn execute_action(&self, name: &str, args: Value, callback: Option<ResultCallback>);

    /// Whether a handler is registered under `name`.
    fn is_registered(&self, name: &str) -> bool;
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The name already has a handler; the first registration stays.
    #[error("action {0} is already registered")]
    AlreadyRegistered(String),
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Handler table shared by channel implementations.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, refusing duplicate names.
    pub fn register(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<(), ChannelError> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            return Err(ChannelError::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        debug!("Registered action {}", name);
        Ok(())
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// LOCAL CHANNEL
// =============================================================================

struct PendingAction {
    name: String,
    args: Value,
    callback: Option<ResultCallback>,
}

/// Single-participant channel.
///
/// Submissions join one FIFO. The first caller drains it on its own stack, so an
/// action submitted from outside any handler completes before `execute_action`
/// returns. Submissions made while a drain is running (from a handler, a result
/// callback, or another thread) are appended and executed by that drain, after
/// everything already queued. Effects therefore never interleave.
#[derive(Default)]
pub struct LocalActionChannel {
    registry: ActionRegistry,
    pending: Mutex<VecDeque<PendingAction>>,
    dispatching: AtomicBool,
    executed: AtomicU64,
}

impl LocalActionChannel {
    /// Create a channel with no actions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions dispatched so far (accepted or not).
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Number of submissions waiting for the running drain.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn drain(&self) {
        loop {
            while let Some(action) = self.pop() {
                self.dispatch(action);
            }

            self.dispatching.store(false, Ordering::SeqCst);

            // A submission may have slipped in between the last pop and the store.
            if self.pending_count() == 0
                || self
                    .dispatching
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                return;
            }
        }
    }

    fn pop(&self) -> Option<PendingAction> {
        lock(&self.pending).pop_front()
    }

    fn dispatch(&self, action: PendingAction) {
        let seq = self.executed.fetch_add(1, Ordering::SeqCst);
        let result = match self.registry.get(&action.name) {
            Some(handler) => {
                let query = handler.query(&action.args);
                if query.is_ok() {
                    handler.execute(action.args)
                } else {
                    query
                }
            }
            None => ActionResult::rejected(ActionError::unknown_action(&action.name)),
        };

        match &result.error {
            None => debug!("Action #{} {} executed", seq, action.name),
            Some(err) => warn!("Action #{} {} refused: {}", seq, action.name, err),
        }

        if let Some(callback) = action.callback {
            callback(result);
        }
    }
}

impl ActionChannel for LocalActionChannel {
    fn register_action(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<(), ChannelError> {
        self.registry.register(name, handler)
    }

    fn execute_action(&self, name: &str, args: Value, callback: Option<ResultCallback>) {
        lock(&self.pending).push_back(PendingAction {
            name: name.to_string(),
            args,
            callback,
        });

        if self
            .dispatching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.drain();
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }
}
