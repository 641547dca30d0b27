//! Action Layer
//!
//! Two-phase named actions: registration, local and replicated dispatch, the
//! analytics bindings and the host hook that forces the final flush.

pub mod protocol;
pub mod channel;
pub mod session;
pub mod bindings;
pub mod hooks;

pub use protocol::{
    ActionError, ActionErrorCode, ActionResult, ActionSubmission, CommittedAction, ParticipantId,
};
pub use channel::{ActionChannel, ActionHandler, ActionRegistry, ChannelError, LocalActionChannel};
pub use session::{Participant, Sequencer, SessionError};
pub use bindings::{AnalyticsBindings, AnalyticsGate};
pub use hooks::{ActionExecuteEvent, HookRegistry, HostHooks, LOAD_OR_QUIT_ACTION, LOAD_OR_QUIT_EVENT};
