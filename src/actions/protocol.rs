//! Action Protocol
//!
//! Result shape of the host's two-phase actions, and the frames the replicated
//! session exchanges. Action args travel as JSON; session frames are bincode
//! with the args embedded as JSON text.

use std::fmt;

use serde::{Serialize, Deserialize};
use serde_json::Value;

/// Participant identifier within a replicated session.
pub type ParticipantId = u32;

// =============================================================================
// RESULTS
// =============================================================================

/// Why an action was refused or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorCode {
    /// Analytics is switched off.
    Disabled,
    /// Args could not be decoded.
    InvalidArgs,
    /// No handler registered under the name.
    UnknownAction,
    /// Queue is at its hard cap.
    QueueFull,
    /// Flush payload no longer matches the queue front.
    StaleFlush,
    /// Event store write failed.
    StorageFailed,
    /// Submission could not reach the sequencer.
    Unavailable,
}

/// Error half of an [`ActionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    /// Machine-readable code.
    pub code: ActionErrorCode,
    /// Short title.
    pub title: String,
    /// Human-readable detail.
    pub message: String,
}

impl ActionError {
    /// Create an error.
    pub fn new(code: ActionErrorCode, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            title: title.into(),
            message: message.into(),
        }
    }

    /// Analytics switched off.
    pub fn disabled() -> Self {
        Self::new(
            ActionErrorCode::Disabled,
            "Analytics Disabled",
            "Enable the Analytics plugin to use this feature.",
        )
    }

    /// No handler for `name`.
    pub fn unknown_action(name: &str) -> Self {
        Self::new(
            ActionErrorCode::UnknownAction,
            "Unknown Action",
            format!("No action registered as {}", name),
        )
    }

    /// Args failed to decode.
    pub fn invalid_args(err: impl fmt::Display) -> Self {
        Self::new(ActionErrorCode::InvalidArgs, "Invalid Arguments", err.to_string())
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)
    }
}

/// Outcome of a query or execute phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionResult {
    /// Set when the action was refused or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// Effect payload echoed back on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResult {
    /// Accepted, no data.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Accepted with data.
    pub fn with_data(data: Value) -> Self {
        Self {
            error: None,
            data: Some(data),
        }
    }

    /// Refused or failed.
    pub fn rejected(error: ActionError) -> Self {
        Self {
            error: Some(error),
            data: None,
        }
    }

    /// Whether the action succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<Option<Value>, ActionError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

// =============================================================================
// SESSION FRAMES
// =============================================================================

/// A participant's candidate action, sent to the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSubmission {
    /// Submitting participant.
    pub origin: ParticipantId,
    /// Participant-local ticket used to route the result back.
    pub ticket: u64,
    /// Action name.
    pub action: String,
    /// Args as JSON text.
    pub args: String,
}

impl ActionSubmission {
    /// Build a submission, encoding `args` as JSON.
    pub fn new(origin: ParticipantId, ticket: u64, action: &str, args: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            origin,
            ticket,
            action: action.to_string(),
            args: serde_json::to_string(args)?,
        })
    }
}

/// An action the sequencer has placed in the global order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedAction {
    /// Position in the global order, starting at 0.
    pub seq: u64,
    /// Submitting participant.
    pub origin: ParticipantId,
    /// Origin's ticket.
    pub ticket: u64,
    /// Action name.
    pub action: String,
    /// Args as JSON text.
    pub args: String,
}

impl CommittedAction {
    /// Commit a submission at `seq`.
    pub fn commit(seq: u64, submission: ActionSubmission) -> Self {
        Self {
            seq,
            origin: submission.origin,
            ticket: submission.ticket,
            action: submission.action,
            args: submission.args,
        }
    }

    /// Decode the args.
    pub fn args_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.args)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_json_shape() {
        let ok = serde_json::to_value(ActionResult::with_data(json!({ "a": 1 }))).unwrap();
        assert_eq!(ok, json!({ "data": { "a": 1 } }));

        let err = serde_json::to_value(ActionResult::rejected(ActionError::disabled())).unwrap();
        assert_eq!(err["error"]["code"], json!("disabled"));
        assert_eq!(err["error"]["title"], json!("Analytics Disabled"));
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(ActionResult::ok().into_result().unwrap(), None);

        let err = ActionResult::rejected(ActionError::unknown_action("x")).into_result();
        assert_eq!(err.unwrap_err().code, ActionErrorCode::UnknownAction);
    }

    #[test]
    fn test_error_display() {
        let err = ActionError::disabled();
        assert_eq!(
            err.to_string(),
            "Analytics Disabled: Enable the Analytics plugin to use this feature."
        );
    }

    #[test]
    fn test_committed_frame_binary() {
        let args = json!({ "properties": { "name": "ride_built", "cost": 1200 } });
        let submission = ActionSubmission::new(3, 17, "analytics.enqueue", &args).unwrap();
        let committed = CommittedAction::commit(42, submission);

        let bytes = committed.to_bytes().unwrap();
        let parsed = CommittedAction::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.seq, 42);
        assert_eq!(parsed.origin, 3);
        assert_eq!(parsed.ticket, 17);
        assert_eq!(parsed.args_value().unwrap(), args);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let submission = ActionSubmission::new(1, 1, "analytics.flushAndSave", &json!([])).unwrap();
        let bytes = CommittedAction::commit(0, submission).to_bytes().unwrap();
        assert!(CommittedAction::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
