//! Wall-clock and identity helpers.
//!
//! The only non-deterministic inputs of the collector live here: message ids,
//! event timestamps and the first-seen park id.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Generate a fresh message id.
///
/// Random v4 UUIDs; collisions within a session are not detected locally.
pub fn new_message_id() -> Uuid {
    Uuid::new_v4()
}

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn iso_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Format a timestamp the way stored events carry it (`2024-05-01T12:00:00.000Z`).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
