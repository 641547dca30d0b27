//! Park identity.
//!
//! A park gets a numeric id the first time it is asked for one; the id is saved
//! in park-scoped storage so later sessions on the same park reuse it.

use serde_json::Value;
use tracing::debug;

use crate::core::clock::now_millis;
use crate::storage::kv::{KeyValueStore, StoreError};

/// Read the park id, generating and saving one from the current time if absent.
pub fn get_park_id(storage: &dyn KeyValueStore, key: &str) -> Result<i64, StoreError> {
    if let Some(id) = storage.get(key)?.as_ref().and_then(Value::as_i64) {
        return Ok(id);
    }

    let id = now_millis();
    storage.set(key, Value::from(id))?;
    debug!("Generated park id {}", id);
    Ok(id)
}
