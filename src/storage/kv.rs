//! Key/Value Storage
//!
//! The host exposes two JSON key/value stores: a shared store that outlives a
//! single park, and a park-scoped store saved with the park. Both are modelled by
//! [`KeyValueStore`].

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::core::sync::lock;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data is not valid JSON or has the wrong shape.
    #[error("storage data error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backing file does not contain a JSON object.
    #[error("storage file {0} is not a JSON object")]
    NotAnObject(PathBuf),

    /// Store refused the write.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A JSON key/value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a key. `Ok(None)` if absent.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a key, replacing any previous value.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }
}

// =============================================================================
// JSON FILE STORE
// =============================================================================

/// Store backed by a single JSON object file (like the host's `plugin.store.json`).
///
/// Every write rewrites the whole file through a temporary sibling and a rename,
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or lazily create) a store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::NotAnObject(self.path.clone())),
        }
    }

    fn write_all(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} keys to {}", map.len(), self.path.display());
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _guard = lock(&self.write_lock);
        let mut map = self.read_all()?;
        map.insert(key.to_string(), value);
        self.write_all(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("park-analytics-{}-{}.json", tag, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_memory_store_get_set() {
        let store = MemoryStore::new();
        assert!(store.get("missing").unwrap().is_none());

        store.set("k", json!({ "a": 1 })).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!({ "a": 1 })));

        store.set("k", json!(2)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let store = JsonFileStore::new(temp_path("missing"));
        assert!(store.get("anything").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let path = temp_path("persist");

        let store = JsonFileStore::new(&path);
        store.set("first", json!([1, 2, 3])).unwrap();
        store.set("second", json!("x")).unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.get("first").unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(reopened.get("second").unwrap(), Some(json!("x")));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_file_store_rejects_non_object() {
        let path = temp_path("array");
        fs::write(&path, "[1, 2]").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.get("k"), Err(StoreError::NotAnObject(_))));

        let _ = fs::remove_file(&path);
    }
}
