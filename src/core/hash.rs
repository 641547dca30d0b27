//! State Hashing for Replica Verification
//!
//! Provides deterministic hashing of collector state for:
//! - Checking that every participant of a session applied the same effect log
//! - Fingerprinting stored event data in logs

use sha2::{Sha256, Digest};
use uuid::Uuid;

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for collector state.
///
/// Wraps SHA-256 with helpers for the types the collector hashes.
/// Order of updates is critical for determinism.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for the pending event queue.
    pub fn for_queue() -> Self {
        Self::new(b"PARK_ANALYTICS_QUEUE_V1")
    }

    /// Create hasher for persisted event data.
    pub fn for_store() -> Self {
        Self::new(b"PARK_ANALYTICS_STORE_V1")
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &Uuid) {
        self.hasher.update(uuid.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Short hex form of a hash for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_determinism() {
        let id = Uuid::from_bytes([7; 16]);

        let mut h1 = StateHasher::for_queue();
        h1.update_u32(3);
        h1.update_uuid(&id);
        h1.update_str("ride_built");

        let mut h2 = StateHasher::for_queue();
        h2.update_u32(3);
        h2.update_uuid(&id);
        h2.update_str("ride_built");

        assert_eq!(h1.finalize(), h2.finalize());
    }

    #[test]
    fn test_domain_separation() {
        let queue = StateHasher::for_queue().finalize();
        let store = StateHasher::for_store().finalize();
        assert_ne!(queue, store);
    }

    #[test]
    fn test_length_prefix_prevents_concatenation_collisions() {
        let mut h1 = StateHasher::for_queue();
        h1.update_str("ab");
        h1.update_str("c");

        let mut h2 = StateHasher::for_queue();
        h2.update_str("a");
        h2.update_str("bc");

        assert_ne!(h1.finalize(), h2.finalize());
    }

    #[test]
    fn test_short_hex() {
        let hash = [0xab; 32];
        assert_eq!(short_hex(&hash), "abababababababab");
    }
}
