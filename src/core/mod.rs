//! Core primitives.
//!
//! Digests, ids, timestamps and lock helpers shared by every layer.

pub mod clock;
pub mod hash;
pub mod sync;

pub use hash::{StateHash, StateHasher};
