//! # Store Layer
//!
//! The key/value layer on top of the arena heap:
//!
//! - `engine`: `StorageEngine`, key index, placement, enumeration
//! - `envelope`: `(key, value)` encoding written into arenas
//! - `persistence`: side file holding the key index between runs
//! - `provider`: `StorageProvider`, the locked, capacity-accounted facade
//! - `builder`: `StoreConfig` and `StoreBuilder`
//!
//! Placement outcomes are reported as [`StoreResult`] values. Only I/O and
//! contract violations (empty key or value) are errors.

pub mod builder;
pub mod engine;
pub mod envelope;
pub mod persistence;
pub mod provider;

pub use builder::{StoreBuilder, StoreConfig};
pub use engine::{Entries, Locator, StorageEngine, StoreStats};
pub use provider::StorageProvider;

/// Outcome of a placement operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Success,
    KeyExists,
    KeyNotFound,
    NotEnoughSpace,
}

impl StoreResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StoreResult::Success)
    }
}

impl std::fmt::Display for StoreResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoreResult::Success => "success",
            StoreResult::KeyExists => "key exists",
            StoreResult::KeyNotFound => "key not found",
            StoreResult::NotEnoughSpace => "not enough space",
        };
        f.write_str(s)
    }
}
