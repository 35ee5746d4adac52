//! # mapheap Configuration Module
//!
//! Centralized layout constants and default tuning values. Layout constants
//! are interdependent (the split threshold is derived from the arena header
//! size, the minimum view size from both headers), so they are kept in one
//! place and checked at compile time.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
