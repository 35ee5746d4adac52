//! # mapheap Configuration Constants
//!
//! This module centralizes the on-disk layout constants and the default tuning
//! values of the store. Layout constants that depend on each other are
//! co-located and checked with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! VIEW_HEADER_SIZE (12 bytes: signature, free_space, max_free_space)
//!       │
//!       └─> FIRST_ARENA_OFFSET (first arena starts right after the header)
//!
//! ARENA_HEADER_SIZE (13 bytes: status, capacity, next, prev)
//!       │
//!       ├─> SPLIT_THRESHOLD (header + 8 bytes; smaller remainders are not split)
//!       │
//!       └─> MIN_VIEW_SIZE (a view must hold its header plus one splittable arena)
//!
//! CONTENT_PREFIX_SIZE (4 bytes length prefix of every stored payload)
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `FIRST_ARENA_OFFSET != 0`: offset 0 doubles as the "no neighbor" marker
//!    in arena links, so no arena may ever start there.
//! 2. `SPLIT_THRESHOLD > ARENA_HEADER_SIZE`: a split remainder must always be
//!    able to hold its own header plus a non-empty payload.
//!
//! ## Modifying Constants
//!
//! Changing any layout constant changes the file format. Bump
//! `VIEW_SIGNATURE` together with it so existing files are reformatted
//! instead of misread.

use std::time::Duration;

// ============================================================================
// VIEW LAYOUT CONSTANTS
// ============================================================================

/// Signature stamped at offset 0 of every formatted view ("MHV1").
/// A view whose first four bytes differ is treated as unformatted.
pub const VIEW_SIGNATURE: u32 = 0x4D48_5631;

/// Size of the per-view header in bytes.
pub const VIEW_HEADER_SIZE: usize = 12;

/// Offset of the first arena inside a view.
pub const FIRST_ARENA_OFFSET: usize = VIEW_HEADER_SIZE;

// ============================================================================
// ARENA LAYOUT CONSTANTS
// ============================================================================

/// Size of the per-arena header in bytes.
pub const ARENA_HEADER_SIZE: usize = 13;

/// Size of the length prefix written before every payload.
pub const CONTENT_PREFIX_SIZE: usize = 4;

/// Remainders smaller than this are folded into the allocation instead of
/// becoming a separate free arena.
pub const SPLIT_THRESHOLD: usize = ARENA_HEADER_SIZE + 8;

/// Smallest view that can be formatted.
pub const MIN_VIEW_SIZE: usize = VIEW_HEADER_SIZE + ARENA_HEADER_SIZE + SPLIT_THRESHOLD;

const _: () = assert!(FIRST_ARENA_OFFSET != 0, "offset 0 is the null arena link");

const _: () = assert!(
    SPLIT_THRESHOLD > ARENA_HEADER_SIZE,
    "split remainder must fit an arena header plus payload"
);

/// Bytes an arena must offer to hold a payload of `len` bytes.
pub const fn required_space(len: usize) -> usize {
    len + CONTENT_PREFIX_SIZE
}

// ============================================================================
// DEFAULT TUNING VALUES
// ============================================================================

/// Default size of a single view (4 MiB).
pub const DEFAULT_VIEW_SIZE: usize = 4 * 1024 * 1024;

/// Number of views created with a new backing file.
pub const DEFAULT_INITIAL_VIEW_COUNT: u32 = 1;

/// Maximum number of simultaneously mapped views.
pub const DEFAULT_MAX_OPEN_VIEWS: usize = 8;

/// Minimum allowed value for the max open views setting.
pub const MIN_MAX_OPEN_VIEWS: usize = 1;

/// Number of views appended when every existing view is full.
pub const DEFAULT_EXTEND_VIEWS: u32 = 1;

/// How often the key index is written to the side file.
pub const DEFAULT_STATE_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Allocation granularity used where the platform cannot be queried.
pub const FALLBACK_ALLOCATION_GRANULARITY: usize = 64 * 1024;

// ============================================================================
// FILE NAMES
// ============================================================================

/// Extension appended to the backing file path for the side index file.
pub const STATE_FILE_EXTENSION: &str = "idx";

/// Marker blob length for index entries that must be skipped on reload.
pub const SKIPPED_ENTRY_LEN: i32 = -1;
