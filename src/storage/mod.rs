//! # Storage Module
//!
//! This module implements the heap underneath the store: one growable
//! backing file, cut into fixed-size views, each view carved into a chain of
//! arenas.
//!
//! ## Architecture Overview
//!
//! ```text
//! ViewManager
//! ├── MappedFile               backing file, grows by whole views
//! └── View 0..n                one mapped window each while open
//!       ├── ViewHeader         signature, free_space, max_free_space
//!       └── Arena chain        [hdr][payload] [hdr][payload] ...
//! ```
//!
//! Leaf first:
//!
//! - `headers`: zerocopy `ViewHeader` / `ArenaHeader` read and written in place
//! - `arena`: `ArenaChain` / `ArenaChainMut`, split, coalesce, swap, content
//! - `mmap`: `MappedFile`, per-view windows and growth
//! - `view`: `View`, allocation with the last-free hint and defragmentation
//! - `view_manager`: `ViewManager`, bounded open set and growth
//!
//! ## Safety Model
//!
//! Each open view owns its own `MmapMut`. Arena accessors borrow the view,
//! so the borrow checker rules out holding arena bytes across a call that
//! can close the view or move arenas:
//!
//! ```text
//! View::chain(&self) -> ArenaChain<'_>       // borrows the mapping
//! View::defragment(&mut self)                // moves arenas, needs &mut
//! ViewManager::open_view(&mut self, id)      // may close other views
//! ```
//!
//! Locations that must survive such calls are kept as `(view id, offset)`
//! handles, never as references.

pub mod arena;
pub mod headers;
pub mod mmap;
pub mod view;
pub mod view_manager;

pub use arena::{Arena, ArenaChain, ArenaChainMut, ChainUsage, Split};
pub use headers::{ArenaHeader, ArenaStatus, ViewHeader};
pub use mmap::{allocation_granularity, round_view_size, MappedFile};
pub use view::{Relocation, View, ViewStats};
pub use view_manager::{StorageFull, ViewManager};
