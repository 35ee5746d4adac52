//! # mapheap - Memory-Mapped Object Cache Storage
//!
//! mapheap stores opaque key/value items outside the process heap, in a
//! self-managed arena heap on top of one growable memory-mapped file. Only a
//! bounded number of fixed-size windows ("views") of that file are mapped at
//! any time; the rest are opened on demand and closed least-used first.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mapheap::{StorageProvider, StoreResult};
//!
//! let store = StorageProvider::builder()
//!     .path("./cache.heap")
//!     .max_open_views(4)
//!     .open()?;
//!
//! assert_eq!(store.add(b"user:1", b"serialized item")?, StoreResult::Success);
//! let item = store.get(b"user:1")?;
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   StorageProvider (lock, capacity,  │
//! │   index persistence)                │
//! ├─────────────────────────────────────┤
//! │   StorageEngine (key -> locator,    │
//! │   envelopes, enumeration)           │
//! ├─────────────────────────────────────┤
//! │   ViewManager (open set, growth)    │
//! ├─────────────────────────────────────┤
//! │   View (allocate, defragment)       │
//! ├─────────────────────────────────────┤
//! │   Arena chain (split, coalesce,     │
//! │   swap, content)                    │
//! ├─────────────────────────────────────┤
//! │   MappedFile (windows over a file)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! cache.heap        views, each [ViewHeader][arena][arena]...
//! cache.heap.idx    key index saved between runs (optional)
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and defaults
//! - [`storage`]: mapped file, headers, arenas, views, view manager
//! - [`store`]: engine, envelope, index persistence, provider, builder

#[macro_use]
mod macros;

pub mod config;
pub mod storage;
pub mod store;

pub use storage::StorageFull;
pub use store::{
    Locator, StorageEngine, StorageProvider, StoreBuilder, StoreConfig, StoreResult, StoreStats,
};
