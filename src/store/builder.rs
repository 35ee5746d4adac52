//! # Store Builder
//!
//! This module provides `StoreConfig`, the resolved construction-time
//! settings of a store, and `StoreBuilder`, the fluent API that produces it
//! and opens a `StorageProvider`.
//!
//! ## Configuration Options
//!
//! | Option              | Default            | Description                                  |
//! |---------------------|--------------------|----------------------------------------------|
//! | path                | (required)         | Backing file                                 |
//! | view_size           | 4 MiB              | Bytes per view, rounded up to granularity    |
//! | initial_view_count  | 1                  | Views created with a new backing file        |
//! | initial_size        | 0                  | Minimum initial file size in bytes           |
//! | max_size            | 0 (unbounded)      | Ceiling on the backing file size             |
//! | max_open_views      | 8                  | Views mapped at the same time                |
//! | extend_views        | 1                  | Views appended when every view is full       |
//! | state_path          | `<path>.idx`       | Side file for the key index                  |
//! | state_save_interval | 60 s               | Minimum time between index saves             |
//!
//! When both `initial_view_count` and `initial_size` are given, the larger
//! resulting file wins.
//!
//! Reopening an existing file with a different `view_size` does not
//! truncate it: the file is extended to a view boundary and every view whose
//! header no longer carries a valid signature is reformatted, so items in
//! those views are lost. Reopen with the original `view_size` to keep them.
//!
//! ## Usage Examples
//!
//! ```ignore
//! let store = StorageProvider::builder()
//!     .path("./cache.heap")
//!     .view_size(1024 * 1024)
//!     .max_size(256 * 1024 * 1024)
//!     .max_open_views(4)
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{ensure, Result};

use super::provider::StorageProvider;
use crate::config::{
    DEFAULT_EXTEND_VIEWS, DEFAULT_INITIAL_VIEW_COUNT, DEFAULT_MAX_OPEN_VIEWS,
    DEFAULT_STATE_SAVE_INTERVAL, DEFAULT_VIEW_SIZE, MIN_MAX_OPEN_VIEWS, STATE_FILE_EXTENSION,
};
use crate::storage::round_view_size;

/// Resolved store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub view_size: usize,
    pub initial_view_count: u32,
    pub initial_size: u64,
    /// Ceiling on the backing file size in bytes; 0 means unbounded.
    pub max_size: u64,
    pub max_open_views: usize,
    pub extend_views: u32,
    /// Side file for the key index; `None` disables index persistence.
    pub state_path: Option<PathBuf>,
    pub state_save_interval: Duration,
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            state_path: Some(default_state_path(&path)),
            path,
            view_size: DEFAULT_VIEW_SIZE,
            initial_view_count: DEFAULT_INITIAL_VIEW_COUNT,
            initial_size: 0,
            max_size: 0,
            max_open_views: DEFAULT_MAX_OPEN_VIEWS,
            extend_views: DEFAULT_EXTEND_VIEWS,
            state_save_interval: DEFAULT_STATE_SAVE_INTERVAL,
        }
    }

    /// View size after rounding to the platform allocation granularity.
    pub fn effective_view_size(&self) -> usize {
        round_view_size(self.view_size)
    }

    /// Number of views the backing file starts with.
    pub fn effective_view_count(&self) -> u32 {
        let view_size = self.effective_view_size() as u64;
        let from_size = self.initial_size.div_ceil(view_size).min(u32::MAX as u64) as u32;
        self.initial_view_count.max(from_size).max(1)
    }

    pub fn max_size_limit(&self) -> Option<u64> {
        (self.max_size > 0).then_some(self.max_size)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.path.as_os_str().is_empty(),
            "backing file path must not be empty"
        );
        ensure!(
            self.max_open_views >= MIN_MAX_OPEN_VIEWS,
            "max_open_views must be at least {}",
            MIN_MAX_OPEN_VIEWS
        );

        if let Some(max_size) = self.max_size_limit() {
            let initial = self.effective_view_count() as u64 * self.effective_view_size() as u64;
            ensure!(
                initial <= max_size,
                "initial file size {} exceeds max_size {}",
                initial,
                max_size
            );
        }
        Ok(())
    }
}

fn default_state_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(STATE_FILE_EXTENSION);
    PathBuf::from(name)
}

/// Builder for configuring and opening a store.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    path: Option<PathBuf>,
    view_size: Option<usize>,
    initial_view_count: Option<u32>,
    initial_size: Option<u64>,
    max_size: Option<u64>,
    max_open_views: Option<usize>,
    extend_views: Option<u32>,
    state_path: Option<Option<PathBuf>>,
    state_save_interval: Option<Duration>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backing file. Created if it does not exist.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the view size in bytes. Rounded up to the allocation granularity.
    pub fn view_size(mut self, bytes: usize) -> Self {
        self.view_size = Some(bytes);
        self
    }

    pub fn initial_view_count(mut self, count: u32) -> Self {
        self.initial_view_count = Some(count);
        self
    }

    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = Some(bytes);
        self
    }

    /// Caps the backing file size. Adds that would need a larger file return
    /// `NotEnoughSpace`.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn max_open_views(mut self, count: usize) -> Self {
        self.max_open_views = Some(count);
        self
    }

    pub fn extend_views(mut self, count: u32) -> Self {
        self.extend_views = Some(count);
        self
    }

    pub fn state_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.state_path = Some(Some(path.as_ref().to_path_buf()));
        self
    }

    /// Keeps the key index in memory only. Reopening rebuilds it from the views.
    pub fn without_state(mut self) -> Self {
        self.state_path = Some(None);
        self
    }

    pub fn state_save_interval(mut self, interval: Duration) -> Self {
        self.state_save_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("backing file not specified: call .path() first"))?;

        let mut config = StoreConfig::new(path);
        if let Some(view_size) = self.view_size {
            config.view_size = view_size;
        }
        if let Some(count) = self.initial_view_count {
            config.initial_view_count = count;
        }
        if let Some(bytes) = self.initial_size {
            config.initial_size = bytes;
        }
        if let Some(bytes) = self.max_size {
            config.max_size = bytes;
        }
        if let Some(count) = self.max_open_views {
            config.max_open_views = count;
        }
        if let Some(count) = self.extend_views {
            config.extend_views = count;
        }
        if let Some(state_path) = self.state_path {
            config.state_path = state_path;
        }
        if let Some(interval) = self.state_save_interval {
            config.state_save_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn open(self) -> Result<StorageProvider> {
        StorageProvider::open(self.build()?)
    }
}
