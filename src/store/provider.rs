//! # Storage Provider
//!
//! `StorageProvider` is the public face of the store: a thread-safe wrapper
//! around `StorageEngine` with capacity accounting and index persistence.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` guards the engine, the key index and every
//! view/arena operation. Every public method takes the lock for its whole
//! duration, including long scans (defragmentation, enumeration, state
//! save/load). Once a mutating call returns, every later call observes its
//! effect.
//!
//! ## State Persistence
//!
//! ```text
//! open()   -> load state file, else rebuild index from views
//! mutation -> save state file if state_save_interval has elapsed
//! close()  -> save state file, flush views
//! drop     -> same as close(), errors logged
//! ```
//!
//! A failed save is logged and the store keeps running; only an explicit
//! `save_state()` call reports it. The next reopen falls back to a scan of
//! the views.

use std::path::PathBuf;
use std::time::Instant;

use eyre::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::builder::{StoreBuilder, StoreConfig};
use super::engine::{Entries, StorageEngine, StoreStats};
use super::persistence;
use super::StoreResult;
use crate::storage::{MappedFile, ViewManager};

struct ProviderState {
    engine: StorageEngine,
    state_path: Option<PathBuf>,
    last_save: Instant,
    dirty: bool,
    closed: bool,
}

impl ProviderState {
    fn save_state(&mut self) -> Result<()> {
        if let Some(path) = &self.state_path {
            persistence::save(path, self.engine.locators())?;
        }
        self.last_save = Instant::now();
        self.dirty = false;
        Ok(())
    }

    fn try_save_state(&mut self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to save index state");
        }
    }

    fn mark_dirty(&mut self, config: &StoreConfig) {
        self.dirty = true;
        if self.last_save.elapsed() >= config.state_save_interval {
            self.try_save_state();
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.try_save_state();
        self.engine.flush()
    }
}

pub struct StorageProvider {
    config: StoreConfig,
    state: Mutex<ProviderState>,
}

impl StorageProvider {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens or creates the store described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let view_size = config.effective_view_size();
        let file = MappedFile::open_or_create(&config.path, view_size, config.effective_view_count())?;
        if let Some(max_size) = config.max_size_limit() {
            eyre::ensure!(
                file.file_size() <= max_size,
                "backing file '{}' is {} bytes, above max_size {}",
                config.path.display(),
                file.file_size(),
                max_size
            );
        }

        let views = ViewManager::new(file, config.max_open_views, config.max_size_limit());
        let mut engine = StorageEngine::new(views, config.extend_views);

        let loaded = match &config.state_path {
            Some(path) => persistence::load(path),
            None => Ok(None),
        };
        engine.restore(loaded)?;

        info!(
            path = %config.path.display(),
            views = engine.views().view_count(),
            view_size,
            items = engine.count(),
            "opened store"
        );

        Ok(Self {
            state: Mutex::new(ProviderState {
                engine,
                state_path: config.state_path.clone(),
                last_save: Instant::now(),
                dirty: false,
                closed: false,
            }),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<StoreResult> {
        let mut state = self.state.lock();
        let result = state.engine.add(key, value)?;
        if result.is_success() {
            state.mark_dirty(&self.config);
        }
        Ok(result)
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<StoreResult> {
        let mut state = self.state.lock();
        let existed = state.engine.contains(key);
        let result = state.engine.insert(key, value)?;
        if result.is_success() || existed {
            state.mark_dirty(&self.config);
        }
        Ok(result)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.lock().engine.get(key)
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let value = state.engine.remove(key)?;
        if value.is_some() {
            state.mark_dirty(&self.config);
        }
        Ok(value)
    }

    /// Removes `key`, reporting `KeyNotFound` when it was absent.
    pub fn delete(&self, key: &[u8]) -> Result<StoreResult> {
        Ok(match self.remove(key)? {
            Some(_) => StoreResult::Success,
            None => StoreResult::KeyNotFound,
        })
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.lock().engine.contains(key)
    }

    pub fn item_size(&self, key: &[u8]) -> Result<Option<usize>> {
        self.state.lock().engine.item_size(key)
    }

    pub fn count(&self) -> usize {
        self.state.lock().engine.count()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.state.lock().engine.keys()
    }

    /// Runs `f` over a lazy enumeration of every item while holding the lock.
    pub fn enumerate<R>(&self, f: impl FnOnce(Entries<'_>) -> R) -> R {
        let mut state = self.state.lock();
        f(state.engine.iter())
    }

    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.enumerate(|entries| entries.collect())
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.engine.clear()?;
        state.try_save_state();
        Ok(())
    }

    /// Bytes held by stored items (keys included).
    pub fn size(&self) -> u64 {
        self.state.lock().engine.stored_bytes()
    }

    /// Configured file size ceiling, if any.
    pub fn max_size(&self) -> Option<u64> {
        self.config.max_size_limit()
    }

    pub fn file_size(&self) -> u64 {
        self.state.lock().engine.file_size()
    }

    /// Whether an item of this size could be stored at all.
    pub fn check_size(&self, key_len: usize, value_len: usize) -> bool {
        self.state.lock().engine.check_size(key_len, value_len)
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().engine.stats()
    }

    pub fn defragment(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.engine.defragment_all()?;
        state.mark_dirty(&self.config);
        Ok(())
    }

    pub fn save_state(&self) -> Result<()> {
        self.state.lock().save_state()
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.dirty {
            state.try_save_state();
        }
        state.engine.flush()
    }

    /// Saves the index and flushes every open view.
    pub fn close(self) -> Result<()> {
        let result = self.state.lock().shutdown();
        if result.is_ok() {
            info!(path = %self.config.path.display(), "closed store");
        }
        result
    }
}

impl Drop for StorageProvider {
    fn drop(&mut self) {
        if let Err(e) = self.state.get_mut().shutdown() {
            warn!(error = %e, "failed to close store cleanly");
        }
    }
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::round_view_size;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn provider_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StorageProvider>();
    }

    #[test]
    fn add_get_remove() {
        let dir = tempdir().unwrap();
        let store = StorageProvider::builder()
            .path(dir.path().join("cache.heap"))
            .view_size(round_view_size(1))
            .open()
            .unwrap();

        assert_eq!(store.add(b"k", b"v").unwrap(), StoreResult::Success);
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"v");
        assert_eq!(store.delete(b"k").unwrap(), StoreResult::Success);
        assert_eq!(store.delete(b"k").unwrap(), StoreResult::KeyNotFound);
    }

    #[test]
    fn zero_interval_saves_after_each_mutation() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.idx");
        let store = StorageProvider::builder()
            .path(dir.path().join("cache.heap"))
            .view_size(round_view_size(1))
            .state_path(&state_path)
            .state_save_interval(Duration::ZERO)
            .open()
            .unwrap();

        store.add(b"k", b"v").unwrap();

        let loaded = persistence::load(&state_path).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].0, b"k");
    }

    #[test]
    fn close_writes_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.heap");
        let store = StorageProvider::builder()
            .path(&path)
            .view_size(round_view_size(1))
            .open()
            .unwrap();
        store.add(b"a", b"1").unwrap();
        let state_path = store.config().state_path.clone().unwrap();

        store.close().unwrap();

        let loaded = persistence::load(&state_path).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 1);
    }

    #[test]
    fn failed_state_save_does_not_fail_mutations() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("missing").join("state.idx");
        let store = StorageProvider::builder()
            .path(dir.path().join("cache.heap"))
            .view_size(round_view_size(1))
            .state_path(&state_path)
            .state_save_interval(Duration::ZERO)
            .open()
            .unwrap();

        assert_eq!(store.add(b"a", b"1").unwrap(), StoreResult::Success);
        store.clear().unwrap();
        assert_eq!(store.count(), 0);
        store.add(b"b", b"2").unwrap();
        store.flush().unwrap();

        assert!(store.save_state().is_err());
        assert!(!state_path.exists());
        store.close().unwrap();
    }

    #[test]
    fn clear_empties_state_file() {
        let dir = tempdir().unwrap();
        let store = StorageProvider::builder()
            .path(dir.path().join("cache.heap"))
            .view_size(round_view_size(1))
            .open()
            .unwrap();
        store.add(b"a", b"1").unwrap();

        store.clear().unwrap();

        let state_path = store.config().state_path.clone().unwrap();
        assert!(persistence::load(&state_path).unwrap().unwrap().entries.is_empty());
        assert_eq!(store.count(), 0);
        assert_eq!(store.size(), 0);
    }
}
