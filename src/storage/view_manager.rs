//! # View Manager
//!
//! The `ViewManager` owns the backing file and every view descriptor, and is
//! the only component that opens or closes views. It keeps at most
//! `max_open_views` windows mapped at once and grows the file when no view
//! has room left.
//!
//! ## Open/Closed Partition
//!
//! ```text
//! ViewManager
//! ├── file: MappedFile
//! ├── views: Vec<View>     (indexed by view id)
//! ├── open: Vec<u32>       (ids with a live mapping)
//! └── closed: Vec<u32>     (ids without one)
//! ```
//!
//! Every id is in exactly one of `open` / `closed`.
//!
//! ## Eviction of Open Views
//!
//! When a closed view must be opened and `open.len() == max_open_views`, the
//! open view with the lowest usage counter is flushed and closed first. A
//! mapping failure is retried after closing further views, until no open
//! view is left to close.
//!
//! ## Growth
//!
//! `extend_views_bucket(n)` appends `n` views to the file and opens them.
//! Growth that would pass the configured `max_size`, or that the file system
//! refuses, is reported as `StorageFull` so callers can turn it into a
//! "not enough space" result.
//!
//! ## Thread Safety
//!
//! Not thread-safe. The store-wide mutex in `StorageProvider` serializes all
//! access.

use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use super::mmap::MappedFile;
use super::view::{View, ViewStats};
use crate::config::MIN_MAX_OPEN_VIEWS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageFull {
    pub requested: u64,
    pub available: u64,
}

impl std::fmt::Display for StorageFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "storage full: growth to {} bytes requested but only {} allowed",
            self.requested, self.available
        )
    }
}

impl std::error::Error for StorageFull {}

#[derive(Debug)]
pub struct ViewManager {
    file: MappedFile,
    views: Vec<View>,
    open: Vec<u32>,
    closed: Vec<u32>,
    max_open_views: usize,
    max_size: Option<u64>,
}

impl ViewManager {
    pub fn new(file: MappedFile, max_open_views: usize, max_size: Option<u64>) -> Self {
        let view_size = file.view_size();
        let views: Vec<View> = (0..file.view_count())
            .map(|id| View::new(id, view_size))
            .collect();
        let closed = (0..file.view_count()).collect();

        Self {
            file,
            views,
            open: Vec::new(),
            closed,
            max_open_views: max_open_views.max(MIN_MAX_OPEN_VIEWS),
            max_size,
        }
    }

    pub fn file(&self) -> &MappedFile {
        &self.file
    }

    pub fn view_size(&self) -> usize {
        self.file.view_size()
    }

    pub fn view_count(&self) -> u32 {
        self.views.len() as u32
    }

    pub fn max_open_views(&self) -> usize {
        self.max_open_views
    }

    pub fn open_view_count(&self) -> usize {
        self.open.len()
    }

    pub fn open_ids(&self) -> &[u32] {
        &self.open
    }

    pub fn closed_ids(&self) -> &[u32] {
        &self.closed
    }

    pub fn is_open(&self, id: u32) -> bool {
        self.views.get(id as usize).is_some_and(View::is_open)
    }

    /// Returns the view `id`, opening it if it is closed.
    pub fn view_mut(&mut self, id: u32) -> Result<&mut View> {
        if !self.open_view(id)? {
            eyre::bail!("view {} could not be opened", id);
        }
        Ok(&mut self.views[id as usize])
    }

    /// Returns the view `id` only if it is currently open.
    pub fn open_view_ref(&self, id: u32) -> Option<&View> {
        self.views.get(id as usize).filter(|v| v.is_open())
    }

    /// Finds a view with at least `need` free bytes, preferring open ones.
    pub fn get_matching_view(&mut self, need: usize) -> Result<Option<u32>> {
        for &id in &self.open {
            if self.views[id as usize].free_space()? as usize >= need {
                return Ok(Some(id));
            }
        }

        let candidates: Vec<u32> = self.closed.clone();
        for id in candidates {
            if !self.open_view(id)? {
                continue;
            }
            if self.views[id as usize].free_space()? as usize >= need {
                return Ok(Some(id));
            }
        }

        Ok(None)
    }

    /// Opens view `id`, closing the least used open view when at the limit.
    ///
    /// Returns `false` if the view cannot be mapped even with every other
    /// view closed.
    pub fn open_view(&mut self, id: u32) -> Result<bool> {
        let index = id as usize;
        eyre::ensure!(
            index < self.views.len(),
            "view {} out of bounds (view_count={})",
            id,
            self.views.len()
        );

        if self.views[index].is_open() {
            return Ok(true);
        }

        while self.open.len() >= self.max_open_views {
            if !self.close_least_used()? {
                break;
            }
        }

        loop {
            match self.views[index].open(&self.file) {
                Ok(formatted) => {
                    if formatted {
                        info!(view = id, "formatted view");
                    }
                    self.closed.retain(|&c| c != id);
                    self.open.push(id);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(view = id, error = %e, "failed to map view");
                    if !self.close_least_used()? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn close_least_used(&mut self) -> Result<bool> {
        let victim = self
            .open
            .iter()
            .copied()
            .min_by_key(|&id| self.views[id as usize].usage());

        match victim {
            Some(id) => {
                self.close_view(id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn close_view(&mut self, id: u32) -> Result<()> {
        let Some(view) = self.views.get_mut(id as usize) else {
            return Ok(());
        };
        if !view.is_open() {
            return Ok(());
        }

        debug!(view = id, usage = view.usage(), "closing view");
        view.close()?;
        self.open.retain(|&o| o != id);
        self.closed.push(id);
        Ok(())
    }

    /// Appends `count` views to the backing file and opens them.
    pub fn extend_views_bucket(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let requested = self.file.file_size() + count as u64 * self.view_size() as u64;
        if let Some(max_size) = self.max_size {
            if requested > max_size {
                return Err(StorageFull {
                    requested,
                    available: max_size,
                }
                .into());
            }
        }

        for &id in &self.open {
            self.views[id as usize].flush()?;
        }

        if let Err(e) = self.file.grow(count) {
            warn!(error = %e, requested, "failed to grow backing file");
            return Err(StorageFull {
                requested,
                available: self.file.file_size(),
            }
            .into());
        }

        let first_new = self.views.len() as u32;
        for id in first_new..first_new + count {
            self.views.push(View::new(id, self.view_size()));
            self.closed.push(id);
        }
        for id in first_new..first_new + count {
            self.open_view(id)?;
        }

        info!(
            added = count,
            views = self.views.len(),
            file_size = self.file.file_size(),
            "extended backing file"
        );
        Ok(())
    }

    pub fn close_all_views(&mut self) -> Result<()> {
        let open: Vec<u32> = self.open.clone();
        for id in open {
            self.close_view(id)?;
        }
        Ok(())
    }

    /// Reformats every view, opening at most `max_open_views` at a time.
    pub fn clear_all_views(&mut self) -> Result<()> {
        self.close_all_views()?;

        for id in 0..self.views.len() as u32 {
            if !self.open_view(id)? {
                eyre::bail!("view {} could not be opened for clearing", id);
            }
            self.views[id as usize]
                .format()
                .wrap_err_with(|| format!("failed to format view {}", id))?;
        }

        info!(views = self.views.len(), "cleared all views");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        for &id in &self.open {
            self.views[id as usize].flush()?;
        }
        self.file.sync()
    }

    pub fn stats(&self) -> Vec<ViewStats> {
        self.views.iter().map(View::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::required_space;
    use crate::storage::mmap::round_view_size;
    use tempfile::{tempdir, TempDir};

    fn manager(views: u32, max_open: usize, max_size: Option<u64>) -> (TempDir, ViewManager) {
        let dir = tempdir().unwrap();
        let file = MappedFile::create(dir.path().join("heap.dat"), round_view_size(1), views).unwrap();
        (dir, ViewManager::new(file, max_open, max_size))
    }

    #[test]
    fn new_manager_has_all_views_closed() {
        let (_dir, vm) = manager(3, 2, None);

        assert_eq!(vm.view_count(), 3);
        assert_eq!(vm.open_view_count(), 0);
        assert_eq!(vm.closed_ids(), &[0, 1, 2]);
    }

    #[test]
    fn open_view_formats_new_views() {
        let (_dir, mut vm) = manager(1, 2, None);

        assert!(vm.open_view(0).unwrap());

        let view = vm.open_view_ref(0).unwrap();
        assert!(view.chain().is_ok());
        assert!(vm.is_open(0));
        assert!(vm.closed_ids().is_empty());
    }

    #[test]
    fn open_view_is_idempotent() {
        let (_dir, mut vm) = manager(1, 2, None);

        vm.open_view(0).unwrap();
        vm.open_view(0).unwrap();

        assert_eq!(vm.open_ids(), &[0]);
    }

    #[test]
    fn open_limit_closes_least_used_view() {
        let (_dir, mut vm) = manager(3, 2, None);

        vm.open_view(0).unwrap();
        vm.open_view(1).unwrap();
        for _ in 0..3 {
            let view = vm.view_mut(0).unwrap();
            let arena = view.allocate(required_space(4)).unwrap().unwrap();
            view.write(arena, b"busy").unwrap();
        }

        vm.open_view(2).unwrap();

        assert_eq!(vm.open_view_count(), 2);
        assert!(vm.is_open(0));
        assert!(!vm.is_open(1));
        assert!(vm.is_open(2));
    }

    #[test]
    fn open_views_never_exceed_limit() {
        let (_dir, mut vm) = manager(6, 2, None);

        for id in [0, 1, 2, 3, 4, 5, 0, 3] {
            vm.open_view(id).unwrap();
            assert!(vm.open_view_count() <= 2);
            assert_eq!(vm.open_view_count() + vm.closed_ids().len(), 6);
        }
    }

    #[test]
    fn get_matching_view_prefers_open_views() {
        let (_dir, mut vm) = manager(2, 2, None);
        vm.open_view(1).unwrap();

        let id = vm.get_matching_view(100).unwrap();

        assert_eq!(id, Some(1));
        assert!(!vm.is_open(0));
    }

    #[test]
    fn get_matching_view_opens_closed_view() {
        let (_dir, mut vm) = manager(2, 1, None);
        let size = vm.view_size();

        let id = vm.get_matching_view(size / 2).unwrap();

        assert_eq!(id, Some(0));
        assert!(vm.is_open(0));
    }

    #[test]
    fn get_matching_view_returns_none_when_too_large() {
        let (_dir, mut vm) = manager(2, 2, None);
        let size = vm.view_size();

        assert_eq!(vm.get_matching_view(size).unwrap(), None);
    }

    #[test]
    fn extend_views_bucket_adds_open_views() {
        let (_dir, mut vm) = manager(1, 4, None);

        vm.extend_views_bucket(2).unwrap();

        assert_eq!(vm.view_count(), 3);
        assert_eq!(vm.file().view_count(), 3);
        assert!(vm.is_open(1));
        assert!(vm.is_open(2));
    }

    #[test]
    fn extend_views_bucket_respects_max_size() {
        let (_dir, mut vm) = manager(1, 4, None);
        let view_size = vm.view_size() as u64;
        vm.max_size = Some(view_size);

        let err = vm.extend_views_bucket(1).unwrap_err();

        assert!(err.downcast_ref::<StorageFull>().is_some());
        assert_eq!(vm.view_count(), 1);
    }

    #[test]
    fn extend_views_bucket_maps_grow_failure_to_storage_full() {
        let (_dir, mut vm) = manager(1, 4, None);
        let file_size = vm.file().file_size();

        let err = vm.extend_views_bucket(u32::MAX).unwrap_err();

        let full = err.downcast_ref::<StorageFull>().unwrap();
        assert_eq!(full.available, file_size);
        assert_eq!(vm.view_count(), 1);
        assert_eq!(vm.file().file_size(), file_size);
    }

    #[test]
    fn open_view_closes_other_views_before_giving_up() {
        let (_dir, mut vm) = manager(2, 3, None);
        vm.open_view(0).unwrap();
        vm.open_view(1).unwrap();
        // Descriptor past the end of the file, so mapping it always fails.
        let view_size = vm.view_size();
        vm.views.push(View::new(2, view_size));
        vm.closed.push(2);

        assert!(!vm.open_view(2).unwrap());

        assert_eq!(vm.open_view_count(), 0);
        assert!(!vm.is_open(2));
        assert_eq!(vm.closed_ids().len(), 3);
        assert!(vm.open_view(1).unwrap());
    }

    #[test]
    fn clear_all_views_reformats_within_limit() {
        let (_dir, mut vm) = manager(3, 1, None);
        let view = vm.view_mut(0).unwrap();
        let before = view.free_space().unwrap();
        let arena = view.allocate(required_space(10)).unwrap().unwrap();
        view.write(arena, &[1u8; 10]).unwrap();

        vm.clear_all_views().unwrap();

        assert!(vm.open_view_count() <= 1);
        assert_eq!(vm.view_mut(0).unwrap().free_space().unwrap(), before);
    }

    #[test]
    fn views_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        let view_size = round_view_size(1);
        let offset;

        {
            let file = MappedFile::create(&path, view_size, 1).unwrap();
            let mut vm = ViewManager::new(file, 1, None);
            let view = vm.view_mut(0).unwrap();
            let arena = view.allocate(required_space(5)).unwrap().unwrap();
            view.write(arena, b"kept!").unwrap();
            offset = arena.offset();
            vm.flush().unwrap();
        }

        let file = MappedFile::open(&path, view_size).unwrap();
        let mut vm = ViewManager::new(file, 1, None);
        let view = vm.view_mut(0).unwrap();

        assert_eq!(
            view.read(crate::storage::Arena::at(offset)).unwrap(),
            b"kept!"
        );
    }
}
