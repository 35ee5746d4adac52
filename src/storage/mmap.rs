//! # Mapped Backing File
//!
//! This module implements `MappedFile`, the owner of the single growable file
//! that backs the heap. The file is divided into equal, fixed-size views; a
//! view is never mapped as part of a whole-file mapping but through its own
//! window:
//!
//! ```text
//! Offset 0                 View 0 (view_size bytes)
//! Offset view_size         View 1
//! Offset 2 * view_size     View 2
//! ...
//! ```
//!
//! View `id` covers `[id * view_size, (id + 1) * view_size)`. The file length
//! is always a multiple of `view_size`.
//!
//! ## Windowed Mapping
//!
//! Keeping one mapping per open view (instead of mapping the whole file)
//! bounds the address space held by the store to
//! `max_open_views * view_size`, however large the file grows. `map_view`
//! returns an owned `MmapMut` which the view holds while it is open; dropping
//! it unmaps the window.
//!
//! ## Growth
//!
//! Growth only appends views. Windows over existing views stay valid across
//! `grow()` because each is an independent mapping of a range that is still
//! inside the file. Open windows are flushed by the view manager before the
//! file is extended.
//!
//! ## Allocation Granularity
//!
//! Mapping offsets must be multiples of the platform allocation granularity
//! (the page size on unix, 64 KiB on Windows). `round_view_size` rounds the
//! configured view size up to that granularity so every view offset is
//! mappable.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path, view id
//! or requested length in the error context.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use tracing::warn;

use crate::config::{FALLBACK_ALLOCATION_GRANULARITY, MIN_VIEW_SIZE};

#[cfg(unix)]
pub fn allocation_granularity() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions; it only reads a
    // system configuration value.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as usize
    } else {
        FALLBACK_ALLOCATION_GRANULARITY
    }
}

#[cfg(not(unix))]
pub fn allocation_granularity() -> usize {
    FALLBACK_ALLOCATION_GRANULARITY
}

/// Rounds a requested view size up to a mappable size.
pub fn round_view_size(requested: usize) -> usize {
    let granularity = allocation_granularity();
    let size = requested.max(MIN_VIEW_SIZE);
    size.div_ceil(granularity) * granularity
}

#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    file: File,
    view_size: usize,
    view_count: u32,
}

impl MappedFile {
    pub fn create<P: AsRef<Path>>(path: P, view_size: usize, view_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(view_count > 0, "initial view count must be at least 1");
        Self::check_view_size(view_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create backing file '{}'", path.display()))?;

        let file_size = view_count as u64 * view_size as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            view_size,
            view_count,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, view_size: usize) -> Result<Self> {
        let path = path.as_ref();

        Self::check_view_size(view_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open backing file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty backing file '{}'",
            path.display()
        );

        ensure!(
            file_size % view_size as u64 == 0,
            "backing file '{}' size {} is not a multiple of view size {}",
            path.display(),
            file_size,
            view_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            view_size,
            view_count: (file_size / view_size as u64) as u32,
        })
    }

    /// Opens `path` if it exists, otherwise creates it.
    ///
    /// An existing file is never truncated. A length that is not a multiple of
    /// `view_size` is extended to the next view boundary; views whose
    /// signature no longer lines up are reformatted when they are opened.
    pub fn open_or_create<P: AsRef<Path>>(path: P, view_size: usize, view_count: u32) -> Result<Self> {
        let path = path.as_ref();
        Self::check_view_size(view_size)?;

        let existing_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))
            }
        };
        if existing_len == 0 {
            return Self::create(path, view_size, view_count);
        }

        let view_size_u64 = view_size as u64;
        if existing_len % view_size_u64 != 0 {
            let aligned = existing_len.div_ceil(view_size_u64) * view_size_u64;
            warn!(
                path = %path.display(),
                file_size = existing_len,
                view_size,
                aligned,
                "backing file length is not a multiple of the view size, extending"
            );
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(aligned))
                .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", path.display(), aligned))?;
        }

        let mut file = Self::open(path, view_size)?;
        if file.view_count() < view_count {
            file.grow(view_count - file.view_count())?;
        }
        Ok(file)
    }

    fn check_view_size(view_size: usize) -> Result<()> {
        ensure!(
            view_size >= MIN_VIEW_SIZE,
            "view size {} is smaller than the minimum {}",
            view_size,
            MIN_VIEW_SIZE
        );
        ensure!(
            view_size <= u32::MAX as usize,
            "view size {} exceeds the 32-bit offset range",
            view_size
        );
        ensure!(
            view_size % allocation_granularity() == 0,
            "view size {} is not a multiple of the allocation granularity {}",
            view_size,
            allocation_granularity()
        );
        Ok(())
    }

    /// Maps the window of view `id`.
    pub fn map_view(&self, id: u32) -> Result<MmapMut> {
        ensure!(
            id < self.view_count,
            "view {} out of bounds (view_count={})",
            id,
            self.view_count
        );

        let offset = id as u64 * self.view_size as u64;

        // SAFETY: MmapOptions::map_mut is unsafe because the file could be
        // truncated or modified by another process while mapped. This is
        // sound here because:
        // 1. The backing file is owned exclusively by this store (multi-process
        //    sharing is not supported)
        // 2. The file only ever grows, so [offset, offset + view_size) stays
        //    inside the file for the life of the mapping
        // 3. offset is a multiple of view_size, itself a multiple of the
        //    allocation granularity (checked in check_view_size)
        unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.view_size)
                .map_mut(&self.file)
                .wrap_err_with(|| {
                    format!(
                        "failed to map view {} of '{}' at offset {}",
                        id,
                        self.path.display(),
                        offset
                    )
                })
        }
    }

    /// Appends `additional` views to the file.
    pub fn grow(&mut self, additional: u32) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }

        let new_count = self
            .view_count
            .checked_add(additional)
            .ok_or_else(|| eyre::eyre!("view count overflow growing by {}", additional))?;
        let new_size = new_count as u64 * self.view_size as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        self.view_count = new_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn view_size(&self) -> usize {
        self.view_size
    }

    pub fn view_count(&self) -> u32 {
        self.view_count
    }

    pub fn file_size(&self) -> u64 {
        self.view_count as u64 * self.view_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn view_size() -> usize {
        round_view_size(1)
    }

    #[test]
    fn round_view_size_is_granular() {
        let granularity = allocation_granularity();

        assert_eq!(round_view_size(1), granularity.max(MIN_VIEW_SIZE));
        assert_eq!(round_view_size(granularity), granularity);
        assert_eq!(round_view_size(granularity + 1), granularity * 2);
    }

    #[test]
    fn create_new_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");

        let file = MappedFile::create(&path, view_size(), 3).unwrap();

        assert_eq!(file.view_count(), 3);
        assert_eq!(file.file_size(), 3 * view_size() as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), file.file_size());
    }

    #[test]
    fn create_fails_with_zero_views() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");

        let result = MappedFile::create(&path, view_size(), 0);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("initial view count must be at least 1"));
    }

    #[test]
    fn create_rejects_unaligned_view_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");

        let result = MappedFile::create(&path, view_size() + 1, 1);

        assert!(result.is_err());
    }

    #[test]
    fn open_existing_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");

        {
            let file = MappedFile::create(&path, view_size(), 2).unwrap();
            let mut view = file.map_view(1).unwrap();
            view[0] = 0xAB;
            view.flush().unwrap();
        }

        let file = MappedFile::open(&path, view_size()).unwrap();

        assert_eq!(file.view_count(), 2);
        assert_eq!(file.map_view(1).unwrap()[0], 0xAB);
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();

        assert!(MappedFile::open(dir.path().join("missing.dat"), view_size()).is_err());
    }

    #[test]
    fn open_or_create_extends_unaligned_file_without_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        std::fs::write(&path, b"not a heap").unwrap();

        let file = MappedFile::open_or_create(&path, view_size(), 2).unwrap();

        assert_eq!(file.view_count(), 2);
        assert_eq!(&file.map_view(0).unwrap()[..10], b"not a heap");
    }

    #[test]
    fn open_or_create_keeps_existing_views() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        {
            let file = MappedFile::create(&path, view_size(), 3).unwrap();
            let mut view = file.map_view(2).unwrap();
            view[0] = 0x5A;
            view.flush().unwrap();
        }

        let file = MappedFile::open_or_create(&path, view_size(), 1).unwrap();

        assert_eq!(file.view_count(), 3);
        assert_eq!(file.map_view(2).unwrap()[0], 0x5A);
    }

    #[test]
    fn open_or_create_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        std::fs::write(&path, b"").unwrap();

        let file = MappedFile::open_or_create(&path, view_size(), 2).unwrap();

        assert_eq!(file.view_count(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), file.file_size());
    }

    #[test]
    fn views_are_independent_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        let file = MappedFile::create(&path, view_size(), 2).unwrap();

        let mut v0 = file.map_view(0).unwrap();
        let mut v1 = file.map_view(1).unwrap();
        v0[0] = 1;
        v1[0] = 2;

        assert_eq!(v0.len(), view_size());
        assert_eq!(v0[0], 1);
        assert_eq!(v1[0], 2);
    }

    #[test]
    fn map_view_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        let file = MappedFile::create(&path, view_size(), 2).unwrap();

        assert!(file.map_view(1).is_ok());
        assert!(file.map_view(2).is_err());
    }

    #[test]
    fn grow_preserves_open_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        let mut file = MappedFile::create(&path, view_size(), 1).unwrap();

        let mut v0 = file.map_view(0).unwrap();
        v0[10] = 0xCA;

        file.grow(2).unwrap();

        assert_eq!(file.view_count(), 3);
        assert_eq!(v0[10], 0xCA);
        assert!(file.map_view(2).is_ok());
    }

    #[test]
    fn grow_by_zero_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.dat");
        let mut file = MappedFile::create(&path, view_size(), 2).unwrap();

        file.grow(0).unwrap();

        assert_eq!(file.view_count(), 2);
    }
}
