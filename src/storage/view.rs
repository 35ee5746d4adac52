//! # Views
//!
//! A `View` is one fixed-size window of the backing file. While open it holds
//! its own `MmapMut` over `[id * size, (id + 1) * size)` and exposes the arena
//! chain inside it; while closed it is only a descriptor (id, size).
//!
//! ## Open and Format
//!
//! Opening maps the window and checks the view header signature. A window
//! with any other signature (fresh zeroed space, a torn format, a file from
//! an older layout) is formatted in place: one free arena spanning the whole
//! usable region. Invalid headers are therefore never an error.
//!
//! ## Allocation Path
//!
//! ```text
//! allocate(size)
//!   1. size > free_space            -> None (fail fast)
//!   2. last-free hint, revalidated  -> use it
//!   3. linear scan of the chain     -> first fit
//!   4. recount + defragment         -> retry linear scan
//!   5. still nothing                -> None (caller picks another view)
//! ```
//!
//! The hint is only ever a candidate: it is checked for `is_free` and
//! sufficient capacity on every use, because coalescing and swapping move
//! arenas underneath it.
//!
//! ## Relocations
//!
//! Defragmentation moves live arenas. Every move is recorded as a
//! `Relocation` and kept until the owner drains them with
//! `take_relocations`, so the key index can be repointed.
//!
//! ## Usage Counter
//!
//! Every allocate/deallocate/read/write bumps `usage`. The view manager closes
//! the open view with the lowest counter when it needs a free slot. Closing
//! resets the counter.

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::arena::{Arena, ArenaChain, ArenaChainMut, ChainUsage, Split};
use super::mmap::MappedFile;

/// A live arena that defragmentation moved to a new offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: Arena,
    pub to: Arena,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewStats {
    pub id: u32,
    pub open: bool,
    pub usage: u64,
    pub free_space: u32,
    pub max_free_space: u32,
}

#[derive(Debug)]
pub struct View {
    id: u32,
    size: usize,
    mapping: Option<MmapMut>,
    usage: u64,
    last_free: Option<Arena>,
    max_free_stale: bool,
    relocations: SmallVec<[Relocation; 8]>,
}

impl View {
    pub fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            size,
            mapping: None,
            usage: 0,
            last_free: None,
            max_free_stale: false,
            relocations: SmallVec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    fn touch(&mut self) {
        self.usage = self.usage.saturating_add(1);
    }

    /// Maps this view's window of `file`. Returns `true` if it was formatted.
    pub fn open(&mut self, file: &MappedFile) -> Result<bool> {
        if self.is_open() {
            return Ok(false);
        }
        let mapping = file.map_view(self.id)?;
        self.attach(mapping)
    }

    /// Adopts an already mapped window, formatting it if the signature is invalid.
    pub fn attach(&mut self, mapping: MmapMut) -> Result<bool> {
        ensure!(
            mapping.len() == self.size,
            "mapping of {} bytes does not match view size {}",
            mapping.len(),
            self.size
        );

        self.mapping = Some(mapping);
        self.last_free = None;
        self.max_free_stale = false;

        let valid = self
            .mapping
            .as_deref()
            .map(ArenaChain::from_view)
            .is_some_and(|chain| chain.is_ok());

        if valid {
            debug!(view = self.id, "opened view");
            Ok(false)
        } else {
            debug!(view = self.id, "view signature invalid, formatting");
            self.format()?;
            Ok(true)
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mapping) = self.mapping.take() {
            mapping
                .flush_async()
                .wrap_err_with(|| format!("failed to flush view {} on close", self.id))?;
            debug!(view = self.id, usage = self.usage, "closed view");
        }
        self.usage = 0;
        self.last_free = None;
        self.relocations.clear();
        Ok(())
    }

    pub fn format(&mut self) -> Result<()> {
        let mapping = self.mapping_mut()?;
        ArenaChainMut::format(mapping)?;
        self.last_free = Some(Arena::first());
        self.max_free_stale = false;
        Ok(())
    }

    fn mapping_mut(&mut self) -> Result<&mut [u8]> {
        let id = self.id;
        self.mapping
            .as_deref_mut()
            .ok_or_else(|| eyre::eyre!("view {} is not open", id))
    }

    pub fn chain(&self) -> Result<ArenaChain<'_>> {
        let mapping = self
            .mapping
            .as_deref()
            .ok_or_else(|| eyre::eyre!("view {} is not open", self.id))?;
        ArenaChain::from_view(mapping)
    }

    pub fn chain_mut(&mut self) -> Result<ArenaChainMut<'_>> {
        ArenaChainMut::from_view(self.mapping_mut()?)
    }

    pub fn free_space(&self) -> Result<u32> {
        Ok(self.chain()?.view_header().free_space())
    }

    pub fn max_free_space(&mut self) -> Result<u32> {
        if self.max_free_stale {
            self.calculate_area_memory_usage()?;
        }
        Ok(self.chain()?.view_header().max_free_space())
    }

    /// Allocates an arena able to hold `size` bytes of content block.
    pub fn allocate(&mut self, size: usize) -> Result<Option<Arena>> {
        if size as u64 > self.free_space()? as u64 {
            return Ok(None);
        }

        let mut found = self.hinted_arena(size)?;
        if found.is_none() {
            // A broken link stops the scan; the recount below repairs it.
            found = match self.chain()?.find_free(size) {
                Ok(found) => found,
                Err(e) => {
                    warn!(view = self.id, error = %e, "arena chain damaged, recounting");
                    None
                }
            };
        }
        if found.is_none() {
            debug!(view = self.id, size, "no free arena fits, defragmenting");
            self.calculate_area_memory_usage()?;
            self.defragment()?;
            found = self.chain()?.find_free(size)?;
        }
        let Some(arena) = found else {
            return Ok(None);
        };

        let mut chain = self.chain_mut()?;
        let original_capacity = chain.as_ref().capacity(arena)?;
        let max_free = chain.as_ref().view_header().max_free_space();

        let split = chain.split(arena, size)?;
        let arena = split.head();
        if let Split::Whole(_) = split {
            chain.view_header_mut().sub_free_space(original_capacity);
        }
        chain.set_free(arena, false)?;

        self.last_free = match split {
            Split::Divided { tail, .. } => Some(tail),
            Split::Whole(_) => None,
        };
        if original_capacity >= max_free {
            self.max_free_stale = true;
        }
        self.touch();

        trace!(view = self.id, offset = arena.offset(), size, "allocated arena");
        Ok(Some(arena))
    }

    fn hinted_arena(&self, size: usize) -> Result<Option<Arena>> {
        let Some(hint) = self.last_free else {
            return Ok(None);
        };
        let chain = self.chain()?;
        let usable = chain
            .header(hint)
            .map(|h| h.is_free() && h.capacity() as usize >= size)
            .unwrap_or(false);
        Ok(usable.then_some(hint))
    }

    pub fn deallocate(&mut self, arena: Arena) -> Result<Arena> {
        let mut chain = self.chain_mut()?;
        ensure!(
            !chain.as_ref().is_free(arena)?,
            "arena at {} is already free",
            arena.offset()
        );

        let capacity = chain.as_ref().capacity(arena)?;
        chain.set_free(arena, true)?;
        chain.view_header_mut().add_free_space(capacity);
        let (merged, _) = chain.coalesce_adjacent(arena)?;

        self.last_free = Some(merged);
        self.touch();

        trace!(view = self.id, offset = arena.offset(), "deallocated arena");
        Ok(merged)
    }

    pub fn read(&mut self, arena: Arena) -> Result<&[u8]> {
        self.touch();
        self.chain()?.content(arena)
    }

    pub fn write(&mut self, arena: Arena, payload: &[u8]) -> Result<()> {
        let tail = self.chain_mut()?.set_content(arena, payload)?;
        if tail.is_some() {
            self.last_free = tail;
        }
        self.touch();
        Ok(())
    }

    pub fn fits(&self, arena: Arena, payload_len: usize) -> Result<bool> {
        self.chain()?.fits(arena, payload_len)
    }

    pub fn content_len(&self, arena: Arena) -> Result<usize> {
        self.chain()?.content_len(arena)
    }

    /// Compacts the chain so all free space ends up in one trailing arena.
    ///
    /// Single forward pass: consecutive free arenas are merged, and a free
    /// arena followed by a used one is swapped with it so the free space keeps
    /// moving towards the end. Every used arena moves at most once.
    pub fn defragment(&mut self) -> Result<ChainUsage> {
        let id = self.id;
        let mut moved = 0usize;
        let mut relocations: SmallVec<[Relocation; 8]> = SmallVec::new();

        let mut chain = self.chain_mut()?;
        chain.calculate_usage()?;
        let mut current = Arena::first();

        while let Some(next) = chain.as_ref().next(current)? {
            ensure!(
                next.offset() > current.offset(),
                "arena at {} links backwards to {}",
                current.offset(),
                next.offset()
            );

            if !chain.as_ref().is_free(current)? {
                current = next;
                continue;
            }

            if chain.as_ref().is_free(next)? {
                let (merged, _) = chain.coalesce_adjacent(current)?;
                current = merged;
            } else {
                let (moved_used, moved_free) = chain.swap_adjacent(current, next)?;
                relocations.push(Relocation {
                    from: next,
                    to: moved_used,
                });
                moved += 1;
                current = moved_free;
            }
        }

        let usage = chain.calculate_usage()?;
        let tail_is_free = chain.as_ref().is_free(current)?;

        self.last_free = tail_is_free.then_some(current);
        self.max_free_stale = false;
        self.relocations.extend(relocations);

        debug!(
            view = id,
            moved,
            free_space = usage.free_space,
            max_free_space = usage.max_free_space,
            "defragmented view"
        );
        Ok(usage)
    }

    /// Full recount of the view header counters, repairing stale links.
    pub fn calculate_area_memory_usage(&mut self) -> Result<ChainUsage> {
        let usage = self.chain_mut()?.calculate_usage()?;
        if usage.repaired_links > 0 {
            debug!(
                view = self.id,
                repaired = usage.repaired_links,
                "repaired arena links"
            );
        }
        self.max_free_stale = false;
        if let Some(hint) = self.last_free {
            let still_free = self
                .chain()?
                .header(hint)
                .map(|h| h.is_free())
                .unwrap_or(false);
            if !still_free {
                self.last_free = None;
            }
        }
        Ok(usage)
    }

    pub fn take_relocations(&mut self) -> SmallVec<[Relocation; 8]> {
        std::mem::take(&mut self.relocations)
    }

    pub fn used_arenas(&self) -> Result<Vec<Arena>> {
        self.chain()?.used().collect()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(mapping) = &self.mapping {
            mapping
                .flush()
                .wrap_err_with(|| format!("failed to flush view {}", self.id))?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ViewStats {
        let (free_space, max_free_space) = self
            .chain()
            .map(|c| {
                let header = c.view_header();
                (header.free_space(), header.max_free_space())
            })
            .unwrap_or((0, 0));

        ViewStats {
            id: self.id,
            open: self.is_open(),
            usage: self.usage,
            free_space,
            max_free_space,
        }
    }
}
