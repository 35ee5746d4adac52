//! # Arena Chain
//!
//! This module implements the free-list allocator that lives inside a single
//! view. A view is carved into a doubly-linked chain of arenas; each arena is
//! a 13-byte header followed by `capacity` payload bytes. Free and used arenas
//! share the same chain, so allocation, deallocation and defragmentation are
//! all chain surgery on mapped bytes.
//!
//! ## View Layout
//!
//! ```text
//! Offset 0          View header (12 bytes)
//! Offset 12         Arena 0: [hdr 13][payload capacity0]
//! 12+13+cap0        Arena 1: [hdr 13][payload capacity1]
//! ...
//! view_len          End of view (last arena ends exactly here)
//! ```
//!
//! Invariant: the total lengths of all arenas (`ARENA_HEADER_SIZE + capacity`)
//! sum to `view_len - VIEW_HEADER_SIZE`.
//!
//! ## Handles, Not References
//!
//! `Arena` is a plain `Copy` handle holding a view-relative offset. Swapping
//! and coalescing physically move arenas, so a handle is only meaningful
//! until the next structural change of its chain. Callers that keep
//! locations across such changes (the key index) must repoint them from the
//! relocations reported by the view.
//!
//! ## Write-Through Headers
//!
//! Every accessor resolves the header from the mapped bytes on each call and
//! every setter writes straight back into them. No header field is cached on
//! the Rust side. Capacity is additionally re-derived from the neighbor
//! offset before any split, so a stale capacity heals itself.
//!
//! ## Free Space Accounting
//!
//! The view header's `free_space` is the sum of payload capacities of all
//! free arenas:
//!
//! - `split` of a free arena into `size` + remainder: `-(size + header)`
//! - consuming a free arena whole: caller subtracts its capacity
//! - `coalesce_adjacent`: `+header` per merged arena
//! - tail split in `set_content`: `+(leftover - header)`
//!
//! ## Thread Safety
//!
//! `ArenaChain`/`ArenaChainMut` borrow view bytes and carry no locking. They
//! rely on the store-wide mutex held by the caller.

use eyre::{bail, ensure, Result};

use super::headers::{ArenaHeader, ArenaStatus, ViewHeader};
use crate::config::{
    required_space, ARENA_HEADER_SIZE, CONTENT_PREFIX_SIZE, FIRST_ARENA_OFFSET, MIN_VIEW_SIZE,
    SPLIT_THRESHOLD, VIEW_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arena {
    offset: u32,
}

impl Arena {
    pub fn at(offset: u32) -> Self {
        Self { offset }
    }

    pub fn first() -> Self {
        Self {
            offset: FIRST_ARENA_OFFSET as u32,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    fn start(&self) -> usize {
        self.offset as usize
    }

    fn content_start(&self) -> usize {
        self.offset as usize + ARENA_HEADER_SIZE
    }
}

/// Result of carving an allocation out of a free arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// The remainder was too small to stand alone; the whole arena is consumed.
    Whole(Arena),
    /// The arena was shrunk and the remainder became a new free arena.
    Divided { head: Arena, tail: Arena },
}

impl Split {
    pub fn head(&self) -> Arena {
        match self {
            Split::Whole(arena) => *arena,
            Split::Divided { head, .. } => *head,
        }
    }
}

/// Totals gathered by a full walk of the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainUsage {
    pub arena_count: u32,
    pub used_count: u32,
    pub free_space: u32,
    pub max_free_space: u32,
    pub repaired_links: u32,
}

fn validate_view_len(len: usize) -> Result<()> {
    ensure!(
        len >= MIN_VIEW_SIZE,
        "view of {} bytes is smaller than the minimum {}",
        len,
        MIN_VIEW_SIZE
    );
    ensure!(
        len <= u32::MAX as usize,
        "view of {} bytes exceeds the 32-bit offset range",
        len
    );
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaChain<'a> {
    data: &'a [u8],
}

pub struct ArenaChainMut<'a> {
    data: &'a mut [u8],
}

impl<'a> ArenaChain<'a> {
    pub fn from_view(data: &'a [u8]) -> Result<Self> {
        validate_view_len(data.len())?;
        ensure!(
            ViewHeader::from_bytes(data)?.is_valid(),
            "view is not formatted (signature mismatch)"
        );
        Ok(Self { data })
    }

    pub fn view_header(&self) -> &'a ViewHeader {
        // from_view validated the length.
        ViewHeader::from_bytes(self.data).expect("view length validated on construction")
    }

    pub fn view_len(&self) -> usize {
        self.data.len()
    }

    pub fn header(&self, arena: Arena) -> Result<&'a ArenaHeader> {
        let start = arena.start();
        ensure!(
            start >= FIRST_ARENA_OFFSET && start + ARENA_HEADER_SIZE <= self.data.len(),
            "arena offset {} out of bounds (view_len={})",
            start,
            self.data.len()
        );
        ArenaHeader::from_bytes(&self.data[start..])
    }

    pub fn is_free(&self, arena: Arena) -> Result<bool> {
        Ok(self.header(arena)?.is_free())
    }

    pub fn capacity(&self, arena: Arena) -> Result<u32> {
        Ok(self.header(arena)?.capacity())
    }

    pub fn has_next(&self, arena: Arena) -> Result<bool> {
        Ok(self.header(arena)?.has_next())
    }

    pub fn has_prev(&self, arena: Arena) -> Result<bool> {
        Ok(self.header(arena)?.has_prev())
    }

    pub fn next(&self, arena: Arena) -> Result<Option<Arena>> {
        let header = self.header(arena)?;
        Ok(header.has_next().then(|| Arena::at(header.next())))
    }

    pub fn prev(&self, arena: Arena) -> Result<Option<Arena>> {
        let header = self.header(arena)?;
        Ok(header.has_prev().then(|| Arena::at(header.prev())))
    }

    /// Capacity implied by the position of the next arena (or the view end).
    pub fn true_capacity(&self, arena: Arena) -> Result<u32> {
        let header = self.header(arena)?;
        let end = if header.has_next() {
            header.next() as usize
        } else {
            self.data.len()
        };
        ensure!(
            end >= arena.content_start(),
            "arena at {} links to next arena at {} which overlaps its header",
            arena.offset(),
            end
        );
        Ok((end - arena.content_start()) as u32)
    }

    pub fn total_len(&self, arena: Arena) -> Result<usize> {
        Ok(ARENA_HEADER_SIZE + self.capacity(arena)? as usize)
    }

    pub fn fits(&self, arena: Arena, payload_len: usize) -> Result<bool> {
        Ok(self.capacity(arena)? as usize >= required_space(payload_len))
    }

    pub fn content_len(&self, arena: Arena) -> Result<usize> {
        let header = self.header(arena)?;
        ensure!(
            !header.is_free(),
            "cannot read content of free arena at {}",
            arena.offset()
        );

        let start = arena.content_start();
        let capacity = header.capacity() as usize;
        ensure!(
            capacity >= CONTENT_PREFIX_SIZE && start + capacity <= self.data.len(),
            "arena at {} has invalid capacity {}",
            arena.offset(),
            capacity
        );

        let d = self.data;
        let len = u32::from_le_bytes([d[start], d[start + 1], d[start + 2], d[start + 3]]) as usize;
        ensure!(
            required_space(len) <= capacity,
            "content length {} exceeds arena capacity {} at offset {}",
            len,
            capacity,
            arena.offset()
        );
        Ok(len)
    }

    pub fn content(&self, arena: Arena) -> Result<&'a [u8]> {
        let len = self.content_len(arena)?;
        let start = arena.content_start() + CONTENT_PREFIX_SIZE;
        Ok(&self.data[start..start + len])
    }

    pub fn iter(&self) -> ArenaIter<'a> {
        ArenaIter {
            chain: *self,
            next: Some(Arena::first()),
            remaining: self.data.len() / ARENA_HEADER_SIZE + 1,
        }
    }

    pub fn used(&self) -> impl Iterator<Item = Result<Arena>> + 'a {
        let chain = *self;
        self.iter().filter_map(move |arena| match arena {
            Ok(arena) => match chain.is_free(arena) {
                Ok(true) => None,
                Ok(false) => Some(Ok(arena)),
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        })
    }

    /// Largest free payload capacity found by walking the chain.
    pub fn largest_free_run(&self) -> Result<u32> {
        let mut largest = 0;
        for arena in self.iter() {
            let header = self.header(arena?)?;
            if header.is_free() {
                largest = largest.max(header.capacity());
            }
        }
        Ok(largest)
    }

    /// Linear scan for the first free arena that can take `size` bytes.
    pub fn find_free(&self, size: usize) -> Result<Option<Arena>> {
        for arena in self.iter() {
            let arena = arena?;
            let header = self.header(arena)?;
            if header.is_free() && header.capacity() as usize >= size {
                return Ok(Some(arena));
            }
        }
        Ok(None)
    }
}

pub struct ArenaIter<'a> {
    chain: ArenaChain<'a>,
    next: Option<Arena>,
    remaining: usize,
}

impl Iterator for ArenaIter<'_> {
    type Item = Result<Arena>;

    fn next(&mut self) -> Option<Self::Item> {
        let arena = self.next.take()?;

        if self.remaining == 0 {
            return Some(Err(eyre::eyre!(
                "arena chain does not terminate (cycle through offset {})",
                arena.offset()
            )));
        }
        self.remaining -= 1;

        match self.chain.next(arena) {
            Ok(next) => {
                if let Some(n) = next {
                    if n.offset() <= arena.offset() {
                        return Some(Err(eyre::eyre!(
                            "arena at {} links backwards to {}",
                            arena.offset(),
                            n.offset()
                        )));
                    }
                }
                self.next = next;
                Some(Ok(arena))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<'a> ArenaChainMut<'a> {
    pub fn from_view(data: &'a mut [u8]) -> Result<Self> {
        ArenaChain::from_view(data)?;
        Ok(Self { data })
    }

    /// Stamps a fresh header and one free arena spanning the whole view.
    pub fn format(data: &'a mut [u8]) -> Result<Self> {
        validate_view_len(data.len())?;

        let capacity = (data.len() - VIEW_HEADER_SIZE - ARENA_HEADER_SIZE) as u32;
        ViewHeader::new(capacity).write_to(data)?;
        ArenaHeader::new(ArenaStatus::Free, capacity, 0, 0)
            .write_to(&mut data[FIRST_ARENA_OFFSET..])?;

        Ok(Self { data })
    }

    pub fn as_ref(&self) -> ArenaChain<'_> {
        ArenaChain { data: &*self.data }
    }

    pub fn view_header_mut(&mut self) -> &mut ViewHeader {
        ViewHeader::from_bytes_mut(self.data).expect("view length validated on construction")
    }

    pub fn header_mut(&mut self, arena: Arena) -> Result<&mut ArenaHeader> {
        let start = arena.start();
        ensure!(
            start >= FIRST_ARENA_OFFSET && start + ARENA_HEADER_SIZE <= self.data.len(),
            "arena offset {} out of bounds (view_len={})",
            start,
            self.data.len()
        );
        ArenaHeader::from_bytes_mut(&mut self.data[start..])
    }

    pub fn set_free(&mut self, arena: Arena, free: bool) -> Result<()> {
        let status = if free {
            ArenaStatus::Free
        } else {
            ArenaStatus::Used
        };
        self.header_mut(arena)?.set_status(status);
        Ok(())
    }

    pub fn set_capacity(&mut self, arena: Arena, capacity: u32) -> Result<()> {
        ensure!(
            arena.content_start() + capacity as usize <= self.data.len(),
            "capacity {} at offset {} overruns the view",
            capacity,
            arena.offset()
        );
        self.header_mut(arena)?.set_capacity(capacity);
        Ok(())
    }

    fn set_prev_of(&mut self, arena: Option<Arena>, prev: u32) -> Result<()> {
        if let Some(arena) = arena {
            self.header_mut(arena)?.set_prev(prev);
        }
        Ok(())
    }

    fn set_next_of(&mut self, arena: Option<Arena>, next: u32) -> Result<()> {
        if let Some(arena) = arena {
            self.header_mut(arena)?.set_next(next);
        }
        Ok(())
    }

    /// Carves `size` payload bytes out of the free `arena`.
    ///
    /// The stored capacity is first re-derived from the next arena's offset.
    /// When the remainder would be smaller than `SPLIT_THRESHOLD` the arena is
    /// returned untouched and the caller consumes it whole.
    pub fn split(&mut self, arena: Arena, size: usize) -> Result<Split> {
        ensure!(
            self.as_ref().is_free(arena)?,
            "cannot split used arena at {}",
            arena.offset()
        );

        let capacity = self.as_ref().true_capacity(arena)?;
        self.set_capacity(arena, capacity)?;
        let capacity = capacity as usize;

        ensure!(
            size <= capacity,
            "split of {} bytes exceeds arena capacity {} at offset {}",
            size,
            capacity,
            arena.offset()
        );

        let remainder = capacity - size;
        if remainder < SPLIT_THRESHOLD {
            return Ok(Split::Whole(arena));
        }

        let old_next = self.as_ref().next(arena)?;
        let tail = Arena::at((arena.content_start() + size) as u32);
        let tail_capacity = (remainder - ARENA_HEADER_SIZE) as u32;

        ArenaHeader::new(
            ArenaStatus::Free,
            tail_capacity,
            old_next.map_or(0, |n| n.offset()),
            arena.offset(),
        )
        .write_to(&mut self.data[tail.start()..])?;
        self.set_prev_of(old_next, tail.offset())?;

        let header = self.header_mut(arena)?;
        header.set_capacity(size as u32);
        header.set_next(tail.offset());

        self.view_header_mut()
            .sub_free_space((size + ARENA_HEADER_SIZE) as u32);

        Ok(Split::Divided { head: arena, tail })
    }

    /// Merges `arena` with every free neighbor on both sides.
    ///
    /// Returns the surviving arena and the number of arenas absorbed. Each
    /// absorbed header becomes payload, so `free_space` grows by one header
    /// size per merge.
    pub fn coalesce_adjacent(&mut self, arena: Arena) -> Result<(Arena, u32)> {
        ensure!(
            self.as_ref().is_free(arena)?,
            "cannot coalesce used arena at {}",
            arena.offset()
        );

        let mut merged = 0u32;
        let mut current = arena;

        while let Some(next) = self.as_ref().next(current)? {
            if !self.as_ref().is_free(next)? {
                break;
            }
            self.absorb_next(current, next)?;
            merged += 1;
        }

        while let Some(prev) = self.as_ref().prev(current)? {
            if !self.as_ref().is_free(prev)? {
                break;
            }
            self.absorb_next(prev, current)?;
            current = prev;
            merged += 1;
        }

        if merged > 0 {
            self.view_header_mut()
                .add_free_space(merged * ARENA_HEADER_SIZE as u32);
        }

        let capacity = self.as_ref().capacity(current)?;
        let header = self.view_header_mut();
        if capacity > header.max_free_space() {
            header.set_max_free_space(capacity);
        }

        Ok((current, merged))
    }

    fn absorb_next(&mut self, arena: Arena, next: Arena) -> Result<()> {
        let next_total = self.as_ref().total_len(next)? as u32;
        let after = self.as_ref().next(next)?;

        let header = self.header_mut(arena)?;
        header.set_capacity(header.capacity() + next_total);
        header.set_next(after.map_or(0, |a| a.offset()));
        self.set_prev_of(after, arena.offset())
    }

    /// Physically exchanges two chain-adjacent arenas.
    ///
    /// `first` must directly precede `second`. After the swap the arena that
    /// was `second` starts at `first`'s old offset and the one that was
    /// `first` follows it. Returns the new handles as `(moved_second, moved_first)`.
    pub fn swap_adjacent(&mut self, first: Arena, second: Arena) -> Result<(Arena, Arena)> {
        let chain = self.as_ref();
        ensure!(
            chain.next(first)? == Some(second) && chain.prev(second)? == Some(first),
            "arenas at {} and {} are not adjacent",
            first.offset(),
            second.offset()
        );

        let first_len = chain.total_len(first)?;
        let second_len = chain.total_len(second)?;
        ensure!(
            first.start() + first_len == second.start(),
            "arena at {} does not end where {} begins",
            first.offset(),
            second.offset()
        );

        let before = chain.prev(first)?;
        let after = chain.next(second)?;

        let start = first.start();
        let end = start + first_len + second_len;
        ensure!(
            end <= self.data.len(),
            "swap range {}..{} overruns the view",
            start,
            end
        );
        self.data[start..end].rotate_left(first_len);

        let moved_second = first;
        let moved_first = Arena::at((start + second_len) as u32);

        let header = self.header_mut(moved_second)?;
        header.set_prev(before.map_or(0, |b| b.offset()));
        header.set_next(moved_first.offset());

        let header = self.header_mut(moved_first)?;
        header.set_prev(moved_second.offset());
        header.set_next(after.map_or(0, |a| a.offset()));

        self.set_next_of(before, moved_second.offset())?;
        self.set_prev_of(after, moved_first.offset())?;

        Ok((moved_second, moved_first))
    }

    /// Writes a length-prefixed payload into a used arena.
    ///
    /// Leftover capacity above `SPLIT_THRESHOLD` is returned to the chain as
    /// a new free arena (coalesced with a free successor). Returns that free
    /// arena, if one was produced.
    pub fn set_content(&mut self, arena: Arena, payload: &[u8]) -> Result<Option<Arena>> {
        let header = self.as_ref().header(arena)?;
        ensure!(
            !header.is_free(),
            "cannot write content into free arena at {}",
            arena.offset()
        );

        let capacity = header.capacity() as usize;
        let needed = required_space(payload.len());
        if capacity < needed {
            bail!(
                "payload of {} bytes needs {} but arena at {} holds {}",
                payload.len(),
                needed,
                arena.offset(),
                capacity
            );
        }

        let start = arena.content_start();
        self.data[start..start + CONTENT_PREFIX_SIZE]
            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data[start + CONTENT_PREFIX_SIZE..start + needed].copy_from_slice(payload);

        let leftover = capacity - needed;
        if leftover <= SPLIT_THRESHOLD {
            return Ok(None);
        }

        let old_next = self.as_ref().next(arena)?;
        let tail = Arena::at((start + needed) as u32);
        let tail_capacity = (leftover - ARENA_HEADER_SIZE) as u32;

        ArenaHeader::new(
            ArenaStatus::Free,
            tail_capacity,
            old_next.map_or(0, |n| n.offset()),
            arena.offset(),
        )
        .write_to(&mut self.data[tail.start()..])?;
        self.set_prev_of(old_next, tail.offset())?;

        let header = self.header_mut(arena)?;
        header.set_capacity(needed as u32);
        header.set_next(tail.offset());

        self.view_header_mut().add_free_space(tail_capacity);

        let (tail, _) = self.coalesce_adjacent(tail)?;
        Ok(Some(tail))
    }

    /// Walks the whole chain, repairing links and recomputing the counters.
    ///
    /// Links pointing at their own arena (or backwards, or past the view) are
    /// replaced by the physical successor; every capacity is re-derived from
    /// its successor's offset; `prev` links are rewritten to match. The view
    /// header counters are overwritten with the recomputed totals.
    pub fn calculate_usage(&mut self) -> Result<ChainUsage> {
        let len = self.data.len();
        let mut usage = ChainUsage::default();
        let mut free_accumulator: u64 = 0;
        let mut prev = 0u32;
        let mut current = Arena::first();

        loop {
            usage.arena_count += 1;
            ensure!(
                usage.arena_count as usize <= len / ARENA_HEADER_SIZE,
                "arena chain does not terminate"
            );

            let header = self.as_ref().header(current)?;
            let stored_next = header.next() as usize;
            let stored_capacity = header.capacity() as usize;
            let stored_prev = header.prev();

            let mut next = stored_next;
            let link_broken = next != 0
                && (next <= current.start() || next + ARENA_HEADER_SIZE > len
                    || next < current.content_start());
            if link_broken {
                let physical = current.content_start() + stored_capacity;
                next = if physical > current.start() && physical + ARENA_HEADER_SIZE <= len {
                    physical
                } else {
                    0
                };
                usage.repaired_links += 1;
            }

            let end = if next == 0 { len } else { next };
            let capacity = (end - current.content_start()) as u32;

            let header = self.header_mut(current)?;
            if stored_prev != prev {
                header.set_prev(prev);
                usage.repaired_links += 1;
            }
            header.set_next(next as u32);
            header.set_capacity(capacity);

            if header.is_free() {
                free_accumulator += capacity as u64;
                usage.max_free_space = usage.max_free_space.max(capacity);
            } else {
                usage.used_count += 1;
            }

            if next == 0 {
                break;
            }
            prev = current.offset();
            current = Arena::at(next as u32);
        }

        usage.free_space = free_accumulator.min(u32::MAX as u64) as u32;

        let header = self.view_header_mut();
        header.set_free_space(usage.free_space);
        header.set_max_free_space(usage.max_free_space);

        Ok(usage)
    }
}
