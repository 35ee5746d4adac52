//! # Storage Engine
//!
//! `StorageEngine` maps opaque keys to opaque values stored in the arena heap.
//! It owns the view manager and the key index; nothing else holds arena
//! locations.
//!
//! ## Key Index
//!
//! ```text
//! index: HashMap<Vec<u8>, Locator>
//!                          │
//!                          └─> (view_id, arena offset)
//! ```
//!
//! A locator is a handle, not a reference. Defragmentation moves live arenas,
//! so after every operation that may defragment a view the engine drains the
//! view's relocations and repoints the affected entries. The moved envelope
//! carries its own key, so no reverse map is kept.
//!
//! ## Placement
//!
//! ```text
//! place(envelope)
//!   1. larger than any view could hold     -> NotEnoughSpace (no growth)
//!   2. get_matching_view(need)             -> allocate + write
//!   3. extend_views_bucket(extend_views)   -> retry once on the new views
//!   4. growth refused (StorageFull)        -> NotEnoughSpace
//! ```
//!
//! ## Insert
//!
//! An existing key is first rewritten in place when its arena is large
//! enough. Otherwise the old arena is freed before the new envelope is
//! placed, so the freed space is available to the new allocation. If that
//! placement fails the key is gone.
//!
//! ## Restore
//!
//! On reopen the index comes from the state file when it is present, every
//! entry resolves and no used arena is left unindexed. Otherwise it is
//! rebuilt by scanning the used arenas of every view.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::envelope::{self, Envelope};
use super::persistence::LoadedIndex;
use super::StoreResult;
use crate::config::{required_space, ARENA_HEADER_SIZE, VIEW_HEADER_SIZE};
use crate::storage::{Arena, Relocation, StorageFull, ViewManager, ViewStats};

/// Location of a stored item: view id and arena offset inside that view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub view_id: u32,
    pub offset: u32,
}

impl Locator {
    fn new(view_id: u32, arena: Arena) -> Self {
        Self {
            view_id,
            offset: arena.offset(),
        }
    }

    fn arena(&self) -> Arena {
        Arena::at(self.offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub items: usize,
    pub stored_bytes: u64,
    pub views: u32,
    pub open_views: usize,
    pub file_size: u64,
    pub free_space: u64,
    pub max_free_space: u32,
    pub per_view: Vec<ViewStats>,
}

#[derive(Debug)]
pub struct StorageEngine {
    views: ViewManager,
    index: HashMap<Vec<u8>, Locator>,
    stored_bytes: u64,
    extend_views: u32,
}

impl StorageEngine {
    pub fn new(views: ViewManager, extend_views: u32) -> Self {
        Self {
            views,
            index: HashMap::new(),
            stored_bytes: 0,
            extend_views: extend_views.max(1),
        }
    }

    pub fn views(&self) -> &ViewManager {
        &self.views
    }

    /// Largest envelope a single view can ever hold.
    pub fn max_item_size(&self) -> usize {
        self.views
            .view_size()
            .saturating_sub(VIEW_HEADER_SIZE + ARENA_HEADER_SIZE)
            .saturating_sub(required_space(0))
    }

    /// Whether a key/value pair of these sizes could ever be stored.
    pub fn check_size(&self, key_len: usize, value_len: usize) -> bool {
        envelope::encoded_len(key_len, value_len) <= self.max_item_size()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<StoreResult> {
        check_contract(key, value)?;

        if self.index.contains_key(key) {
            return Ok(StoreResult::KeyExists);
        }

        let envelope = envelope::encode(key, value)?;
        self.place_new(key, &envelope)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<StoreResult> {
        check_contract(key, value)?;

        let Some(&locator) = self.index.get(key) else {
            let envelope = envelope::encode(key, value)?;
            return self.place_new(key, &envelope);
        };

        let envelope = envelope::encode(key, value)?;
        let view = self.views.view_mut(locator.view_id)?;
        let arena = locator.arena();
        let old_len = view.content_len(arena)? as u64;

        if view.fits(arena, envelope.len())? {
            view.write(arena, &envelope)?;
            self.stored_bytes = self.stored_bytes.saturating_sub(old_len) + envelope.len() as u64;
            return Ok(StoreResult::Success);
        }

        view.deallocate(arena)?;
        self.index.remove(key);
        self.stored_bytes = self.stored_bytes.saturating_sub(old_len);
        debug!(
            view = locator.view_id,
            offset = locator.offset,
            "item outgrew its arena, reallocating"
        );

        self.place_new(key, &envelope)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(&locator) = self.index.get(key) else {
            return Ok(None);
        };

        let view = self.views.view_mut(locator.view_id)?;
        let envelope = Envelope::decode(view.read(locator.arena())?)?;
        Ok(Some(envelope.value().to_vec()))
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(&locator) = self.index.get(key) else {
            return Ok(None);
        };

        let view = self.views.view_mut(locator.view_id)?;
        let arena = locator.arena();
        let bytes = view.read(arena)?;
        let stored = bytes.len() as u64;
        let value = Envelope::decode(bytes)?.value().to_vec();
        view.deallocate(arena)?;

        self.index.remove(key);
        self.stored_bytes = self.stored_bytes.saturating_sub(stored);
        Ok(Some(value))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Stored size of `key`'s envelope, read from the arena's length prefix.
    pub fn item_size(&mut self, key: &[u8]) -> Result<Option<usize>> {
        let Some(&locator) = self.index.get(key) else {
            return Ok(None);
        };
        let view = self.views.view_mut(locator.view_id)?;
        Ok(Some(view.content_len(locator.arena())?))
    }

    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes
    }

    pub fn file_size(&self) -> u64 {
        self.views.file().file_size()
    }

    pub fn locators(&self) -> impl ExactSizeIterator<Item = (&[u8], Locator)> + '_ {
        self.index.iter().map(|(k, &l)| (k.as_slice(), l))
    }

    /// Lazy walk over every stored `(key, value)`, view by view.
    pub fn iter(&mut self) -> Entries<'_> {
        Entries {
            views: &mut self.views,
            view_id: 0,
            pending: SmallVec::new(),
            done: false,
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.views.clear_all_views()?;
        self.index.clear();
        self.stored_bytes = 0;
        info!("cleared store");
        Ok(())
    }

    /// Defragments every view and repoints moved items.
    pub fn defragment_all(&mut self) -> Result<()> {
        for id in 0..self.views.view_count() {
            let view = self.views.view_mut(id)?;
            view.defragment()?;
            let relocations = view.take_relocations();
            self.apply_relocations(id, relocations)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.views.flush()
    }

    pub fn stats(&self) -> StoreStats {
        let per_view = self.views.stats();
        StoreStats {
            items: self.index.len(),
            stored_bytes: self.stored_bytes,
            views: self.views.view_count(),
            open_views: self.views.open_view_count(),
            file_size: self.file_size(),
            free_space: per_view.iter().map(|v| v.free_space as u64).sum(),
            max_free_space: per_view.iter().map(|v| v.max_free_space).max().unwrap_or(0),
            per_view,
        }
    }

    fn place_new(&mut self, key: &[u8], envelope: &[u8]) -> Result<StoreResult> {
        match self.place(envelope)? {
            Some(locator) => {
                self.index.insert(key.to_vec(), locator);
                self.stored_bytes += envelope.len() as u64;
                Ok(StoreResult::Success)
            }
            None => Ok(StoreResult::NotEnoughSpace),
        }
    }

    fn place(&mut self, envelope: &[u8]) -> Result<Option<Locator>> {
        if envelope.len() > self.max_item_size() {
            debug!(
                len = envelope.len(),
                max = self.max_item_size(),
                "item larger than any view"
            );
            return Ok(None);
        }

        let need = required_space(envelope.len());

        if let Some(locator) = self.place_in_matching_view(need, envelope)? {
            return Ok(Some(locator));
        }

        if let Err(e) = self.views.extend_views_bucket(self.extend_views) {
            if let Some(full) = e.downcast_ref::<StorageFull>() {
                debug!(
                    requested = full.requested,
                    available = full.available,
                    "cannot grow backing file"
                );
                return Ok(None);
            }
            return Err(e);
        }

        self.place_in_matching_view(need, envelope)
    }

    fn place_in_matching_view(&mut self, need: usize, envelope: &[u8]) -> Result<Option<Locator>> {
        let Some(id) = self.views.get_matching_view(need)? else {
            return Ok(None);
        };

        let view = self.views.view_mut(id)?;
        let arena = view.allocate(need)?;
        let relocations = view.take_relocations();
        if let Some(arena) = arena {
            view.write(arena, envelope)?;
        }
        self.apply_relocations(id, relocations)?;

        Ok(arena.map(|arena| Locator::new(id, arena)))
    }

    fn apply_relocations(
        &mut self,
        view_id: u32,
        relocations: SmallVec<[Relocation; 8]>,
    ) -> Result<()> {
        if relocations.is_empty() {
            return Ok(());
        }

        let view = self
            .views
            .open_view_ref(view_id)
            .ok_or_else(|| eyre::eyre!("view {} closed before relocations were applied", view_id))?;
        let chain = view.chain()?;

        for relocation in &relocations {
            let bytes = chain.content(relocation.to)?;
            let key = Envelope::decode(bytes)?.key();
            let from = Locator::new(view_id, relocation.from);

            match self.index.get_mut(key) {
                Some(locator) if *locator == from => {
                    *locator = Locator::new(view_id, relocation.to);
                }
                _ => warn!(
                    view = view_id,
                    from = relocation.from.offset(),
                    to = relocation.to.offset(),
                    "moved arena has no matching index entry"
                ),
            }
        }

        debug!(view = view_id, moved = relocations.len(), "repointed moved items");
        Ok(())
    }

    /// Installs index entries loaded from a state file.
    ///
    /// Returns the number of entries dropped because they did not resolve to
    /// a used arena holding the same key.
    pub fn load_index(&mut self, loaded: LoadedIndex) -> Result<usize> {
        self.index.clear();
        self.stored_bytes = 0;
        let mut discarded = loaded.skipped;

        for (key, locator) in loaded.entries {
            if self.index.contains_key(&key) {
                discarded += 1;
                continue;
            }
            match self.resolve(&key, locator) {
                Ok(Some(len)) => {
                    self.index.insert(key, locator);
                    self.stored_bytes += len as u64;
                }
                Ok(None) => discarded += 1,
                Err(e) => {
                    debug!(view = locator.view_id, offset = locator.offset, error = %e, "index entry does not resolve");
                    discarded += 1;
                }
            }
        }

        if discarded > 0 {
            warn!(discarded, kept = self.index.len(), "discarded stale index entries");
        }
        Ok(discarded)
    }

    fn resolve(&mut self, key: &[u8], locator: Locator) -> Result<Option<usize>> {
        if locator.view_id >= self.views.view_count() {
            return Ok(None);
        }
        let view = self.views.view_mut(locator.view_id)?;
        let chain = view.chain()?;
        let arena = locator.arena();
        if chain.is_free(arena)? {
            return Ok(None);
        }
        let bytes = chain.content(arena)?;
        Ok((Envelope::decode(bytes)?.key() == key).then_some(bytes.len()))
    }

    /// Rebuilds the index by scanning every used arena of every view.
    pub fn rebuild_index(&mut self) -> Result<usize> {
        let mut index = HashMap::new();
        let mut stored_bytes = 0u64;
        let mut duplicates = 0usize;

        for id in 0..self.views.view_count() {
            let view = self.views.view_mut(id)?;
            let chain = view.chain()?;
            for arena in chain.used() {
                let arena = arena?;
                let bytes = chain.content(arena)?;
                let key = Envelope::decode(bytes)?.key();
                if index.contains_key(key) {
                    duplicates += 1;
                    continue;
                }
                index.insert(key.to_vec(), Locator::new(id, arena));
                stored_bytes += bytes.len() as u64;
            }
        }

        if duplicates > 0 {
            warn!(duplicates, "duplicate keys found while rebuilding index");
        }

        self.index = index;
        self.stored_bytes = stored_bytes;
        info!(items = self.index.len(), "rebuilt index from views");
        Ok(self.index.len())
    }

    fn used_arena_count(&mut self) -> Result<usize> {
        let mut used = 0;
        for id in 0..self.views.view_count() {
            used += self.views.view_mut(id)?.used_arenas()?.len();
        }
        Ok(used)
    }

    /// Restores the index from a state file, falling back to a scan of the views.
    pub fn restore(&mut self, loaded: Result<Option<LoadedIndex>>) -> Result<()> {
        match loaded {
            Ok(Some(loaded)) => {
                let discarded = self.load_index(loaded)?;
                let used = self.used_arena_count();
                match used {
                    Ok(used) if discarded == 0 && used == self.index.len() => {
                        info!(items = self.index.len(), "restored index from state file");
                        return Ok(());
                    }
                    Ok(used) => warn!(
                        indexed = self.index.len(),
                        used,
                        discarded,
                        "state file is stale, scanning views"
                    ),
                    Err(e) => warn!(error = %e, "failed to count used arenas, scanning views"),
                }
            }
            Ok(None) => debug!("no state file, scanning views"),
            Err(e) => warn!(error = %e, "failed to load state file, scanning views"),
        }

        if let Err(e) = self.rebuild_index() {
            warn!(error = %e, "index rebuild failed, starting empty");
            self.clear()?;
        }
        Ok(())
    }
}

fn check_contract(key: &[u8], value: &[u8]) -> Result<()> {
    ensure!(!key.is_empty(), "key must not be empty");
    ensure!(!value.is_empty(), "value must not be empty");
    Ok(())
}

/// Lazy enumeration of stored items. Created by [`StorageEngine::iter`].
///
/// Used arenas of a view are collected when the walk enters that view, so
/// views are opened one at a time under the open-view limit.
pub struct Entries<'e> {
    views: &'e mut ViewManager,
    view_id: u32,
    pending: SmallVec<[Arena; 16]>,
    done: bool,
}

impl Entries<'_> {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if self.pending.is_empty() {
                if self.view_id >= self.views.view_count() {
                    return Ok(None);
                }
                let view = self.views.view_mut(self.view_id)?;
                let mut used = view.used_arenas()?;
                used.reverse();
                self.pending = SmallVec::from_vec(used);
                self.view_id += 1;
                continue;
            }

            let Some(arena) = self.pending.pop() else {
                continue;
            };
            let view = self.views.view_mut(self.view_id - 1)?;
            let bytes = view.chain()?.content(arena)?;
            return Ok(Some(Envelope::decode(bytes)?.into_owned()));
        }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for Entries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entries")
            .field("view_id", &self.view_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}
