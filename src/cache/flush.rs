// Flush, eviction, and shutdown machinery for the metadata cache.
//
// Writes drain ring by ring: every dirty entry of ring r reaches the
// dispatcher before any entry of ring r+1 is written. Within a ring,
// dependency parents go first, flush-me-last entries go last, and
// flush-me-collectively entries leave as one coalesced vector write.

use crate::cache::class::{ClassFlags, ClassId, NotifyEvent, PreSerializeAction};
use crate::cache::engine::MetadataCache;
use crate::cache::entry::EntryFlags;
use crate::cache::index::LruItem;
use crate::common::{Addr, Ring, Tag};
use crate::error::{ErrorKind, Result, ResultExt};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Bounded retries for a pre-serialize that keeps changing its mind.
const MAX_PRE_SERIALIZE_PASSES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write every dirty entry.
    Normal,
    /// Write every dirty entry, then evict everything evictable.
    Invalidate,
    /// Write only flush-marked entries (sync-point candidates).
    MarkedOnly,
    /// Mark entries clean without writing (follower ranks).
    ClearOnly,
}

impl MetadataCache {
    // ------------------------------------------------------------------
    // Public flush verbs
    // ------------------------------------------------------------------

    pub fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if self.flush_in_progress {
            return Err(ErrorKind::InvalidState("flush already in progress".into()).into());
        }
        self.flush_in_progress = true;
        let result = self.flush_inner(mode);
        self.flush_in_progress = false;
        result
    }

    fn flush_inner(&mut self, mode: FlushMode) -> Result<()> {
        debug!(?mode, dirty = self.index.dirty_count(), "flush start");
        for ring in Ring::ALL {
            self.flush_ring(ring, mode).ctx("flushing ring")?;
        }
        if mode == FlushMode::Invalidate {
            self.destroy_all().ctx("flush-to-destroy eviction")?;
        }
        self.io.flush().ctx("driver flush")?;
        Ok(())
    }

    /// Flush the container and release every entry. Ring settlement runs
    /// outermost (user) first; the superblock ring settles last.
    pub fn close(&mut self) -> Result<()> {
        self.closing = true;
        if crate::common::addr_defined(self.config.image_addr) {
            self.store_image().ctx("writing cache image")?;
        }
        self.flush_in_progress = true;
        let result = (|| -> Result<()> {
            for ring in Ring::ALL {
                self.flush_ring(ring, FlushMode::Normal)
                    .ctx("flushing ring at close")?;
                self.settle_ring(ring);
            }
            self.destroy_all().ctx("evicting at close")?;
            self.io.flush().ctx("driver flush at close")?;
            Ok(())
        })();
        self.flush_in_progress = false;
        result
    }

    // ------------------------------------------------------------------
    // Ring-level flushing
    // ------------------------------------------------------------------

    pub(crate) fn flush_ring(&mut self, ring: Ring, mode: FlushMode) -> Result<()> {
        // Each pass snapshots the ring's dirty set; flushing can dirty or
        // move entries, so iterate to a fixed point with a stall guard.
        loop {
            let snapshot: Vec<Addr> = self
                .index
                .dirty_in_ring(ring)
                .iter()
                .copied()
                .filter(|addr| {
                    let entry = self.index.get(*addr).expect("dirty set out of sync");
                    if entry.is_protected() {
                        return false;
                    }
                    if mode == FlushMode::MarkedOnly
                        && !entry.flags.contains(EntryFlags::FLUSH_MARKED)
                    {
                        return false;
                    }
                    true
                })
                .collect();
            if snapshot.is_empty() {
                return Ok(());
            }

            let mut normal = Vec::new();
            let mut last = Vec::new();
            let mut collective = Vec::new();
            for addr in snapshot {
                let entry = self.index.get(addr).expect("dirty set out of sync");
                if entry.flags.contains(EntryFlags::FLUSH_ME_LAST) {
                    last.push(addr);
                } else if entry.flags.contains(EntryFlags::FLUSH_ME_COLLECTIVELY) {
                    collective.push(addr);
                } else {
                    normal.push(addr);
                }
            }

            let mut progress = false;
            for addr in &normal {
                if self.parents_clean(*addr) {
                    self.dispatch_entry(*addr, mode)?;
                    progress = true;
                }
            }
            if normal.iter().all(|a| !self.is_dirty_now(*a)) && !collective.is_empty() {
                progress |= self.flush_collective_group(&collective, mode)?;
            }
            let others_clean = normal.iter().all(|a| !self.is_dirty_now(*a))
                && collective.iter().all(|a| !self.is_dirty_now(*a));
            if others_clean {
                for addr in &last {
                    if self.parents_clean(*addr) {
                        self.dispatch_entry(*addr, mode)?;
                        progress = true;
                    }
                }
            }

            if !progress {
                // Everything left is blocked behind a dirty parent in a
                // later pass or a protected parent; a stall with no
                // protected parents anywhere is a dependency error.
                let blocked_on_protected = self.index.dirty_in_ring(ring).iter().any(|addr| {
                    self.index
                        .get(*addr)
                        .map(|e| {
                            e.dep_parents.iter().any(|p| {
                                self.index
                                    .get(*p)
                                    .map(|pe| pe.is_protected())
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(false)
                });
                if blocked_on_protected || mode == FlushMode::MarkedOnly {
                    return Ok(());
                }
                return Err(ErrorKind::Internal(format!(
                    "flush stalled in ring {}",
                    ring.name()
                ))
                .into());
            }
        }
    }

    fn is_dirty_now(&self, addr: Addr) -> bool {
        self.index.get(addr).map(|e| e.is_dirty()).unwrap_or(false)
    }

    fn parents_clean(&self, addr: Addr) -> bool {
        self.index
            .get(addr)
            .map(|e| {
                e.dep_parents
                    .iter()
                    .all(|p| self.index.get(*p).map(|pe| !pe.is_dirty()).unwrap_or(true))
            })
            .unwrap_or(true)
    }

    fn dispatch_entry(&mut self, addr: Addr, mode: FlushMode) -> Result<()> {
        if mode == FlushMode::ClearOnly {
            self.clear_entry(addr)
        } else {
            self.flush_entry(addr).map(|_| ())
        }
    }

    /// Serialize and write the flush-me-collectively group as one vector
    /// write, in address order.
    fn flush_collective_group(&mut self, group: &[Addr], mode: FlushMode) -> Result<bool> {
        let mut ready: Vec<Addr> = group
            .iter()
            .copied()
            .filter(|a| self.is_dirty_now(*a) && self.parents_clean(*a))
            .collect();
        if ready.is_empty() {
            return Ok(false);
        }
        ready.sort_unstable();
        if mode == FlushMode::ClearOnly {
            for addr in &ready {
                self.clear_entry(*addr)?;
            }
            return Ok(true);
        }

        let mut batch: Vec<(Addr, Vec<u8>)> = Vec::with_capacity(ready.len());
        for addr in &ready {
            if let Some(image) = self.prepare_image(*addr)? {
                batch.push(image);
            }
        }
        let refs: Vec<(Addr, &[u8])> = batch
            .iter()
            .map(|(addr, image)| (*addr, image.as_slice()))
            .collect();
        self.io.write_vector(&refs).ctx("collective vector write")?;
        for (addr, image) in batch {
            self.finish_flush(addr, image)?;
        }
        // Entries that produced no image (ghosts) were cleaned in place.
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Entry-level flushing
    // ------------------------------------------------------------------

    /// Flush one dirty entry: recheck its image length, run pre-serialize
    /// (which may move or resize it), serialize, write, and clean. Returns
    /// the address the entry ended up at.
    pub(crate) fn flush_entry(&mut self, addr: Addr) -> Result<Addr> {
        match self.prepare_image(addr)? {
            Some((final_addr, image)) => {
                self.io
                    .write(final_addr, &image)
                    .ctx("writing entry image")?;
                self.finish_flush(final_addr, image)?;
                Ok(final_addr)
            }
            None => Ok(addr),
        }
    }

    /// Produce the serialized image for a dirty entry, applying size and
    /// address changes first. Ghost and imageless entries are cleaned in
    /// place and yield no image.
    fn prepare_image(&mut self, addr: Addr) -> Result<Option<(Addr, Vec<u8>)>> {
        let (class_id, ghost) = {
            let entry = self.index.get(addr).ok_or(ErrorKind::AddressNotFound(addr))?;
            (entry.class, entry.ghost)
        };
        let class = std::sync::Arc::clone(self.registry.get(class_id)?);

        if ghost || class.flags().contains(ClassFlags::NO_IMAGE) {
            self.clean_after_write(addr, None)?;
            return Ok(None);
        }

        // Step 1: the image length may have drifted from the recorded
        // size; the entry's file allocation is resized before writing.
        let cell = self.payload_cell(addr)?;
        let current_len = class.image_len(&**cell.read());
        let recorded = self.index.get(addr).expect("entry vanished").size;
        if current_len != recorded {
            if let Some(hook) = &mut self.space_resize {
                hook(addr, recorded, current_len).ctx("space resize hook")?;
            }
            self.index.set_size(addr, current_len);
        }

        // Step 2: pre-serialize may relocate or resize, bounded.
        let mut cur_addr = addr;
        let mut passes = 0;
        loop {
            let action = {
                let mut guard = cell.write();
                class.pre_serialize(&mut **guard, cur_addr)?
            };
            match action {
                PreSerializeAction::Unchanged => break,
                PreSerializeAction::Move(new_addr) => {
                    self.relocate_during_flush(cur_addr, new_addr, class_id)?;
                    cur_addr = new_addr;
                }
                PreSerializeAction::Resize(new_len) => {
                    let old = self.index.get(cur_addr).expect("entry vanished").size;
                    if let Some(hook) = &mut self.space_resize {
                        hook(cur_addr, old, new_len).ctx("space resize hook")?;
                    }
                    self.index.set_size(cur_addr, new_len);
                }
                PreSerializeAction::MoveAndResize(new_addr, new_len) => {
                    self.relocate_during_flush(cur_addr, new_addr, class_id)?;
                    cur_addr = new_addr;
                    let old = self.index.get(cur_addr).expect("entry vanished").size;
                    if let Some(hook) = &mut self.space_resize {
                        hook(cur_addr, old, new_len).ctx("space resize hook")?;
                    }
                    self.index.set_size(cur_addr, new_len);
                }
            }
            passes += 1;
            if passes > MAX_PRE_SERIALIZE_PASSES {
                return Err(ErrorKind::Corruption(format!(
                    "pre-serialize for {} at {cur_addr:#x} did not converge",
                    class.name()
                ))
                .into());
            }
        }

        // Step 3: serialize into a fresh image buffer.
        let len = self.index.get(cur_addr).expect("entry vanished").size;
        let mut image = vec![0u8; len];
        class
            .serialize(&**cell.read(), &mut image)
            .ctx("serializing entry")?;
        Ok(Some((cur_addr, image)))
    }

    /// Post-write bookkeeping shared by scalar and vector paths.
    fn finish_flush(&mut self, addr: Addr, image: Vec<u8>) -> Result<()> {
        self.clean_after_write(addr, Some(image))
    }

    fn clean_after_write(&mut self, addr: Addr, image: Option<Vec<u8>>) -> Result<()> {
        let size = {
            let entry = self.index.get_mut(addr).ok_or(ErrorKind::AddressNotFound(addr))?;
            entry.flags.insert(EntryFlags::IMAGE_UP_TO_DATE | EntryFlags::SERIALIZED_BEFORE);
            entry.flags.remove(EntryFlags::UNSERIALIZED | EntryFlags::FLUSH_MARKED);
            entry.image = image;
            entry.size
        };
        self.index.set_dirty(addr, false);
        self.index.stats.flushes += 1;

        let parents: Vec<Addr> = self
            .index
            .get(addr)
            .map(|e| e.dep_parents.iter().copied().collect())
            .unwrap_or_default();
        for parent in &parents {
            if let Some(p) = self.index.get_mut(*parent) {
                p.dirty_children = p.dirty_children.saturating_sub(1);
            }
            self.notify_entry(*parent, NotifyEvent::ChildSerialized)?;
            self.notify_entry(*parent, NotifyEvent::ChildCleaned)?;
        }
        self.notify_entry(addr, NotifyEvent::Flushed)?;

        if let Some(coord) = &mut self.coordinator {
            coord.log_cleaned(addr);
        }
        if let Some(log) = &mut self.log_flushed {
            log(addr, size);
        }
        trace!(addr, size, "flushed entry");
        Ok(())
    }

    /// Mark an entry clean without writing it (follower ranks absorbing a
    /// sync-point cleaned set).
    pub(crate) fn clear_entry(&mut self, addr: Addr) -> Result<()> {
        if !self.index.contains(addr) {
            return Ok(());
        }
        self.index.set_dirty(addr, false);
        {
            let entry = self.index.get_mut(addr).expect("entry vanished");
            entry.flags.remove(EntryFlags::FLUSH_MARKED);
        }
        let parents: Vec<Addr> = self
            .index
            .get(addr)
            .map(|e| e.dep_parents.iter().copied().collect())
            .unwrap_or_default();
        for parent in parents {
            if let Some(p) = self.index.get_mut(parent) {
                p.dirty_children = p.dirty_children.saturating_sub(1);
            }
            self.notify_entry(parent, NotifyEvent::ChildCleaned)?;
        }
        self.notify_entry(addr, NotifyEvent::Cleaned)?;
        if let Some(coord) = &mut self.coordinator {
            coord.log_cleaned(addr);
        }
        Ok(())
    }

    /// Address change requested by pre-serialize, applied with the entry
    /// kept dirty so the flush proceeds at the new location.
    fn relocate_during_flush(&mut self, old: Addr, new: Addr, class_id: ClassId) -> Result<()> {
        if self.index.contains(new) {
            return Err(ErrorKind::AlreadyExists(new).into());
        }
        let entry = self.index.get(old).ok_or(ErrorKind::AddressNotFound(old))?;
        let (tag, size) = (entry.tag, entry.accounted_size());
        let _ = class_id;

        let parents: Vec<Addr> = entry.dep_parents.iter().copied().collect();
        let children: Vec<Addr> = entry.dep_children.iter().copied().collect();
        for parent in &parents {
            if let Some(p) = self.index.get_mut(*parent) {
                p.dep_children.remove(&old);
                p.dep_children.insert(new);
            }
        }
        for child in &children {
            if let Some(c) = self.index.get_mut(*child) {
                c.dep_parents.remove(&old);
                c.dep_parents.insert(new);
            }
        }
        self.index.rekey(old, new);
        self.tags.unregister(tag, old);
        self.tags.register(tag, new);
        if let Some(coord) = &mut self.coordinator {
            coord.log_moved(old, new, size);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Keep `incoming` more bytes under the ceiling and the clean watermark
    /// honored, evicting from the LRU tail.
    pub(crate) fn make_space(&mut self, incoming: usize) -> Result<()> {
        if !self.config.evictions_enabled {
            return Ok(());
        }
        let ceiling = self.resize.current_max_size();
        if self.index.size() + incoming > ceiling {
            let victims: Vec<LruItem> = self.index.lru.iter_from_tail().collect();
            for item in victims {
                if self.index.size() + incoming <= ceiling {
                    break;
                }
                let LruItem::Entry(addr) = item else { continue };
                if !self.evictable_now(addr) {
                    continue;
                }
                if self.is_dirty_now(addr) {
                    let final_addr = self.flush_entry(addr).ctx("flushing eviction victim")?;
                    self.evict_entry(final_addr, false)?;
                } else {
                    self.evict_entry(addr, false)?;
                }
            }
        }

        // Clean watermark: flush (without evicting) until enough clean
        // bytes exist, oldest first.
        let min_clean = self.effective_min_clean().min(self.resize.current_max_size());
        if self.index.clean_size() < min_clean && self.index.dirty_count() > 0 {
            let victims: Vec<LruItem> = self.index.lru.iter_from_tail().collect();
            for item in victims {
                if self.index.clean_size() >= min_clean {
                    break;
                }
                let LruItem::Entry(addr) = item else { continue };
                if self.is_dirty_now(addr) && self.parents_clean(addr) {
                    self.flush_entry(addr).ctx("flushing for clean watermark")?;
                }
            }
        }
        Ok(())
    }

    /// Evict every clean, unpinned, unprotected entry without writing
    /// anything. Dirty, pinned, protected, and corked entries stay.
    /// Returns the eviction count.
    pub fn evict(&mut self) -> Result<usize> {
        let mut evicted = 0;
        let victims: Vec<LruItem> = self.index.lru.iter_from_tail().collect();
        for item in victims {
            let LruItem::Entry(addr) = item else { continue };
            if self.is_dirty_now(addr) || !self.evictable_now(addr) {
                continue;
            }
            if let Some(entry) = self.index.get(addr) {
                if !entry.dep_children.is_empty() {
                    continue;
                }
            }
            self.evict_entry(addr, false)?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Eviction exemptions beyond the entry's own flags: corked tags and
    /// clean children pinned in place by a dirty stay-resident parent.
    fn evictable_now(&self, addr: Addr) -> bool {
        let Some(entry) = self.index.get(addr) else {
            return false;
        };
        if entry.is_pinned() || entry.is_protected() {
            return false;
        }
        if self.tags.is_corked(entry.tag) {
            return false;
        }
        if !entry.is_dirty() {
            let stay = self
                .registry
                .get(entry.class)
                .map(|c| c.flags().contains(ClassFlags::STAY_RESIDENT_WITH_PARENT))
                .unwrap_or(false);
            if stay
                && entry.dep_parents.iter().any(|p| {
                    self.index
                        .get(*p)
                        .map(|pe| pe.is_dirty())
                        .unwrap_or(false)
                })
            {
                return false;
            }
        }
        true
    }

    /// Evict everything after a flush-to-destroy. Pinned or protected
    /// leftovers fail the destroy but leave the cache consistent.
    fn destroy_all(&mut self) -> Result<()> {
        self.index.clear_epoch_markers();
        let addrs: Vec<Addr> = self.index.addrs().collect();
        for addr in addrs {
            let Some(entry) = self.index.get(addr) else {
                continue;
            };
            if entry.is_protected() || entry.is_pinned() {
                return Err(ErrorKind::InvalidState(format!(
                    "entry {addr:#x} still {} at destroy",
                    if entry.is_protected() { "protected" } else { "pinned" }
                ))
                .into());
            }
            self.evict_entry(addr, true)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Epoch boundaries
    // ------------------------------------------------------------------

    pub(crate) fn handle_epoch_boundary(&mut self) -> Result<()> {
        let epochs = self.resize.epochs_before_eviction();
        let decision = self.resize.end_epoch(self.index.size());
        if decision.evict_aged {
            let aged = self.index.lru.entries_older_than_marker(epochs);
            for addr in aged {
                if !self.evictable_now(addr) {
                    continue;
                }
                if self.is_dirty_now(addr) {
                    let final_addr = self.flush_entry(addr).ctx("flushing aged entry")?;
                    self.evict_entry(final_addr, false)?;
                } else {
                    self.evict_entry(addr, false)?;
                }
            }
        }
        if decision.insert_marker {
            self.index.push_epoch_marker(epochs);
        }
        if decision.new_max < decision.old_max {
            self.make_space(0).ctx("shrinking to new ceiling")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync points
    // ------------------------------------------------------------------

    pub(crate) fn maybe_run_sync_point(&mut self) -> Result<()> {
        if self.flush_in_progress {
            return Ok(());
        }
        let due = self
            .coordinator
            .as_ref()
            .map(|c| c.should_sync())
            .unwrap_or(false);
        if due {
            self.run_sync_point()?;
        }
        Ok(())
    }

    /// Collective sync point: the writer flushes candidates down to the
    /// clean watermark and publishes the cleaned set; followers absorb it.
    pub fn run_sync_point(&mut self) -> Result<()> {
        let (is_writer, candidates) = {
            let coord = self
                .coordinator
                .as_mut()
                .ok_or_else(|| ErrorKind::InvalidState("no coordinator installed".into()))?;
            (coord.can_write(), coord.negotiate_candidates()?)
        };
        debug!(is_writer, candidates = candidates.len(), "sync point");

        if is_writer {
            for addr in &candidates {
                if let Some(entry) = self.index.get_mut(*addr) {
                    entry.flags.insert(EntryFlags::FLUSH_MARKED);
                }
            }
            let flushed = self.flush_marked_for_sync(&candidates)?;
            self.coordinator
                .as_mut()
                .expect("coordinator vanished")
                .complete_sync_writer(&flushed)?;
        } else {
            let cleaned = self
                .coordinator
                .as_mut()
                .expect("coordinator vanished")
                .complete_sync_follower()?;
            for addr in cleaned {
                self.clear_entry(addr).ctx("absorbing cleaned set")?;
            }
        }
        Ok(())
    }

    /// Flush marked candidates, ring order, until the clean watermark is
    /// crossed. Returns what was actually written.
    fn flush_marked_for_sync(&mut self, candidates: &[Addr]) -> Result<Vec<Addr>> {
        let candidate_set: HashSet<Addr> = candidates.iter().copied().collect();
        let min_clean = self.effective_min_clean();
        let mut flushed = Vec::new();
        self.flush_in_progress = true;
        let result = (|| -> Result<()> {
            'rings: for ring in Ring::ALL {
                loop {
                    let ready: Vec<Addr> = self
                        .index
                        .dirty_in_ring(ring)
                        .iter()
                        .copied()
                        .filter(|a| candidate_set.contains(a))
                        .filter(|a| {
                            let e = self.index.get(*a).expect("dirty set out of sync");
                            !e.is_protected() && self.parents_clean(*a)
                        })
                        .collect();
                    if ready.is_empty() {
                        break;
                    }
                    for addr in ready {
                        let final_addr = self.flush_entry(addr)?;
                        flushed.push(final_addr);
                        if self.index.clean_size() >= min_clean {
                            break 'rings;
                        }
                    }
                }
            }
            Ok(())
        })();
        self.flush_in_progress = false;
        result?;
        Ok(flushed)
    }

    // ------------------------------------------------------------------
    // Tagged operations
    // ------------------------------------------------------------------

    /// Flush all dirty entries of one logical object, pulling in any dirty
    /// dependency ancestors outside the tag so ordering holds.
    pub fn flush_tagged(&mut self, tag: Tag) -> Result<()> {
        let mut set: HashSet<Addr> = self
            .tags
            .entries(tag)
            .into_iter()
            .filter(|a| self.is_dirty_now(*a))
            .collect();
        // Close over dirty ancestors.
        let mut queue: Vec<Addr> = set.iter().copied().collect();
        while let Some(addr) = queue.pop() {
            let parents: Vec<Addr> = self
                .index
                .get(addr)
                .map(|e| e.dep_parents.iter().copied().collect())
                .unwrap_or_default();
            for parent in parents {
                if self.is_dirty_now(parent) && set.insert(parent) {
                    queue.push(parent);
                }
            }
        }

        // Ring order, parents first within the set.
        for ring in Ring::ALL {
            loop {
                let ready: Vec<Addr> = self
                    .index
                    .dirty_in_ring(ring)
                    .iter()
                    .copied()
                    .filter(|a| set.contains(a))
                    .filter(|a| {
                        let e = self.index.get(*a).expect("dirty set out of sync");
                        !e.is_protected() && self.parents_clean(*a)
                    })
                    .collect();
                if ready.is_empty() {
                    break;
                }
                for addr in ready {
                    self.flush_entry(addr).ctx("flush_tagged entry")?;
                }
            }
        }
        Ok(())
    }

    /// Evict every entry of one logical object, flushing dirty ones first.
    /// Corked tags retain their entries; returns the eviction count.
    pub fn evict_tagged(&mut self, tag: Tag) -> Result<usize> {
        if self.tags.is_corked(tag) {
            debug!(%tag, "evict_tagged skipped: tag is corked");
            return Ok(0);
        }
        let addrs = self.tags.entries(tag);
        for addr in &addrs {
            if let Some(entry) = self.index.get(*addr) {
                if entry.is_protected() {
                    return Err(ErrorKind::Protected(*addr).into());
                }
            }
        }
        self.flush_tagged(tag).ctx("flushing before tagged evict")?;
        let mut evicted = 0;
        // Children before parents so dependency edges never dangle toward
        // evicted parents.
        let mut remaining: Vec<Addr> = self.tags.entries(tag);
        loop {
            let mut deferred = Vec::new();
            let mut progress = false;
            for addr in remaining {
                let Some(entry) = self.index.get(addr) else {
                    continue;
                };
                if entry.is_pinned() {
                    continue;
                }
                if !entry.dep_children.is_empty() {
                    deferred.push(addr);
                    continue;
                }
                self.evict_entry(addr, true)?;
                evicted += 1;
                progress = true;
            }
            if deferred.is_empty() || !progress {
                break;
            }
            remaining = deferred;
        }
        Ok(evicted)
    }

    /// Expunge every entry of one tag and class, dirty or not.
    pub fn expunge_tag_type(&mut self, tag: Tag, class_id: ClassId) -> Result<usize> {
        let addrs: Vec<Addr> = self
            .tags
            .entries(tag)
            .into_iter()
            .filter(|a| {
                self.index
                    .get(*a)
                    .map(|e| e.class == class_id)
                    .unwrap_or(false)
            })
            .collect();
        for addr in &addrs {
            let entry = self.index.get(*addr).expect("tagged entry vanished");
            if entry.is_pinned() || entry.is_protected() {
                return Err(ErrorKind::Protected(*addr).into());
            }
        }
        let count = addrs.len();
        for addr in addrs {
            if let Some(coord) = &mut self.coordinator {
                coord.log_cleaned(addr);
            }
            self.evict_entry(addr, true)?;
        }
        Ok(count)
    }
}
