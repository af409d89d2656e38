// Free-space manager.
//
// Owns the section bins for one container region, keeps the header's
// aggregate view in sync, and persists itself through the metadata cache:
// the header and section-info block are cache entries like any other,
// tagged `Tag::FREE_SPACE` in the meta-free-space ring.
//
// The section info is "floating" while it has no disk allocation and
// becomes a cached entry once space is assigned; serialization follows the
// avoid-shrink rule so a self-referential manager cannot recurse at close
// (freeing the old section-info block would mint a new section, which
// would grow the section info, which would need a new block, ...).

use crate::cache::class::{ClassId, EntryClass, EntryPayload};
use crate::cache::engine::{InsertFlags, MetadataCache, ProtectFlags, UnprotectFlags};
use crate::common::{addr_defined, Addr, Ring, Tag, ADDR_UNDEF};
use crate::context;
use crate::error::{ErrorKind, Result, ResultExt};
use crate::freespace::bins::SectionBins;
use crate::freespace::header::{FreeSpaceHeader, HEADER_ENCODED_SIZE};
use crate::freespace::section::{
    AddFlags, SectClassId, Section, SectionClassRegistry,
};
use crate::freespace::sinfo::{self, AccessMode, SinfoLock};
use crate::vfd::BlockIo;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, trace};

// ============================================================================
// Configuration and stats
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FreeSpaceConfig {
    /// Alignment for large requests; 0 or 1 disables the alignment path.
    pub alignment: u64,
    /// Requests at or above this size go through the alignment path.
    pub align_threshold: u64,
}

impl Default for FreeSpaceConfig {
    fn default() -> Self {
        Self {
            alignment: 0,
            align_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceStats {
    pub total_space: u64,
    pub section_count: u64,
    pub serializable_count: u64,
    pub ghost_count: u64,
}

/// Where the section info currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinfoHome {
    /// In-memory only; no disk allocation exists yet.
    Floating,
    /// Backed by a cache entry at `header.sinfo_addr`.
    Cached,
}

// ============================================================================
// Cache entry plumbing for the persisted blocks
// ============================================================================

/// Payload for the header and section-info cache entries: the encoded
/// block bytes.
#[derive(Debug)]
pub struct FsBlockPayload {
    pub bytes: Vec<u8>,
}

impl EntryPayload for FsBlockPayload {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Entry class for free-space blocks. `load_size` comes from the caller's
/// udata: the header size is fixed, the section-info size is recorded in
/// the header.
#[derive(Debug)]
pub struct FsBlockClass {
    pub id: ClassId,
    pub name: &'static str,
}

impl EntryClass for FsBlockClass {
    fn id(&self) -> ClassId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn load_size(&self, udata: &dyn Any) -> usize {
        *udata.downcast_ref::<usize>().unwrap_or(&0)
    }

    fn deserialize(&self, image: &[u8], _udata: &dyn Any) -> Result<Box<dyn EntryPayload>> {
        Ok(Box::new(FsBlockPayload {
            bytes: image.to_vec(),
        }))
    }

    fn image_len(&self, payload: &dyn EntryPayload) -> usize {
        payload
            .as_any()
            .downcast_ref::<FsBlockPayload>()
            .map(|p| p.bytes.len())
            .unwrap_or(0)
    }

    fn serialize(&self, payload: &dyn EntryPayload, image: &mut [u8]) -> Result<()> {
        let block = payload
            .as_any()
            .downcast_ref::<FsBlockPayload>()
            .ok_or_else(|| ErrorKind::Internal("payload is not a free-space block".into()))?;
        image.copy_from_slice(&block.bytes);
        Ok(())
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Debug)]
pub struct FreeSpaceManager {
    classes: SectionClassRegistry,
    config: FreeSpaceConfig,
    bins: SectionBins,
    header: FreeSpaceHeader,
    lock: SinfoLock,
    /// Suppresses serialized-size recomputation while sections stream in
    /// from a deserializing load.
    deserializing: bool,
}

impl FreeSpaceManager {
    pub fn new(classes: SectionClassRegistry, config: FreeSpaceConfig) -> Self {
        let header = FreeSpaceHeader::new(classes.len() as u16);
        Self {
            classes,
            config,
            bins: SectionBins::new(),
            header,
            lock: SinfoLock::new(),
            deserializing: false,
        }
    }

    pub fn stats(&self) -> FreeSpaceStats {
        FreeSpaceStats {
            total_space: self.header.total_space,
            section_count: self.header.section_count,
            serializable_count: self.header.serializable_count,
            ghost_count: self.header.ghost_count,
        }
    }

    pub fn header(&self) -> &FreeSpaceHeader {
        &self.header
    }

    pub fn sinfo_home(&self) -> SinfoHome {
        if addr_defined(self.header.sinfo_addr) {
            SinfoHome::Cached
        } else {
            SinfoHome::Floating
        }
    }

    pub fn section_count(&self) -> u64 {
        self.header.section_count
    }

    fn after_mutation(&mut self) -> Result<()> {
        self.header.sync_totals(self.bins.totals());
        if !self.deserializing {
            self.header.sinfo_size = sinfo::serialized_size(&self.bins, &self.classes)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Section operations
    // ------------------------------------------------------------------

    /// Add a free section. With `RETURNED_SPACE`, merge with both
    /// neighbors to a fixed point, then try to give the survivor back to
    /// the container when it touches end-of-allocation.
    pub fn add(&mut self, mut section: Section, flags: AddFlags, io: &mut BlockIo) -> Result<()> {
        self.lock.acquire(AccessMode::ReadWrite);
        let was_deserializing = self.deserializing;
        if flags.contains(AddFlags::DESERIALIZING) {
            self.deserializing = true;
        }
        let result = self.add_locked(&mut section, flags, io);
        self.deserializing = was_deserializing;
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    fn add_locked(&mut self, section: &mut Section, flags: AddFlags, io: &mut BlockIo) -> Result<()> {
        let class = Arc::clone(self.classes.get(section.class)?);
        class.on_add(section, flags)?;
        self.lock.mark_dirty()?;

        let mut sect = section.clone();
        if flags.intersects(AddFlags::MERGE | AddFlags::RETURNED_SPACE) {
            // Merge left and right repeatedly until nothing adjoins.
            loop {
                let (left, _) = self.bins.merge_neighbors(sect.addr, sect.size);
                let mut merged = false;
                if let Some(left_addr) = left {
                    let left_sect = self.bins.get(left_addr).expect("merge list out of sync");
                    if self.classes.mergeable(left_sect, &sect)? {
                        let mut left_sect = self.bins.unlink(left_addr, &self.classes)?;
                        let left_class = Arc::clone(self.classes.get(left_sect.class)?);
                        left_class.merge(&mut left_sect, sect)?;
                        sect = left_sect;
                        merged = true;
                    }
                }
                let (_, right) = self.bins.merge_neighbors(sect.addr, sect.size);
                if let Some(right_addr) = right {
                    let right_sect = self.bins.get(right_addr).expect("merge list out of sync");
                    if self.classes.mergeable(&sect, right_sect)? {
                        let right_sect = self.bins.unlink(right_addr, &self.classes)?;
                        let sect_class = Arc::clone(self.classes.get(sect.class)?);
                        sect_class.merge(&mut sect, right_sect)?;
                        merged = true;
                    }
                }
                if !merged {
                    break;
                }
            }
            // Returned space touching end-of-allocation goes straight back.
            if flags.contains(AddFlags::RETURNED_SPACE) {
                let sect_class = Arc::clone(self.classes.get(sect.class)?);
                if sect_class.can_shrink(&sect, io.get_eoa()) {
                    sect_class.on_shrink(&sect)?;
                    io.set_eoa(sect.addr).ctx("shrinking container at add")?;
                    trace!(addr = sect.addr, "returned section consumed by container shrink");
                    return self.after_mutation();
                }
            }
        }

        trace!(addr = sect.addr, size = sect.size, "adding free section");
        self.bins.link(sect, &self.classes)?;
        self.after_mutation()
    }

    /// Take a section out of the tracker.
    pub fn remove(&mut self, addr: Addr) -> Result<Section> {
        self.lock.acquire(AccessMode::ReadWrite);
        let result = (|| {
            self.lock.mark_dirty()?;
            let sect = self.bins.unlink(addr, &self.classes)?;
            self.after_mutation()?;
            Ok(sect)
        })();
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    /// Best-fit search. The returned section is removed from the tracker;
    /// with alignment configured and a request at or past the threshold,
    /// the result starts aligned and the padding is split off as a fresh
    /// free section.
    pub fn find(&mut self, size: u64) -> Result<Option<Section>> {
        self.lock.acquire(AccessMode::ReadWrite);
        let result = self.find_locked(size);
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    fn find_locked(&mut self, size: u64) -> Result<Option<Section>> {
        let aligned = self.config.alignment > 1 && size >= self.config.align_threshold;
        if aligned {
            let Some((addr, pad)) = self.bins.find_aligned(size, self.config.alignment) else {
                return Ok(None);
            };
            self.lock.mark_dirty()?;
            let mut sect = self.bins.unlink(addr, &self.classes)?;
            if pad > 0 {
                let class = Arc::clone(self.classes.get(sect.class)?);
                let head = class.split(&mut sect, pad)?;
                self.bins.link(head, &self.classes)?;
            }
            self.after_mutation()?;
            return Ok(Some(sect));
        }

        let Some(addr) = self.bins.find_best(size) else {
            return Ok(None);
        };
        self.lock.mark_dirty()?;
        let sect = self.bins.unlink(addr, &self.classes)?;
        self.after_mutation()?;
        Ok(Some(sect))
    }

    /// Grow an allocation `[addr, addr+size)` in place by `extra` bytes,
    /// consuming the head of the immediately following section.
    pub fn try_extend(&mut self, addr: Addr, size: u64, extra: u64) -> Result<bool> {
        if extra == 0 {
            return Ok(true);
        }
        if self.bins.extend_candidate(addr, size, extra).is_none() {
            return Ok(false);
        }
        self.lock.acquire(AccessMode::ReadWrite);
        let result = (|| {
            self.lock.mark_dirty()?;
            let mut neighbor = self.bins.unlink(addr + size, &self.classes)?;
            if neighbor.size > extra {
                let class = Arc::clone(self.classes.get(neighbor.class)?);
                let _consumed = class.split(&mut neighbor, extra)?;
                self.bins.link(neighbor, &self.classes)?;
            }
            self.after_mutation()?;
            Ok(true)
        })();
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    /// Re-run merge and shrink for a section already in the tracker, after
    /// its circumstances changed (typically a class change).
    pub fn try_merge(&mut self, addr: Addr, io: &mut BlockIo) -> Result<bool> {
        let before = self.bins.len();
        let sect = self.remove(addr).ctx("unlinking for re-merge")?;
        self.add(sect, AddFlags::RETURNED_SPACE, io)?;
        Ok(self.bins.len() < before)
    }

    /// Give trailing free space back to the container: while the last
    /// section ends at end-of-allocation and its class allows, consume it.
    pub fn try_shrink_container(&mut self, io: &mut BlockIo) -> Result<bool> {
        self.lock.acquire(AccessMode::ReadWrite);
        let result = (|| {
            let mut shrunk = false;
            loop {
                let Some(last) = self.bins.last_section() else {
                    break;
                };
                let class = Arc::clone(self.classes.get(last.class)?);
                if !class.can_shrink(last, io.get_eoa()) {
                    break;
                }
                let addr = last.addr;
                self.lock.mark_dirty()?;
                let sect = self.bins.unlink(addr, &self.classes)?;
                class.on_shrink(&sect)?;
                io.set_eoa(sect.addr).ctx("shrinking container")?;
                debug!(new_eoa = sect.addr, "container shrunk");
                shrunk = true;
            }
            if shrunk {
                self.after_mutation()?;
            }
            Ok(shrunk)
        })();
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    /// Visit every section. Order is unspecified.
    pub fn iterate(&self, mut op: impl FnMut(&Section) -> Result<()>) -> Result<()> {
        for sect in self.bins.iter() {
            op(sect)?;
        }
        Ok(())
    }

    pub fn change_class(&mut self, addr: Addr, new_class: SectClassId) -> Result<()> {
        self.lock.acquire(AccessMode::ReadWrite);
        let result = (|| {
            self.lock.mark_dirty()?;
            self.bins.change_class(addr, new_class, &self.classes)?;
            self.after_mutation()
        })();
        self.lock.release().ctx("releasing section info lock")?;
        result
    }

    // ------------------------------------------------------------------
    // Persistence through the cache
    // ------------------------------------------------------------------

    /// Recompute the serialized section-info size and reconcile it with
    /// the on-disk allocation.
    ///
    /// While closing or flushing, the block never shrinks: a smaller
    /// recomputed size keeps the old allocation and pads up to it. A
    /// larger size frees the old block and lets the next allocation cycle
    /// claim a bigger one. Outside close, any size change reallocates.
    pub fn reconcile_sinfo_space(&mut self, closing_or_flushing: bool, io: &mut BlockIo) -> Result<()> {
        let computed = sinfo::serialized_size(&self.bins, &self.classes)?;
        let alloc = self.header.alloc_sinfo_size;

        if addr_defined(self.header.sinfo_addr) {
            if closing_or_flushing {
                if computed > alloc {
                    io.free(self.header.sinfo_addr, alloc)
                        .ctx("freeing outgrown section info block")?;
                    self.header.sinfo_addr = ADDR_UNDEF;
                    self.header.alloc_sinfo_size = 0;
                    self.header.sinfo_size = computed;
                } else {
                    // Avoid-shrink: keep the allocation, pad the encoding.
                    self.header.sinfo_size = alloc;
                }
            } else if computed != alloc {
                io.free(self.header.sinfo_addr, alloc)
                    .ctx("freeing resized section info block")?;
                self.header.sinfo_addr = ADDR_UNDEF;
                self.header.alloc_sinfo_size = 0;
                self.header.sinfo_size = computed;
            }
        } else {
            self.header.sinfo_size = computed;
        }
        Ok(())
    }

    fn ensure_sinfo_allocated(&mut self, io: &mut BlockIo) -> Result<()> {
        if !addr_defined(self.header.sinfo_addr) && self.header.sinfo_size > 0 {
            self.header.sinfo_addr = io.alloc(self.header.sinfo_size)?;
            self.header.alloc_sinfo_size = self.header.sinfo_size;
        }
        Ok(())
    }

    /// Write the header and section info through the metadata cache. The
    /// two blocks are ordinary entries of `hdr_class`/`sinfo_class` under
    /// `Tag::FREE_SPACE` in the meta-free-space ring.
    pub fn persist(
        &mut self,
        cache: &mut MetadataCache,
        hdr_class: ClassId,
        sinfo_class: ClassId,
        hdr_addr: Addr,
        closing: bool,
    ) -> Result<()> {
        let old_sinfo_addr = self.header.sinfo_addr;
        self.reconcile_sinfo_space(closing, cache.io())?;
        self.ensure_sinfo_allocated(cache.io())?;

        let _scope = context::ContextScope::new();
        context::set_tag(Tag::FREE_SPACE);
        context::set_ring(Ring::MetaFreeSpace);

        // A reallocated section info leaves its old cache entry behind;
        // discard it so the stale block is never written.
        if addr_defined(old_sinfo_addr)
            && old_sinfo_addr != self.header.sinfo_addr
            && cache.get_entry_status(old_sinfo_addr).resident
        {
            cache
                .expunge_entry(old_sinfo_addr, sinfo_class)
                .ctx("expunging stale section info entry")?;
        }

        if self.header.sinfo_size > 0 {
            let mut encoded = sinfo::encode(&self.bins, &self.classes)?;
            // Avoid-shrink padding: the block on disk stays alloc-sized.
            if (encoded.len() as u64) < self.header.sinfo_size {
                encoded.resize(self.header.sinfo_size as usize, 0);
            }
            self.write_block(cache, sinfo_class, self.header.sinfo_addr, encoded)
                .ctx("persisting section info")?;
        }
        let encoded = self.header.encode();
        self.write_block(cache, hdr_class, hdr_addr, encoded)
            .ctx("persisting free-space header")?;
        Ok(())
    }

    fn write_block(
        &self,
        cache: &mut MetadataCache,
        class: ClassId,
        addr: Addr,
        bytes: Vec<u8>,
    ) -> Result<()> {
        if cache.get_entry_status(addr).resident {
            let new_len = bytes.len();
            let cell = cache.protect(addr, class, &new_len, ProtectFlags::empty())?;
            {
                let mut guard = cell.write();
                let block = guard
                    .as_any_mut()
                    .downcast_mut::<FsBlockPayload>()
                    .ok_or_else(|| ErrorKind::Internal("free-space entry payload mismatch".into()))?;
                block.bytes = bytes;
            }
            if cache.get_entry_status(addr).size != new_len {
                cache.resize_entry(addr, new_len)?;
            }
            cache.unprotect(addr, UnprotectFlags::DIRTIED)
        } else {
            cache.insert(
                addr,
                class,
                Box::new(FsBlockPayload { bytes }),
                InsertFlags::DIRTY,
            )
        }
    }

    /// Load a persisted manager back through the cache.
    pub fn open(
        classes: SectionClassRegistry,
        config: FreeSpaceConfig,
        cache: &mut MetadataCache,
        hdr_class: ClassId,
        sinfo_class: ClassId,
        hdr_addr: Addr,
    ) -> Result<Self> {
        let _scope = context::ContextScope::new();
        context::set_tag(Tag::FREE_SPACE);
        context::set_ring(Ring::MetaFreeSpace);

        let header = {
            let cell = cache.protect_ro(hdr_addr, hdr_class, &HEADER_ENCODED_SIZE)?;
            let guard = cell.read();
            let block = guard
                .as_any()
                .downcast_ref::<FsBlockPayload>()
                .ok_or_else(|| ErrorKind::Internal("free-space entry payload mismatch".into()))?;
            let header = FreeSpaceHeader::decode(&block.bytes)?;
            drop(guard);
            cache.unprotect(hdr_addr, UnprotectFlags::empty())?;
            header
        };
        if header.class_count as usize != classes.len() {
            return Err(ErrorKind::InvalidArgument(format!(
                "free-space manager persisted with {} classes, opened with {}",
                header.class_count,
                classes.len()
            ))
            .into());
        }

        let mut manager = Self::new(classes, config);
        manager.header = header;

        if addr_defined(manager.header.sinfo_addr) {
            let sections = {
                let load_len = manager.header.alloc_sinfo_size as usize;
                let cell =
                    cache.protect_ro(manager.header.sinfo_addr, sinfo_class, &load_len)?;
                let guard = cell.read();
                let block = guard
                    .as_any()
                    .downcast_ref::<FsBlockPayload>()
                    .ok_or_else(|| {
                        ErrorKind::Internal("free-space entry payload mismatch".into())
                    })?;
                // Trailing avoid-shrink padding is ignored by decode.
                let sections = sinfo::decode(&block.bytes, &manager.classes)?;
                drop(guard);
                cache.unprotect(manager.header.sinfo_addr, UnprotectFlags::empty())?;
                sections
            };
            manager.deserializing = true;
            for sect in sections {
                manager.bins.link(sect, &manager.classes)?;
            }
            manager.deserializing = false;
            manager.header.sync_totals(manager.bins.totals());
        }
        Ok(manager)
    }
}
