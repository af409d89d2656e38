// The metadata cache: entry lifecycle state machine.
//
// One `MetadataCache` per open container. Every piece of metadata the
// container reads or mutates passes through `protect`/`unprotect`; inserts,
// pins, dependency edges, moves, and resizes all route through here so the
// index, tag table, replacement list, and coordinator can never disagree
// about an entry's state.
//
// The flush and eviction machinery lives in `flush.rs` as a second impl
// block over the same struct.

use crate::cache::class::{
    ClassFlags, ClassId, ClassRegistry, EntryClass, EntryPayload, NotifyEvent,
};
use crate::cache::coordinator::Coordinator;
use crate::cache::entry::{CacheEntry, EntryFlags, EntryStatus, PayloadCell};
use crate::cache::index::EntryIndex;
use crate::cache::resize::{AutoResizeConfig, ResizeController};
use crate::cache::tags::TagTable;
use crate::common::{addr_defined, Addr, Ring, Tag, ADDR_UNDEF};
use crate::context;
use crate::error::{ErrorKind, Result, ResultExt};
use crate::vfd::BlockIo;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ============================================================================
// Configuration and callback seams
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte ceiling before the resize controller takes over.
    pub max_size: usize,
    /// Clean-byte watermark the flush engine maintains.
    pub min_clean_size: usize,
    pub read_only: bool,
    /// Disable tag sanity checks. Test contexts only.
    pub ignore_tags: bool,
    pub evictions_enabled: bool,
    /// Address of a persisted cache image to decode on first protect.
    pub image_addr: Addr,
    pub image_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
            min_clean_size: 1024 * 1024,
            read_only: false,
            ignore_tags: false,
            evictions_enabled: true,
            image_addr: ADDR_UNDEF,
            image_len: 0,
        }
    }
}

/// Called once per flushed entry (multi-writer write logging).
pub type LogFlushedFn = Box<dyn FnMut(Addr, usize) + Send>;

/// Asked before every mutating verb when no coordinator is installed.
pub type WritePermitFn = Box<dyn Fn() -> bool + Send>;

/// Called when a flush discovers an entry whose image length changed:
/// (address, old size, new size). Installed by the free-space layer so the
/// entry's file allocation tracks its image.
pub type SpaceResizeFn = Box<dyn FnMut(Addr, usize, usize) -> Result<()> + Send>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Insert the entry already dirty (the common case).
        const DIRTY = 1 << 0;
        const PINNED = 1 << 1;
        const FLUSH_ME_LAST = 1 << 2;
        const FLUSH_ME_COLLECTIVELY = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtectFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnprotectFlags: u32 {
        const DIRTIED = 1 << 0;
        /// Discard the entry without writing it.
        const DELETED = 1 << 1;
        const PIN = 1 << 2;
        const UNPIN = 1 << 3;
        const FLUSH_LAST = 1 << 4;
        const FLUSH_COLLECTIVELY = 1 << 5;
    }
}

/// Snapshot returned by `get_cache_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizeInfo {
    pub max_size: usize,
    pub min_clean_size: usize,
    pub in_use: usize,
    pub dirty_bytes: usize,
    pub entry_count: usize,
}

// ============================================================================
// The cache
// ============================================================================

pub struct MetadataCache {
    pub(crate) config: CacheConfig,
    pub(crate) registry: ClassRegistry,
    pub(crate) index: EntryIndex,
    pub(crate) tags: TagTable,
    pub(crate) io: BlockIo,
    pub(crate) resize: ResizeController,
    pub(crate) coordinator: Option<Coordinator>,
    pub(crate) write_permit: Option<WritePermitFn>,
    pub(crate) log_flushed: Option<LogFlushedFn>,
    pub(crate) space_resize: Option<SpaceResizeFn>,
    pub(crate) ring_settled: [bool; Ring::COUNT],
    pub(crate) closing: bool,
    pub(crate) flush_in_progress: bool,
    pub(crate) image_loaded: bool,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.index.len())
            .field("in_use", &self.index.size())
            .field("max_size", &self.resize.current_max_size())
            .field("closing", &self.closing)
            .finish()
    }
}

impl MetadataCache {
    /// Open a cache over `io` with an immutable class table.
    pub fn create(config: CacheConfig, registry: ClassRegistry, io: BlockIo) -> Result<Self> {
        if config.min_clean_size > config.max_size {
            return Err(
                ErrorKind::InvalidArgument("min_clean_size exceeds max_size".into()).into(),
            );
        }
        let resize = ResizeController::new(AutoResizeConfig {
            set_initial_size: true,
            initial_size: config.max_size,
            max_size: config.max_size.max(crate::cache::resize::MIN_CACHE_SIZE),
            incr_mode: crate::cache::resize::ResizeMode::Off,
            decr_mode: crate::cache::resize::ResizeMode::Off,
            flash_incr_mode: crate::cache::resize::FlashMode::Off,
            ..AutoResizeConfig::default()
        });
        debug!(
            max_size = config.max_size,
            min_clean = config.min_clean_size,
            classes = registry.len(),
            serial = io.serial(),
            "metadata cache created"
        );
        Ok(Self {
            config,
            registry,
            index: EntryIndex::new(),
            tags: TagTable::new(),
            io,
            resize,
            coordinator: None,
            write_permit: None,
            log_flushed: None,
            space_resize: None,
            ring_settled: [false; Ring::COUNT],
            closing: false,
            flush_in_progress: false,
            image_loaded: false,
        })
    }

    pub fn set_write_permit_cb(&mut self, cb: WritePermitFn) {
        self.write_permit = Some(cb);
    }

    pub fn set_log_flushed_cb(&mut self, cb: LogFlushedFn) {
        self.log_flushed = Some(cb);
    }

    pub fn set_space_resize_cb(&mut self, cb: SpaceResizeFn) {
        self.space_resize = Some(cb);
    }

    pub fn set_coordinator(&mut self, coordinator: Coordinator) {
        self.coordinator = Some(coordinator);
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    pub fn io(&mut self) -> &mut BlockIo {
        &mut self.io
    }

    // ------------------------------------------------------------------
    // Permissions and sanity helpers
    // ------------------------------------------------------------------

    pub(crate) fn write_permitted(&self) -> bool {
        if self.config.read_only {
            return false;
        }
        if let Some(coord) = &self.coordinator {
            return coord.can_write();
        }
        if let Some(cb) = &self.write_permit {
            return cb();
        }
        true
    }

    fn require_write(&self) -> Result<()> {
        if self.write_permitted() {
            Ok(())
        } else {
            Err(ErrorKind::ReadOnly.into())
        }
    }

    fn check_tag(&self, tag: Tag) -> Result<Tag> {
        if self.config.ignore_tags {
            return Ok(tag);
        }
        if tag == Tag::INVALID {
            return Err(ErrorKind::TagMismatch(
                "no object tag set in the request context".into(),
            )
            .into());
        }
        Ok(tag)
    }

    fn class(&self, id: ClassId) -> Result<Arc<dyn EntryClass>> {
        Ok(Arc::clone(self.registry.get(id)?))
    }

    /// Record a protect-path access against the hit-rate machinery, closing
    /// the epoch when due.
    fn record_access(&mut self, hit: bool) -> Result<()> {
        if hit {
            self.index.stats.hits += 1;
        } else {
            self.index.stats.misses += 1;
        }
        if self.resize.record_access(hit) {
            self.handle_epoch_boundary()?;
        }
        Ok(())
    }

    /// Touching an entry in a ring unsettles that ring; during shutdown a
    /// settled ring refuses further mutation.
    pub(crate) fn unsettle_ring_for_mutation(&mut self, ring: Ring) -> Result<()> {
        if self.ring_settled[ring.index()] {
            if self.closing {
                return Err(ErrorKind::RingSettled(ring.name()).into());
            }
            self.ring_settled[ring.index()] = false;
        }
        Ok(())
    }

    pub fn settle_ring(&mut self, ring: Ring) {
        self.ring_settled[ring.index()] = true;
    }

    /// Explicitly unsettle a ring. Outside shutdown this merely clears the
    /// flag; during shutdown, unsettling a ring the close sequence already
    /// settled is fatal.
    pub fn unsettle_ring(&mut self, ring: Ring) -> Result<()> {
        self.unsettle_ring_for_mutation(ring)
    }

    pub fn is_ring_settled(&self, ring: Ring) -> bool {
        self.ring_settled[ring.index()]
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    pub fn insert(
        &mut self,
        addr: Addr,
        class_id: ClassId,
        payload: Box<dyn EntryPayload>,
        flags: InsertFlags,
    ) -> Result<()> {
        self.require_write().ctx("insert")?;
        if !addr_defined(addr) {
            return Err(ErrorKind::InvalidArgument("insert at undefined address".into()).into());
        }
        if self.index.contains(addr) {
            return Err(ErrorKind::AlreadyExists(addr).into());
        }
        let class = self.class(class_id)?;
        let tag = self.check_tag(context::get_tag()).ctx("insert tag sanity")?;
        let ring = context::get_ring();
        self.unsettle_ring_for_mutation(ring)?;

        let ghost = class.flags().contains(ClassFlags::GHOST);
        let size = class.image_len(payload.as_ref());
        if flags.contains(InsertFlags::FLUSH_ME_LAST)
            && !class.flags().contains(ClassFlags::FLUSH_LAST_ALLOWED)
        {
            return Err(ErrorKind::InvalidFlags(format!(
                "class {} does not allow flush-me-last",
                class.name()
            ))
            .into());
        }

        self.resize.maybe_flash_increment(if ghost { 0 } else { size });
        self.make_space(if ghost { 0 } else { size })
            .ctx("making space for insert")?;

        let mut entry = CacheEntry::new(addr, size, class_id, tag, ring, payload, ghost);
        if flags.contains(InsertFlags::PINNED) {
            entry.flags.insert(EntryFlags::PINNED);
        }
        if flags.contains(InsertFlags::FLUSH_ME_LAST) {
            entry.flags.insert(EntryFlags::FLUSH_ME_LAST);
        }
        if flags.contains(InsertFlags::FLUSH_ME_COLLECTIVELY) {
            entry.flags.insert(EntryFlags::FLUSH_ME_COLLECTIVELY);
        }
        self.index.insert(entry);
        if flags.contains(InsertFlags::DIRTY) {
            self.index.set_dirty(addr, true);
        }
        self.tags.register(tag, addr);
        self.index.stats.insertions += 1;

        {
            let cell = self.payload_cell(addr)?;
            let mut guard = cell.write();
            if let Err(e) = class.notify(NotifyEvent::InsertedIntoCache, &mut **guard) {
                // Undo the insert so a failed notify leaves no trace.
                drop(guard);
                self.tags.unregister(tag, addr);
                self.index.remove(addr);
                return Err(e).ctx("insert notify");
            }
        }

        if flags.contains(InsertFlags::DIRTY) {
            if let Some(coord) = &mut self.coordinator {
                coord.log_inserted(addr, size);
            }
            self.maybe_run_sync_point().ctx("post-insert sync point")?;
        }
        trace!(addr, size, class = class.name(), "inserted entry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // protect / unprotect
    // ------------------------------------------------------------------

    pub fn protect(
        &mut self,
        addr: Addr,
        class_id: ClassId,
        udata: &dyn Any,
        flags: ProtectFlags,
    ) -> Result<PayloadCell> {
        if !addr_defined(addr) {
            return Err(ErrorKind::InvalidArgument("protect at undefined address".into()).into());
        }
        let read_only = flags.contains(ProtectFlags::READ_ONLY);
        if !read_only {
            self.require_write().ctx("write protect")?;
        }
        let class = self.class(class_id)?;

        // A configured cache image is decoded on the first protect.
        if addr_defined(self.config.image_addr) && !self.image_loaded {
            self.load_image().ctx("decoding cache image")?;
        }

        let hit = self.index.contains(addr);
        if hit {
            let entry = self.index.get(addr).expect("hit entry vanished");
            if entry.class != class_id {
                return Err(ErrorKind::InvalidArgument(format!(
                    "protect class mismatch at {addr:#x}"
                ))
                .into());
            }
            if entry.is_protected() {
                let both_ro = read_only && entry.flags.contains(EntryFlags::READ_ONLY_PROTECT);
                if !(both_ro && class.flags().contains(ClassFlags::READ_ONLY_CONCURRENCY)) {
                    return Err(ErrorKind::Protected(addr).into());
                }
            }
        } else {
            let payload = self.load_entry(addr, &class, udata).ctx("loading entry")?;
            let size = class.image_len(payload.as_ref());
            let tag = self.check_tag(context::get_tag()).ctx("protect tag sanity")?;
            let ring = context::get_ring();
            let ghost = class.flags().contains(ClassFlags::GHOST);

            self.make_space(if ghost { 0 } else { size })
                .ctx("making space for load")?;
            let entry = CacheEntry::new(addr, size, class_id, tag, ring, payload, ghost);
            self.index.insert(entry);
            self.tags.register(tag, addr);
            let cell = self.payload_cell(addr)?;
            class.notify(NotifyEvent::Loaded, &mut **cell.write())?;
        }

        let entry = self.index.get_mut(addr).expect("entry vanished in protect");
        entry.flags.insert(EntryFlags::PROTECTED);
        if read_only {
            entry.flags.insert(EntryFlags::READ_ONLY_PROTECT);
        } else {
            entry.flags.remove(EntryFlags::READ_ONLY_PROTECT);
        }
        entry.protect_count += 1;
        let cell = entry.payload.clone();
        self.index.on_protect(addr);
        self.index.stats.protects += 1;
        self.record_access(hit)?;
        trace!(addr, hit, read_only, "protect");
        Ok(cell)
    }

    /// Convenience read-only protect.
    pub fn protect_ro(&mut self, addr: Addr, class_id: ClassId, udata: &dyn Any) -> Result<PayloadCell> {
        self.protect(addr, class_id, udata, ProtectFlags::READ_ONLY)
    }

    fn load_entry(
        &mut self,
        addr: Addr,
        class: &Arc<dyn EntryClass>,
        udata: &dyn Any,
    ) -> Result<Box<dyn EntryPayload>> {
        let load_size = class.load_size(udata);
        if load_size == 0 {
            return Err(ErrorKind::InvalidArgument(format!(
                "class {} reports zero load size",
                class.name()
            ))
            .into());
        }
        let mut image = vec![0u8; load_size];
        self.io.read(addr, &mut image).ctx("initial metadata read")?;

        let verify = class.flags().contains(ClassFlags::HAS_CHECKSUM) && context::get_error_detection();
        if verify && !class.verify_checksum(&image, udata) {
            return Err(ErrorKind::Corruption(format!(
                "checksum mismatch loading {} at {addr:#x}",
                class.name()
            ))
            .into());
        }

        let mut payload = class.deserialize(&image, udata).ctx("deserialize")?;

        // Speculative classes guessed the load size; re-read once with the
        // parsed length when the guess was short.
        if class.flags().contains(ClassFlags::SPECULATIVE_LOAD) {
            let actual = class.image_len(payload.as_ref());
            if actual > load_size {
                let mut full = vec![0u8; actual];
                self.io.read(addr, &mut full).ctx("speculative re-read")?;
                if verify && !class.verify_checksum(&full, udata) {
                    return Err(ErrorKind::Corruption(format!(
                        "checksum mismatch re-loading {} at {addr:#x}",
                        class.name()
                    ))
                    .into());
                }
                payload = class.deserialize(&full, udata).ctx("speculative re-parse")?;
            }
        }
        Ok(payload)
    }

    pub fn unprotect(&mut self, addr: Addr, flags: UnprotectFlags) -> Result<()> {
        let entry = self
            .index
            .get(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if !entry.is_protected() {
            return Err(ErrorKind::InvalidState(format!(
                "unprotect of unprotected entry {addr:#x}"
            ))
            .into());
        }
        if flags.contains(UnprotectFlags::PIN) && flags.contains(UnprotectFlags::UNPIN) {
            return Err(ErrorKind::InvalidFlags("pin and unpin together".into()).into());
        }
        let class = self.class(entry.class)?;
        let ring = entry.ring;

        if flags.contains(UnprotectFlags::DELETED) {
            let entry = self.index.get(addr).expect("deleted entry vanished");
            if entry.protect_count > 1 {
                return Err(ErrorKind::InvalidState(
                    "delete-on-unprotect with other protects outstanding".into(),
                )
                .into());
            }
            if !entry.dep_parents.is_empty() || !entry.dep_children.is_empty() {
                return Err(ErrorKind::InvalidState(
                    "delete-on-unprotect with dependency edges".into(),
                )
                .into());
            }
            self.unsettle_ring_for_mutation(ring)?;
            if let Some(coord) = &mut self.coordinator {
                coord.log_cleaned(addr);
            }
            self.evict_entry(addr, true).ctx("delete on unprotect")?;
            return Ok(());
        }

        // The caller warrants the recorded size still matches the image.
        {
            let entry = self.index.get(addr).expect("entry vanished");
            let actual = class.image_len(&**entry.payload.read());
            if actual != entry.size {
                return Err(ErrorKind::SizeMismatch {
                    addr,
                    recorded: entry.size,
                    actual,
                }
                .into());
            }
        }

        let dirtied = flags.contains(UnprotectFlags::DIRTIED);
        if dirtied {
            self.unsettle_ring_for_mutation(ring)?;
        }

        let entry = self.index.get_mut(addr).expect("entry vanished");
        if flags.contains(UnprotectFlags::FLUSH_LAST) {
            if !class.flags().contains(ClassFlags::FLUSH_LAST_ALLOWED) {
                return Err(ErrorKind::InvalidFlags(format!(
                    "class {} does not allow flush-me-last",
                    class.name()
                ))
                .into());
            }
            entry.flags.insert(EntryFlags::FLUSH_ME_LAST);
        }
        if flags.contains(UnprotectFlags::FLUSH_COLLECTIVELY) {
            entry.flags.insert(EntryFlags::FLUSH_ME_COLLECTIVELY);
        }
        if flags.contains(UnprotectFlags::PIN) {
            entry.flags.insert(EntryFlags::PINNED);
        }
        if flags.contains(UnprotectFlags::UNPIN) {
            entry.flags.remove(EntryFlags::PINNED);
        }
        // Deferred pin/unpin requested mid-protect via pin()/unpin().
        if entry.flags.contains(EntryFlags::PIN_PENDING) {
            entry.flags.insert(EntryFlags::PINNED);
            entry.flags.remove(EntryFlags::PIN_PENDING);
        }
        if entry.flags.contains(EntryFlags::UNPIN_PENDING) {
            entry.flags.remove(EntryFlags::PINNED);
            entry.flags.remove(EntryFlags::UNPIN_PENDING);
        }

        entry.protect_count -= 1;
        let fully_released = entry.protect_count == 0;
        let now_pinned = entry.is_pinned();
        if fully_released {
            entry.flags.remove(EntryFlags::PROTECTED);
            entry.flags.remove(EntryFlags::READ_ONLY_PROTECT);
        }

        if dirtied {
            let size = self.index.get(addr).expect("entry vanished").accounted_size();
            self.mark_entry_dirty_inner(addr).ctx("dirty on unprotect")?;
            if let Some(coord) = &mut self.coordinator {
                coord.log_dirtied(addr, size);
            }
        }

        if fully_released {
            if now_pinned {
                self.index.on_pin(addr);
            } else {
                self.index.on_unprotect(addr);
                self.index.touch(addr);
            }
        }

        self.maybe_run_sync_point().ctx("post-unprotect sync point")?;
        trace!(addr, dirtied, "unprotect");
        Ok(())
    }

    // ------------------------------------------------------------------
    // pin / unpin
    // ------------------------------------------------------------------

    /// Request a pin. On a protected entry the pin takes effect at
    /// unprotect.
    pub fn pin(&mut self, addr: Addr) -> Result<()> {
        let entry = self
            .index
            .get_mut(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if entry.is_protected() {
            entry.flags.insert(EntryFlags::PIN_PENDING);
            entry.flags.remove(EntryFlags::UNPIN_PENDING);
            return Ok(());
        }
        if entry.is_pinned() {
            return Ok(());
        }
        entry.flags.insert(EntryFlags::PINNED);
        self.index.on_pin(addr);
        Ok(())
    }

    pub fn unpin(&mut self, addr: Addr) -> Result<()> {
        let entry = self
            .index
            .get_mut(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if entry.is_protected() {
            entry.flags.insert(EntryFlags::UNPIN_PENDING);
            entry.flags.remove(EntryFlags::PIN_PENDING);
            return Ok(());
        }
        if !entry.is_pinned() {
            return Err(
                ErrorKind::InvalidState(format!("unpin of unpinned entry {addr:#x}")).into(),
            );
        }
        entry.flags.remove(EntryFlags::PINNED);
        self.index.on_unpin(addr);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dirty / serialization marks
    // ------------------------------------------------------------------

    fn require_pinned_or_protected(&self, addr: Addr) -> Result<()> {
        let entry = self
            .index
            .get(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if entry.is_pinned() || entry.is_protected() {
            Ok(())
        } else {
            Err(ErrorKind::InvalidState(format!(
                "entry {addr:#x} is neither pinned nor protected"
            ))
            .into())
        }
    }

    pub fn mark_dirty(&mut self, addr: Addr) -> Result<()> {
        self.require_pinned_or_protected(addr)?;
        let (ring, size) = {
            let e = self.index.get(addr).expect("entry vanished");
            (e.ring, e.accounted_size())
        };
        self.unsettle_ring_for_mutation(ring)?;
        self.mark_entry_dirty_inner(addr)?;
        if let Some(coord) = &mut self.coordinator {
            coord.log_dirtied(addr, size);
        }
        self.maybe_run_sync_point()
    }

    /// Shared dirty transition: flips the bit, invalidates images,
    /// propagates unserialized state, and tells the class hierarchy.
    pub(crate) fn mark_entry_dirty_inner(&mut self, addr: Addr) -> Result<()> {
        let was_dirty = self.index.get(addr).expect("entry vanished").is_dirty();
        self.index.set_dirty(addr, true);
        {
            let entry = self.index.get_mut(addr).expect("entry vanished");
            entry.invalidate_image();
            entry.flags.insert(EntryFlags::UNSERIALIZED);
        }
        self.propagate_unserialized(addr)?;
        if !was_dirty {
            self.notify_entry(addr, NotifyEvent::Dirtied)?;
            self.bump_parent_dirty_children(addr, true)?;
        }
        Ok(())
    }

    pub fn mark_clean(&mut self, addr: Addr) -> Result<()> {
        self.require_pinned_or_protected(addr)?;
        let was_dirty = self.index.get(addr).expect("entry vanished").is_dirty();
        if !was_dirty {
            return Ok(());
        }
        self.index.set_dirty(addr, false);
        self.notify_entry(addr, NotifyEvent::Cleaned)?;
        self.bump_parent_dirty_children(addr, false)?;
        if let Some(coord) = &mut self.coordinator {
            coord.log_cleaned(addr);
        }
        Ok(())
    }

    pub fn mark_serialized(&mut self, addr: Addr) -> Result<()> {
        self.require_pinned_or_protected(addr)?;
        let parents: Vec<Addr> = {
            let entry = self.index.get_mut(addr).ok_or(ErrorKind::AddressNotFound(addr))?;
            entry.flags.remove(EntryFlags::UNSERIALIZED);
            entry.flags.insert(EntryFlags::SERIALIZED_BEFORE);
            entry.dep_parents.iter().copied().collect()
        };
        for parent in parents {
            self.notify_entry(parent, NotifyEvent::ChildSerialized)?;
        }
        Ok(())
    }

    pub fn mark_unserialized(&mut self, addr: Addr) -> Result<()> {
        self.require_pinned_or_protected(addr)?;
        {
            let entry = self.index.get_mut(addr).expect("entry vanished");
            entry.flags.insert(EntryFlags::UNSERIALIZED);
            entry.invalidate_image();
        }
        self.propagate_unserialized(addr)
    }

    /// Clear image-up-to-date on every dependency ancestor so the next
    /// flush re-serializes the whole lineage.
    fn propagate_unserialized(&mut self, addr: Addr) -> Result<()> {
        let mut queue: VecDeque<Addr> = self
            .index
            .get(addr)
            .map(|e| e.dep_parents.iter().copied().collect())
            .unwrap_or_default();
        let mut visited = std::collections::HashSet::new();
        let direct_parents: std::collections::HashSet<Addr> = queue.iter().copied().collect();
        while let Some(ancestor) = queue.pop_front() {
            if !visited.insert(ancestor) {
                continue;
            }
            if let Some(entry) = self.index.get_mut(ancestor) {
                entry.invalidate_image();
                for grand in entry.dep_parents.iter().copied().collect::<Vec<_>>() {
                    queue.push_back(grand);
                }
            }
            if direct_parents.contains(&ancestor) {
                self.notify_entry(ancestor, NotifyEvent::ChildUnserialized)?;
            }
        }
        Ok(())
    }

    fn bump_parent_dirty_children(&mut self, addr: Addr, dirtied: bool) -> Result<()> {
        let parents: Vec<Addr> = self
            .index
            .get(addr)
            .map(|e| e.dep_parents.iter().copied().collect())
            .unwrap_or_default();
        for parent in parents {
            if let Some(p) = self.index.get_mut(parent) {
                if dirtied {
                    p.dirty_children += 1;
                } else {
                    p.dirty_children = p.dirty_children.saturating_sub(1);
                }
            }
            self.notify_entry(
                parent,
                if dirtied {
                    NotifyEvent::ChildDirtied
                } else {
                    NotifyEvent::ChildCleaned
                },
            )?;
        }
        Ok(())
    }

    pub(crate) fn notify_entry(&mut self, addr: Addr, event: NotifyEvent) -> Result<()> {
        let Some(entry) = self.index.get(addr) else {
            return Ok(());
        };
        let class = self.class(entry.class)?;
        let cell = entry.payload.clone();
        let mut guard = cell.write();
        class.notify(event, &mut **guard)
    }

    // ------------------------------------------------------------------
    // resize / move
    // ------------------------------------------------------------------

    pub fn resize_entry(&mut self, addr: Addr, new_size: usize) -> Result<()> {
        self.require_pinned_or_protected(addr)?;
        let (old_size, ring, was_dirty, ghost) = {
            let e = self.index.get(addr).expect("entry vanished");
            (e.size, e.ring, e.is_dirty(), e.ghost)
        };
        if old_size == new_size {
            return Ok(());
        }
        self.unsettle_ring_for_mutation(ring)?;
        if !ghost && new_size > old_size {
            self.resize.maybe_flash_increment(new_size - old_size);
        }
        self.index.set_size(addr, new_size);
        if !was_dirty {
            self.mark_entry_dirty_inner(addr).ctx("dirty on resize")?;
        }
        if let Some(coord) = &mut self.coordinator {
            coord.log_resized(addr, old_size, new_size);
        }
        self.maybe_run_sync_point()
    }

    pub fn move_entry(&mut self, old_addr: Addr, new_addr: Addr, class_id: ClassId) -> Result<()> {
        self.require_write().ctx("move_entry")?;
        if !addr_defined(new_addr) {
            return Err(ErrorKind::InvalidArgument("move to undefined address".into()).into());
        }
        if self.index.contains(new_addr) {
            return Err(ErrorKind::AlreadyExists(new_addr).into());
        }
        let entry = self
            .index
            .get(old_addr)
            .ok_or(ErrorKind::AddressNotFound(old_addr))?;
        if entry.class != class_id {
            return Err(ErrorKind::InvalidArgument(format!(
                "move class mismatch at {old_addr:#x}"
            ))
            .into());
        }
        if entry.is_protected() {
            return Err(ErrorKind::Protected(old_addr).into());
        }
        let (tag, ring, size) = (entry.tag, entry.ring, entry.accounted_size());
        // Re-point dependency edges held by neighbors.
        let parents: Vec<Addr> = entry.dep_parents.iter().copied().collect();
        let children: Vec<Addr> = entry.dep_children.iter().copied().collect();
        self.unsettle_ring_for_mutation(ring)?;
        for parent in &parents {
            if let Some(p) = self.index.get_mut(*parent) {
                p.dep_children.remove(&old_addr);
                p.dep_children.insert(new_addr);
            }
        }
        for child in &children {
            if let Some(c) = self.index.get_mut(*child) {
                c.dep_parents.remove(&old_addr);
                c.dep_parents.insert(new_addr);
            }
        }

        self.index.rekey(old_addr, new_addr);
        self.tags.unregister(tag, old_addr);
        self.tags.register(tag, new_addr);
        let was_dirty = self.index.get(new_addr).expect("moved entry vanished").is_dirty();
        if !was_dirty {
            // A move dirties the entry: its old location must not be read.
            let pinned_or_protected = {
                let e = self.index.get(new_addr).expect("moved entry vanished");
                e.is_pinned() || e.is_protected()
            };
            if pinned_or_protected {
                self.mark_entry_dirty_inner(new_addr)?;
            } else {
                self.index.set_dirty(new_addr, true);
                let e = self.index.get_mut(new_addr).expect("moved entry vanished");
                e.invalidate_image();
                e.flags.insert(EntryFlags::UNSERIALIZED);
                self.propagate_unserialized(new_addr)?;
                self.notify_entry(new_addr, NotifyEvent::Dirtied)?;
                self.bump_parent_dirty_children(new_addr, true)?;
            }
        }
        if let Some(coord) = &mut self.coordinator {
            coord.log_moved(old_addr, new_addr, size);
        }
        self.maybe_run_sync_point().ctx("post-move sync point")?;
        debug!(old = old_addr, new = new_addr, "moved entry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush dependencies
    // ------------------------------------------------------------------

    /// Add the edge "parent is written before child". Rejects edges that
    /// would close a cycle.
    pub fn create_flush_dependency(&mut self, parent: Addr, child: Addr) -> Result<()> {
        if parent == child {
            return Err(ErrorKind::DependencyCycle { parent, child }.into());
        }
        if !self.index.contains(parent) {
            return Err(ErrorKind::AddressNotFound(parent).into());
        }
        if !self.index.contains(child) {
            return Err(ErrorKind::AddressNotFound(child).into());
        }
        // The edge closes a cycle iff parent is reachable from child by
        // descending child edges. Depth-bounded breadth-first walk.
        let mut queue = VecDeque::from([child]);
        let mut visited = std::collections::HashSet::new();
        let mut depth = 0usize;
        const MAX_DEPTH: usize = 1 << 16;
        while let Some(node) = queue.pop_front() {
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(ErrorKind::Internal("dependency graph too deep".into()).into());
            }
            if node == parent {
                return Err(ErrorKind::DependencyCycle { parent, child }.into());
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(entry) = self.index.get(node) {
                queue.extend(entry.dep_children.iter().copied());
            }
        }

        let child_dirty = self.index.get(child).expect("child vanished").is_dirty();
        self.index
            .get_mut(parent)
            .expect("parent vanished")
            .dep_children
            .insert(child);
        if child_dirty {
            self.index.get_mut(parent).expect("parent vanished").dirty_children += 1;
        }
        self.index
            .get_mut(child)
            .expect("child vanished")
            .dep_parents
            .insert(parent);
        Ok(())
    }

    pub fn destroy_flush_dependency(&mut self, parent: Addr, child: Addr) -> Result<()> {
        let had_edge = self
            .index
            .get_mut(parent)
            .ok_or(ErrorKind::AddressNotFound(parent))?
            .dep_children
            .remove(&child);
        if !had_edge {
            return Err(ErrorKind::InvalidArgument(format!(
                "no dependency {parent:#x} -> {child:#x}"
            ))
            .into());
        }
        let (child_dirty, child_unserialized) = {
            let c = self
                .index
                .get_mut(child)
                .ok_or(ErrorKind::AddressNotFound(child))?;
            c.dep_parents.remove(&parent);
            (c.is_dirty(), c.flags.contains(EntryFlags::UNSERIALIZED))
        };
        if child_dirty {
            if let Some(p) = self.index.get_mut(parent) {
                p.dirty_children = p.dirty_children.saturating_sub(1);
            }
        }
        // Severing under an unserialized child: the ancestors' images were
        // built assuming this child's state and must be rebuilt.
        if child_unserialized {
            if let Some(p) = self.index.get_mut(parent) {
                p.invalidate_image();
            }
            self.propagate_unserialized(parent)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // expunge / remove
    // ------------------------------------------------------------------

    /// Discard an entry even if dirty. Pinned or protected entries refuse.
    pub fn expunge_entry(&mut self, addr: Addr, class_id: ClassId) -> Result<()> {
        let entry = self
            .index
            .get(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if entry.class != class_id {
            return Err(ErrorKind::InvalidArgument(format!(
                "expunge class mismatch at {addr:#x}"
            ))
            .into());
        }
        if entry.is_pinned() || entry.is_protected() {
            return Err(ErrorKind::Protected(addr).into());
        }
        let ring = entry.ring;
        self.unsettle_ring_for_mutation(ring)?;
        if let Some(coord) = &mut self.coordinator {
            coord.log_cleaned(addr);
        }
        self.evict_entry(addr, true)
    }

    /// Take out a clean, unpinned, unprotected, dependency-free entry.
    pub fn remove_entry(&mut self, addr: Addr) -> Result<()> {
        let entry = self
            .index
            .get(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        if !entry.removable() {
            return Err(ErrorKind::InvalidState(format!(
                "entry {addr:#x} not removable (dirty, pinned, protected, or has dependencies)"
            ))
            .into());
        }
        self.evict_entry(addr, false)
    }

    /// Shared eviction tail: unregister, notify, free the in-core
    /// representation. Dependency edges to neighbors are severed.
    pub(crate) fn evict_entry(&mut self, addr: Addr, _discard_image: bool) -> Result<()> {
        let entry = self
            .index
            .remove(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        self.tags.unregister(entry.tag, addr);

        for parent in &entry.dep_parents {
            if let Some(p) = self.index.get_mut(*parent) {
                p.dep_children.remove(&addr);
                if entry.is_dirty() {
                    p.dirty_children = p.dirty_children.saturating_sub(1);
                }
            }
        }
        for child in &entry.dep_children {
            if let Some(c) = self.index.get_mut(*child) {
                c.dep_parents.remove(&addr);
            }
        }

        let class = self.class(entry.class)?;
        {
            let mut guard = entry.payload.write();
            class.notify(NotifyEvent::Evicted, &mut **guard)?;
        }
        match Arc::try_unwrap(entry.payload) {
            Ok(lock) => class.free_icr(lock.into_inner())?,
            Err(_) => {
                // A caller still holds the payload cell; the in-core
                // representation is released when the last clone drops.
                warn!(addr, "payload cell still shared at eviction");
            }
        }
        self.index.stats.evictions += 1;
        trace!(addr, "evicted entry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status and statistics
    // ------------------------------------------------------------------

    pub fn get_entry_status(&self, addr: Addr) -> EntryStatus {
        match self.index.get(addr) {
            Some(entry) => EntryStatus {
                resident: true,
                size: entry.size,
                dirty: entry.is_dirty(),
                protected: entry.is_protected(),
                pinned: entry.is_pinned(),
                corked: self.tags.is_corked(entry.tag),
                dep_parent_count: entry.dep_parents.len(),
                dep_child_count: entry.dep_children.len(),
            },
            None => EntryStatus::default(),
        }
    }

    pub fn get_cache_size(&self) -> CacheSizeInfo {
        CacheSizeInfo {
            max_size: self.resize.current_max_size(),
            min_clean_size: self.effective_min_clean(),
            in_use: self.index.size(),
            dirty_bytes: self.index.dirty_size(),
            entry_count: self.index.len(),
        }
    }

    pub fn get_cache_hit_rate(&self) -> f64 {
        self.index.stats.hit_rate()
    }

    pub fn reset_hit_rate_stats(&mut self) {
        self.index.stats.hits = 0;
        self.index.stats.misses = 0;
        self.resize.reset_epoch_stats();
    }

    pub fn stats(&self) -> crate::cache::index::CacheStats {
        self.index.stats
    }

    pub fn set_auto_resize_config(&mut self, config: AutoResizeConfig) -> Result<()> {
        config.validate(self.config.evictions_enabled)?;
        self.resize.set_config(config);
        Ok(())
    }

    pub fn get_auto_resize_config(&self) -> &AutoResizeConfig {
        self.resize.config()
    }

    /// Enable or disable evictions; disabling is rejected while any
    /// auto-resize mode is active.
    pub fn set_evictions_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            let cfg = self.resize.config();
            if cfg.incr_mode.is_active()
                || cfg.decr_mode.is_active()
                || cfg.flash_incr_mode != crate::cache::resize::FlashMode::Off
            {
                return Err(ErrorKind::InvalidArgument(
                    "cannot disable evictions while auto-resize is active".into(),
                )
                .into());
            }
        }
        self.config.evictions_enabled = enabled;
        Ok(())
    }

    pub(crate) fn effective_min_clean(&self) -> usize {
        self.config
            .min_clean_size
            .min(self.resize.current_max_size())
    }

    // ------------------------------------------------------------------
    // Cork
    // ------------------------------------------------------------------

    pub fn cork(&mut self, tag: Tag) {
        self.tags.cork(tag);
    }

    pub fn uncork(&mut self, tag: Tag) -> bool {
        self.tags.uncork(tag)
    }

    pub fn is_corked(&self, tag: Tag) -> bool {
        self.tags.is_corked(tag)
    }

    // ------------------------------------------------------------------
    // Retag
    // ------------------------------------------------------------------

    /// Rebrand every entry carrying `from` (normally `Tag::COPIED`) to the
    /// final object tag after a deep copy lands.
    pub fn retag_copied(&mut self, from: Tag, to: Tag) -> Result<usize> {
        let _ = self.check_tag(to).ctx("retag destination")?;
        let addrs = self.tags.entries(from);
        for addr in &addrs {
            if let Some(entry) = self.index.get_mut(*addr) {
                entry.tag = to;
            }
        }
        let moved = self.tags.retag(from, to);
        debug_assert_eq!(moved, addrs.len());
        Ok(moved)
    }

    pub(crate) fn payload_cell(&self, addr: Addr) -> Result<PayloadCell> {
        Ok(self
            .index
            .get(addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?
            .payload
            .clone())
    }
}

