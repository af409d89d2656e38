// In-memory cache entries.
//
// A `CacheEntry` is the cache's bookkeeping record for one address: state
// flags, tag/ring membership, dependency edges, and a shared cell holding
// the class payload. Payload cells are handed out by `protect`; the
// exclusive-access protocol is enforced by the cache's protect counters,
// not by the lock in the cell.

use crate::cache::class::{ClassId, EntryPayload};
use crate::common::{Addr, Ring, Tag};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared handle to an entry's in-core payload.
pub type PayloadCell = Arc<RwLock<Box<dyn EntryPayload>>>;

bitflags::bitflags! {
    /// Entry state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const DIRTY                 = 1 << 0;
        const PROTECTED             = 1 << 1;
        const READ_ONLY_PROTECT     = 1 << 2;
        const PINNED                = 1 << 3;
        /// Selected for the next marked-only flush (multi-writer candidate).
        const FLUSH_MARKED          = 1 << 4;
        /// Written after all non-last entries of its ring.
        const FLUSH_ME_LAST         = 1 << 5;
        /// Written as part of one coalesced collective write.
        const FLUSH_ME_COLLECTIVELY = 1 << 6;
        /// Accessed collectively by the whole cohort.
        const COLL_ACCESS           = 1 << 7;
        /// The retained image matches the payload.
        const IMAGE_UP_TO_DATE      = 1 << 8;
        /// Entry has been serialized at least once this session.
        const SERIALIZED_BEFORE     = 1 << 9;
        /// Payload changed since the last serialization; propagates to
        /// dependency ancestors.
        const UNSERIALIZED          = 1 << 10;
        /// Pin requested while protected; applied at unprotect.
        const PIN_PENDING           = 1 << 11;
        /// Unpin requested while protected; applied at unprotect.
        const UNPIN_PENDING         = 1 << 12;
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    pub addr: Addr,
    pub size: usize,
    pub class: ClassId,
    pub tag: Tag,
    pub ring: Ring,
    pub flags: EntryFlags,
    /// Outstanding protects. >1 only for read-only concurrency classes.
    pub protect_count: u32,
    /// Dependency edges, by entry address (weak: no ownership implied).
    pub dep_parents: HashSet<Addr>,
    pub dep_children: HashSet<Addr>,
    /// Dirty children count, kept so parents learn child transitions.
    pub dirty_children: u32,
    pub payload: PayloadCell,
    /// Retained serialized image, valid while IMAGE_UP_TO_DATE is set.
    pub image: Option<Vec<u8>>,
    /// Zero-size marker entries participate in the LRU only.
    pub ghost: bool,
}

impl CacheEntry {
    pub fn new(
        addr: Addr,
        size: usize,
        class: ClassId,
        tag: Tag,
        ring: Ring,
        payload: Box<dyn EntryPayload>,
        ghost: bool,
    ) -> Self {
        Self {
            addr,
            size,
            class,
            tag,
            ring,
            flags: EntryFlags::empty(),
            protect_count: 0,
            dep_parents: HashSet::new(),
            dep_children: HashSet::new(),
            dirty_children: 0,
            payload: Arc::new(RwLock::new(payload)),
            image: None,
            ghost,
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.flags.contains(EntryFlags::PROTECTED)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(EntryFlags::PINNED)
    }

    /// Bytes this entry contributes to cache size accounting.
    #[inline]
    pub fn accounted_size(&self) -> usize {
        if self.ghost {
            0
        } else {
            self.size
        }
    }

    /// True when the entry may be evicted right now (clean, unpinned,
    /// unprotected). Dependency and cork exemptions are checked by the
    /// eviction path, which has the neighboring entries at hand.
    pub fn evictable(&self) -> bool {
        !self.is_dirty() && !self.is_pinned() && !self.is_protected()
    }

    /// True when `remove_entry` may take this entry out directly.
    pub fn removable(&self) -> bool {
        self.evictable() && self.dep_parents.is_empty() && self.dep_children.is_empty()
    }

    pub fn invalidate_image(&mut self) {
        self.flags.remove(EntryFlags::IMAGE_UP_TO_DATE);
        self.image = None;
    }
}

/// Snapshot returned by `get_entry_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStatus {
    pub resident: bool,
    pub size: usize,
    pub dirty: bool,
    pub protected: bool,
    pub pinned: bool,
    pub corked: bool,
    pub dep_parent_count: usize,
    pub dep_child_count: usize,
}
