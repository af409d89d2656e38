// Entry index and replacement structures.
//
// The index owns every resident entry: a hash map by address for O(1)
// lookup, an address-ordered map for range walks, an LRU order over
// unprotected unpinned entries, and the pinned set. Epoch markers are
// synthetic LRU items used by the age-out decrement modes; they never
// appear in the address index.
//
// All byte accounting funnels through this type so the counters can never
// drift from the entry states.

use crate::cache::entry::{CacheEntry, EntryFlags};
use crate::common::{Addr, Ring};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const NIL: usize = usize::MAX;

// ============================================================================
// LRU order
// ============================================================================

/// An item on the replacement list: a real entry or an age-out marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LruItem {
    Entry(Addr),
    EpochMarker(u64),
}

#[derive(Debug)]
struct LruNode {
    item: LruItem,
    prev: usize,
    next: usize,
}

/// Doubly-linked recency order backed by a slab, O(1) touch and removal.
/// Head is most recently used.
#[derive(Debug)]
pub struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    map: HashMap<LruItem, usize>,
}

impl Default for LruList {
    fn default() -> Self {
        Self::new()
    }
}

impl LruList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, item: LruItem) -> bool {
        self.map.contains_key(&item)
    }

    fn alloc_node(&mut self, item: LruItem) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = LruNode {
                item,
                prev: NIL,
                next: NIL,
            };
            idx
        } else {
            self.nodes.push(LruNode {
                item,
                prev: NIL,
                next: NIL,
            });
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
    }

    pub fn push_front(&mut self, item: LruItem) {
        debug_assert!(!self.map.contains_key(&item));
        let idx = self.alloc_node(item);
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        self.map.insert(item, idx);
    }

    pub fn remove(&mut self, item: LruItem) -> bool {
        match self.map.remove(&item) {
            Some(idx) => {
                self.unlink(idx);
                self.free.push(idx);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, item: LruItem) {
        if self.remove(item) {
            self.push_front(item);
        }
    }

    /// Least recently used item.
    pub fn back(&self) -> Option<LruItem> {
        (self.tail != NIL).then(|| self.nodes[self.tail].item)
    }

    /// Items from least to most recently used.
    pub fn iter_from_tail(&self) -> impl Iterator<Item = LruItem> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.prev;
            Some(node.item)
        })
    }

    pub fn marker_count(&self) -> usize {
        self.map
            .keys()
            .filter(|item| matches!(item, LruItem::EpochMarker(_)))
            .count()
    }

    /// Entry addresses older than the `n`-th epoch marker from the head,
    /// i.e. entries untouched for at least `n` completed epochs.
    pub fn entries_older_than_marker(&self, n: usize) -> Vec<Addr> {
        let mut seen_markers = 0usize;
        let mut aged = Vec::new();
        let mut cursor = self.head;
        let mut past_nth = false;
        while cursor != NIL {
            let node = &self.nodes[cursor];
            match node.item {
                LruItem::EpochMarker(_) => {
                    seen_markers += 1;
                    if seen_markers >= n {
                        past_nth = true;
                    }
                }
                LruItem::Entry(addr) => {
                    if past_nth {
                        aged.push(addr);
                    }
                }
            }
            cursor = node.next;
        }
        aged
    }

    /// Drop the oldest marker (nearest the tail), if any.
    pub fn pop_oldest_marker(&mut self) -> Option<u64> {
        let mut cursor = self.tail;
        while cursor != NIL {
            if let LruItem::EpochMarker(id) = self.nodes[cursor].item {
                self.remove(LruItem::EpochMarker(id));
                return Some(id);
            }
            cursor = self.nodes[cursor].prev;
        }
        None
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Cumulative cache counters. Hit-rate fields reset with
/// `reset_hit_rate_stats`; the rest persist for the cache lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub moves: u64,
    pub protects: u64,
    pub pins: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let accesses = self.hits + self.misses;
        if accesses == 0 {
            0.0
        } else {
            self.hits as f64 / accesses as f64
        }
    }
}

// ============================================================================
// Entry index
// ============================================================================

#[derive(Debug, Default)]
pub struct EntryIndex {
    map: HashMap<Addr, CacheEntry>,
    by_addr: BTreeMap<Addr, ()>,
    pub lru: LruList,
    pinned: HashSet<Addr>,
    dirty_by_ring: [BTreeSet<Addr>; Ring::COUNT],
    /// Accounted bytes of all resident entries (ghosts excluded).
    size: usize,
    /// Accounted bytes of dirty entries.
    dirty_size: usize,
    pub stats: CacheStats,
    next_marker: u64,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self {
            lru: LruList::new(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dirty_size(&self) -> usize {
        self.dirty_size
    }

    pub fn clean_size(&self) -> usize {
        self.size - self.dirty_size
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.map.contains_key(&addr)
    }

    pub fn get(&self, addr: Addr) -> Option<&CacheEntry> {
        self.map.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut CacheEntry> {
        self.map.get_mut(&addr)
    }

    pub fn addrs(&self) -> impl Iterator<Item = Addr> + '_ {
        self.by_addr.keys().copied()
    }

    pub fn dirty_in_ring(&self, ring: Ring) -> &BTreeSet<Addr> {
        &self.dirty_by_ring[ring.index()]
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_by_ring.iter().map(|s| s.len()).sum()
    }

    // ------------------------------------------------------------------
    // Residency
    // ------------------------------------------------------------------

    /// Register a new entry. The caller has already checked uniqueness.
    pub fn insert(&mut self, entry: CacheEntry) {
        debug_assert!(!self.map.contains_key(&entry.addr));
        let addr = entry.addr;
        self.size += entry.accounted_size();
        if entry.is_dirty() {
            self.dirty_size += entry.accounted_size();
            self.dirty_by_ring[entry.ring.index()].insert(addr);
        }
        if entry.is_pinned() {
            self.pinned.insert(addr);
        } else if !entry.is_protected() {
            self.lru.push_front(LruItem::Entry(addr));
        }
        self.by_addr.insert(addr, ());
        self.map.insert(addr, entry);
    }

    /// Unregister and return an entry.
    pub fn remove(&mut self, addr: Addr) -> Option<CacheEntry> {
        let entry = self.map.remove(&addr)?;
        self.by_addr.remove(&addr);
        self.size -= entry.accounted_size();
        if entry.is_dirty() {
            self.dirty_size -= entry.accounted_size();
            self.dirty_by_ring[entry.ring.index()].remove(&addr);
        }
        self.pinned.remove(&addr);
        self.lru.remove(LruItem::Entry(addr));
        Some(entry)
    }

    /// Re-key an entry to a new address, preserving all state.
    pub fn rekey(&mut self, old: Addr, new: Addr) {
        let mut entry = self.remove(old).expect("rekey of absent entry");
        entry.addr = new;
        self.insert(entry);
        self.stats.moves += 1;
    }

    // ------------------------------------------------------------------
    // State transitions (accounting-aware)
    // ------------------------------------------------------------------

    /// Flip the dirty bit, maintaining byte totals and ring dirty sets.
    pub fn set_dirty(&mut self, addr: Addr, dirty: bool) {
        let entry = self.map.get_mut(&addr).expect("set_dirty of absent entry");
        if entry.is_dirty() == dirty {
            return;
        }
        let bytes = entry.accounted_size();
        let ring = entry.ring.index();
        if dirty {
            entry.flags.insert(EntryFlags::DIRTY);
            self.dirty_size += bytes;
            self.dirty_by_ring[ring].insert(addr);
        } else {
            entry.flags.remove(EntryFlags::DIRTY);
            self.dirty_size -= bytes;
            self.dirty_by_ring[ring].remove(&addr);
        }
    }

    /// Change an entry's recorded size, maintaining byte totals.
    pub fn set_size(&mut self, addr: Addr, new_size: usize) {
        let entry = self.map.get_mut(&addr).expect("set_size of absent entry");
        if entry.ghost {
            entry.size = new_size;
            return;
        }
        let old = entry.size;
        entry.size = new_size;
        self.size = self.size - old + new_size;
        if entry.is_dirty() {
            self.dirty_size = self.dirty_size - old + new_size;
        }
    }

    /// Move an entry between rings, maintaining the ring dirty sets.
    pub fn set_ring(&mut self, addr: Addr, ring: Ring) {
        let entry = self.map.get_mut(&addr).expect("set_ring of absent entry");
        if entry.ring == ring {
            return;
        }
        if entry.is_dirty() {
            self.dirty_by_ring[entry.ring.index()].remove(&addr);
            self.dirty_by_ring[ring.index()].insert(addr);
        }
        entry.ring = ring;
    }

    /// Take an entry off the replacement list for the protect duration.
    pub fn on_protect(&mut self, addr: Addr) {
        self.lru.remove(LruItem::Entry(addr));
    }

    /// Return an entry to the replacement list after unprotect (unless it
    /// is pinned, in which case it lives on the pinned list).
    pub fn on_unprotect(&mut self, addr: Addr) {
        let entry = self.map.get(&addr).expect("unprotect of absent entry");
        if entry.is_pinned() {
            self.pinned.insert(addr);
        } else if !self.lru.contains(LruItem::Entry(addr)) {
            self.lru.push_front(LruItem::Entry(addr));
        }
    }

    pub fn on_pin(&mut self, addr: Addr) {
        self.lru.remove(LruItem::Entry(addr));
        self.pinned.insert(addr);
        self.stats.pins += 1;
    }

    pub fn on_unpin(&mut self, addr: Addr) {
        self.pinned.remove(&addr);
        let entry = self.map.get(&addr).expect("unpin of absent entry");
        if !entry.is_protected() && !self.lru.contains(LruItem::Entry(addr)) {
            self.lru.push_front(LruItem::Entry(addr));
        }
    }

    /// Record a touch for replacement purposes.
    pub fn touch(&mut self, addr: Addr) {
        self.lru.touch(LruItem::Entry(addr));
    }

    pub fn pinned(&self) -> &HashSet<Addr> {
        &self.pinned
    }

    // ------------------------------------------------------------------
    // Epoch markers
    // ------------------------------------------------------------------

    /// Insert a fresh age-out marker at the head of the LRU, retiring the
    /// oldest marker beyond `max_markers`.
    pub fn push_epoch_marker(&mut self, max_markers: usize) {
        let id = self.next_marker;
        self.next_marker += 1;
        self.lru.push_front(LruItem::EpochMarker(id));
        while self.lru.marker_count() > max_markers {
            self.lru.pop_oldest_marker();
        }
    }

    pub fn clear_epoch_markers(&mut self) {
        while self.lru.pop_oldest_marker().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::class::testutil::BlobPayload;
    use crate::cache::class::ClassId;
    use crate::common::Tag;

    fn entry(addr: Addr, size: usize, ring: Ring) -> CacheEntry {
        CacheEntry::new(
            addr,
            size,
            ClassId(0),
            Tag(0x10),
            ring,
            Box::new(BlobPayload { bytes: vec![0; size] }),
            false,
        )
    }

    #[test]
    fn test_lru_order_and_touch() {
        let mut lru = LruList::new();
        lru.push_front(LruItem::Entry(1));
        lru.push_front(LruItem::Entry(2));
        lru.push_front(LruItem::Entry(3));
        assert_eq!(lru.back(), Some(LruItem::Entry(1)));

        lru.touch(LruItem::Entry(1));
        assert_eq!(lru.back(), Some(LruItem::Entry(2)));

        assert!(lru.remove(LruItem::Entry(2)));
        assert_eq!(lru.back(), Some(LruItem::Entry(3)));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_lru_tail_iteration() {
        let mut lru = LruList::new();
        for addr in [10, 20, 30] {
            lru.push_front(LruItem::Entry(addr));
        }
        let order: Vec<_> = lru.iter_from_tail().collect();
        assert_eq!(
            order,
            vec![LruItem::Entry(10), LruItem::Entry(20), LruItem::Entry(30)]
        );
    }

    #[test]
    fn test_epoch_marker_aging() {
        let mut idx = EntryIndex::new();
        idx.insert(entry(0x100, 8, Ring::User));
        idx.push_epoch_marker(4);
        idx.insert(entry(0x200, 8, Ring::User));
        idx.push_epoch_marker(4);

        // 0x100 sits behind both markers; 0x200 behind one.
        assert_eq!(idx.lru.entries_older_than_marker(2), vec![0x100]);
        let aged_one: Vec<_> = idx.lru.entries_older_than_marker(1);
        assert_eq!(aged_one, vec![0x200, 0x100]);

        idx.clear_epoch_markers();
        assert_eq!(idx.lru.marker_count(), 0);
    }

    #[test]
    fn test_size_accounting() {
        let mut idx = EntryIndex::new();
        idx.insert(entry(0x100, 100, Ring::User));
        idx.insert(entry(0x200, 50, Ring::User));
        assert_eq!(idx.size(), 150);
        assert_eq!(idx.dirty_size(), 0);

        idx.set_dirty(0x100, true);
        assert_eq!(idx.dirty_size(), 100);
        assert_eq!(idx.clean_size(), 50);
        assert!(idx.dirty_in_ring(Ring::User).contains(&0x100));

        idx.set_size(0x100, 200);
        assert_eq!(idx.size(), 250);
        assert_eq!(idx.dirty_size(), 200);

        idx.set_dirty(0x100, false);
        assert_eq!(idx.dirty_size(), 0);
        assert!(idx.dirty_in_ring(Ring::User).is_empty());

        let removed = idx.remove(0x100).unwrap();
        assert_eq!(removed.size, 200);
        assert_eq!(idx.size(), 50);
    }

    #[test]
    fn test_ring_transfer_keeps_dirty_sets() {
        let mut idx = EntryIndex::new();
        idx.insert(entry(0x100, 10, Ring::User));
        idx.set_dirty(0x100, true);
        idx.set_ring(0x100, Ring::MetaFreeSpace);
        assert!(idx.dirty_in_ring(Ring::User).is_empty());
        assert!(idx.dirty_in_ring(Ring::MetaFreeSpace).contains(&0x100));
    }

    #[test]
    fn test_pin_and_protect_leave_lru() {
        let mut idx = EntryIndex::new();
        idx.insert(entry(0x100, 10, Ring::User));
        assert!(idx.lru.contains(LruItem::Entry(0x100)));

        idx.get_mut(0x100).unwrap().flags.insert(EntryFlags::PINNED);
        idx.on_pin(0x100);
        assert!(!idx.lru.contains(LruItem::Entry(0x100)));
        assert!(idx.pinned().contains(&0x100));

        idx.get_mut(0x100).unwrap().flags.remove(EntryFlags::PINNED);
        idx.on_unpin(0x100);
        assert!(!idx.pinned().contains(&0x100));
        assert!(idx.lru.contains(LruItem::Entry(0x100)));
    }

    #[test]
    fn test_rekey_preserves_accounting() {
        let mut idx = EntryIndex::new();
        idx.insert(entry(0x100, 10, Ring::User));
        idx.set_dirty(0x100, true);
        idx.rekey(0x100, 0x900);
        assert!(!idx.contains(0x100));
        let entry = idx.get(0x900).unwrap();
        assert_eq!(entry.addr, 0x900);
        assert!(entry.is_dirty());
        assert!(idx.dirty_in_ring(Ring::User).contains(&0x900));
        assert_eq!(idx.size(), 10);
        assert_eq!(idx.stats.moves, 1);
    }
}
