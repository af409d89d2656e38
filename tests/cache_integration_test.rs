// Metadata cache integration tests: entry lifecycle, eviction, flush
// ordering, auto-resize, multi-writer sync points, and the persisted
// cache image, driven end to end over real block drivers.

use coffer::cache::{
    AutoResizeConfig, CacheConfig, ClassFlags, ClassId, ClassRegistry, Coordinator,
    CoordinatorStrategy, EntryClass, EntryPayload, FlashMode, FlushMode, InsertFlags,
    LoopbackLink, MetadataCache, ProtectFlags, ResizeMode, UnprotectFlags,
};
use coffer::common::{Addr, Ring, Tag};
use coffer::context;
use coffer::error::{ErrorKind, Result};
use coffer::vfd::{
    BlockDriver, BlockIo, DriverFeatures, FileDriver, MemoryDriver, OpenConfig,
};
use std::any::Any;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

// ============================================================================
// Fixtures
// ============================================================================

type WriteLog = Arc<Mutex<Vec<(Addr, usize)>>>;

/// Memory driver that records every write the dispatcher issues.
#[derive(Debug)]
struct CountingDriver {
    inner: MemoryDriver,
    log: WriteLog,
}

impl BlockDriver for CountingDriver {
    fn query(&self) -> DriverFeatures {
        DriverFeatures::empty()
    }
    fn get_eoa(&self) -> Addr {
        self.inner.get_eoa()
    }
    fn set_eoa(&mut self, eoa: Addr) -> Result<()> {
        self.inner.set_eoa(eoa)
    }
    fn get_eof(&self) -> Result<Addr> {
        self.inner.get_eof()
    }
    fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.inner.read(addr, buf)
    }
    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.log.lock().unwrap().push((addr, data.len()));
        self.inner.write(addr, data)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
    fn truncate(&mut self) -> Result<()> {
        self.inner.truncate()
    }
    fn cmp(&self, other: &dyn BlockDriver) -> Option<Ordering> {
        other
            .as_any()
            .downcast_ref::<CountingDriver>()
            .and_then(|o| self.inner.cmp(&o.inner as &dyn BlockDriver))
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Blob {
    bytes: Vec<u8>,
}

impl EntryPayload for Blob {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
struct BlobClass {
    id: ClassId,
    flags: ClassFlags,
}

impl EntryClass for BlobClass {
    fn id(&self) -> ClassId {
        self.id
    }
    fn name(&self) -> &'static str {
        "blob"
    }
    fn flags(&self) -> ClassFlags {
        self.flags
    }
    fn load_size(&self, udata: &dyn Any) -> usize {
        *udata.downcast_ref::<usize>().unwrap_or(&0)
    }
    fn deserialize(&self, image: &[u8], _udata: &dyn Any) -> Result<Box<dyn EntryPayload>> {
        Ok(Box::new(Blob {
            bytes: image.to_vec(),
        }))
    }
    fn image_len(&self, payload: &dyn EntryPayload) -> usize {
        payload
            .as_any()
            .downcast_ref::<Blob>()
            .map(|b| b.bytes.len())
            .unwrap_or(0)
    }
    fn serialize(&self, payload: &dyn EntryPayload, image: &mut [u8]) -> Result<()> {
        let blob = payload.as_any().downcast_ref::<Blob>().unwrap();
        image.copy_from_slice(&blob.bytes);
        Ok(())
    }
}

const PLAIN: ClassId = ClassId(0);
const SHARED_RO: ClassId = ClassId(1);
const LAST_OK: ClassId = ClassId(2);

fn registry() -> ClassRegistry {
    ClassRegistry::new(vec![
        Arc::new(BlobClass {
            id: PLAIN,
            flags: ClassFlags::empty(),
        }) as Arc<dyn EntryClass>,
        Arc::new(BlobClass {
            id: SHARED_RO,
            flags: ClassFlags::READ_ONLY_CONCURRENCY,
        }),
        Arc::new(BlobClass {
            id: LAST_OK,
            flags: ClassFlags::FLUSH_LAST_ALLOWED,
        }),
    ])
    .unwrap()
}

fn new_cache(max_size: usize, min_clean_size: usize) -> (MetadataCache, WriteLog) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let driver = CountingDriver {
        inner: MemoryDriver::new(),
        log: log.clone(),
    };
    let config = CacheConfig {
        max_size,
        min_clean_size,
        ..CacheConfig::default()
    };
    let cache = MetadataCache::create(config, registry(), BlockIo::from_driver(Box::new(driver)))
        .unwrap();
    (cache, log)
}

fn blob(len: usize, fill: u8) -> Box<dyn EntryPayload> {
    Box::new(Blob {
        bytes: vec![fill; len],
    })
}

fn scoped_tag(tag: Tag) -> context::ContextScope {
    let scope = context::ContextScope::new();
    context::set_tag(tag);
    scope
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn protect_mutate_unprotect_round_trip() {
    let (mut cache, log) = new_cache(1024 * 1024, 512 * 1024);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x1000, PLAIN, blob(128, 0xaa), InsertFlags::empty()).unwrap();

    let cell = cache.protect(0x1000, PLAIN, &128usize, ProtectFlags::empty()).unwrap();
    {
        let mut guard = cell.write();
        let b = guard.as_any_mut().downcast_mut::<Blob>().unwrap();
        b.bytes[0] = 0x55;
    }
    cache.unprotect(0x1000, UnprotectFlags::DIRTIED).unwrap();
    assert!(cache.get_entry_status(0x1000).dirty);

    let hit_rate_before = cache.get_cache_hit_rate();
    cache.flush(FlushMode::Normal).unwrap();

    // Exactly one dispatcher write, at the entry's address and size.
    assert_eq!(log.lock().unwrap().as_slice(), &[(0x1000, 128)]);
    assert!(!cache.get_entry_status(0x1000).dirty);
    assert_eq!(cache.get_cache_hit_rate(), hit_rate_before);

    // The mutation made it to disk.
    let mut back = [0u8; 1];
    cache.io().read(0x1000, &mut back).unwrap();
    assert_eq!(back[0], 0x55);
}

#[test]
fn insert_rejects_duplicates_and_missing_tag() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    {
        let _scope = scoped_tag(Tag(0x10));
        cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap();
        let err = cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyExists(0x100)));
    }
    // No tag in context: sanity check refuses.
    let _scope = context::ContextScope::new();
    let err = cache.insert(0x200, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TagMismatch(_)));
}

#[test]
fn protect_exclusivity() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap();
    cache.insert(0x200, SHARED_RO, blob(16, 0), InsertFlags::empty()).unwrap();

    // A write protect excludes everything.
    let _cell = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::empty()).unwrap();
    let err = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::empty()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protected(0x100)));
    let err = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::READ_ONLY).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protected(0x100)));
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();

    // Read-only protects stack only when the class opts in.
    let _a = cache.protect(0x200, SHARED_RO, &16usize, ProtectFlags::READ_ONLY).unwrap();
    let _b = cache.protect(0x200, SHARED_RO, &16usize, ProtectFlags::READ_ONLY).unwrap();
    let err = cache.protect(0x200, SHARED_RO, &16usize, ProtectFlags::empty()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protected(0x200)));
    cache.unprotect(0x200, UnprotectFlags::empty()).unwrap();
    cache.unprotect(0x200, UnprotectFlags::empty()).unwrap();
    assert!(!cache.get_entry_status(0x200).protected);

    // Plain classes never stack read-only protects.
    let _c = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::READ_ONLY).unwrap();
    let err = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::READ_ONLY).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protected(0x100)));
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();
}

#[test]
fn size_invariant_checked_at_unprotect() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));
    cache.insert(0x100, PLAIN, blob(64, 0), InsertFlags::empty()).unwrap();

    // Growing the payload without resize_entry breaks the warranty.
    let cell = cache.protect(0x100, PLAIN, &64usize, ProtectFlags::empty()).unwrap();
    {
        let mut guard = cell.write();
        guard.as_any_mut().downcast_mut::<Blob>().unwrap().bytes.push(0);
    }
    let err = cache.unprotect(0x100, UnprotectFlags::DIRTIED).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::SizeMismatch { addr: 0x100, recorded: 64, actual: 65 }));
    assert!(err.is_fatal());

    // With resize_entry the same mutation is legal.
    cache.resize_entry(0x100, 65).unwrap();
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();
    assert_eq!(cache.get_entry_status(0x100).size, 65);
}

#[test]
fn delete_on_unprotect_discards_without_write() {
    let (mut cache, log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));
    cache.insert(0x100, PLAIN, blob(64, 0), InsertFlags::DIRTY).unwrap();

    let _cell = cache.protect(0x100, PLAIN, &64usize, ProtectFlags::empty()).unwrap();
    cache.unprotect(0x100, UnprotectFlags::DELETED).unwrap();
    assert!(!cache.get_entry_status(0x100).resident);

    cache.flush(FlushMode::Normal).unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn pin_during_protect_takes_effect_at_unprotect() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));
    cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap();

    let _cell = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::empty()).unwrap();
    cache.pin(0x100).unwrap();
    assert!(!cache.get_entry_status(0x100).pinned);
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();
    assert!(cache.get_entry_status(0x100).pinned);

    // Pinned entries accept marks without a protect.
    cache.mark_dirty(0x100).unwrap();
    assert!(cache.get_entry_status(0x100).dirty);
    cache.unpin(0x100).unwrap();
    assert!(!cache.get_entry_status(0x100).pinned);
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn eviction_on_overflow_follows_lru_order() {
    let (mut cache, _log) = new_cache(1024, 512);
    let _scope = scoped_tag(Tag(0x10));

    let addrs: Vec<Addr> = (0..12).map(|i| i * 0x80).collect();
    for (i, &addr) in addrs.iter().enumerate() {
        cache.insert(addr, PLAIN, blob(128, i as u8), InsertFlags::empty()).unwrap();
        let info = cache.get_cache_size();
        assert!(info.in_use <= 1024, "resident {} exceeds ceiling", info.in_use);

        // Eviction victims are always the oldest inserts: the resident
        // set is a suffix of the insertion order.
        let resident: Vec<bool> = addrs
            .iter()
            .map(|a| cache.get_entry_status(*a).resident)
            .collect();
        let first_resident = resident.iter().position(|r| *r).unwrap();
        assert!(resident[first_resident..=i].iter().all(|r| *r));
    }

    // 8 entries of 128 bytes fit exactly; the first 4 were evicted, clean.
    assert_eq!(cache.get_cache_size().entry_count, 8);
    assert_eq!(cache.stats().evictions, 4);
    for &addr in &addrs[..4] {
        assert!(!cache.get_entry_status(addr).resident);
    }
    for &addr in &addrs[4..] {
        assert!(!cache.get_entry_status(addr).dirty);
        assert!(cache.get_entry_status(addr).resident);
    }
}

#[test]
fn pinned_and_corked_entries_survive_pressure() {
    let (mut cache, _log) = new_cache(1024, 0);

    {
        let _scope = scoped_tag(Tag(0x10));
        cache.insert(0x0, PLAIN, blob(256, 0), InsertFlags::PINNED).unwrap();
    }
    {
        let _scope = scoped_tag(Tag(0x20));
        cache.insert(0x100, PLAIN, blob(256, 0), InsertFlags::empty()).unwrap();
        cache.cork(Tag(0x20));
        assert!(cache.is_corked(Tag(0x20)));
    }
    let _scope = scoped_tag(Tag(0x30));
    for i in 0..8 {
        cache.insert(0x1000 + i * 0x100, PLAIN, blob(256, 0), InsertFlags::empty()).unwrap();
    }

    assert!(cache.get_entry_status(0x0).resident);
    assert!(cache.get_entry_status(0x100).resident);

    cache.uncork(Tag(0x20));
    assert!(!cache.is_corked(Tag(0x20)));
}

// ============================================================================
// Flush ordering
// ============================================================================

#[test]
fn dependency_parent_writes_before_child() {
    let (mut cache, log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));

    // Child at the lower address so address order alone would lose.
    cache.insert(0x100, PLAIN, blob(32, 1), InsertFlags::DIRTY).unwrap(); // child
    cache.insert(0x900, PLAIN, blob(32, 2), InsertFlags::DIRTY).unwrap(); // parent
    cache.create_flush_dependency(0x900, 0x100).unwrap();

    cache.flush(FlushMode::Normal).unwrap();
    let writes: Vec<Addr> = log.lock().unwrap().iter().map(|(a, _)| *a).collect();
    let parent_pos = writes.iter().position(|a| *a == 0x900).unwrap();
    let child_pos = writes.iter().position(|a| *a == 0x100).unwrap();
    assert!(parent_pos < child_pos, "parent must be written before child");
}

#[test]
fn dependency_cycles_rejected() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));
    for addr in [0x100u64, 0x200, 0x300] {
        cache.insert(addr, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap();
    }
    cache.create_flush_dependency(0x100, 0x200).unwrap();
    cache.create_flush_dependency(0x200, 0x300).unwrap();

    let err = cache.create_flush_dependency(0x300, 0x100).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DependencyCycle { parent: 0x300, child: 0x100 }));
    assert!(err.is_fatal());
    let err = cache.create_flush_dependency(0x100, 0x100).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DependencyCycle { .. }));

    // Destroying an edge reopens the path.
    cache.destroy_flush_dependency(0x100, 0x200).unwrap();
    cache.create_flush_dependency(0x300, 0x100).unwrap();
}

#[test]
fn rings_flush_in_order() {
    let (mut cache, log) = new_cache(1024 * 1024, 0);

    // Superblock entry inserted first; ring order must still put it last.
    {
        let scope = scoped_tag(Tag::SUPERBLOCK);
        context::set_ring(Ring::Superblock);
        cache.insert(0x900, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
        drop(scope);
    }
    {
        let scope = scoped_tag(Tag(0x10));
        context::set_ring(Ring::User);
        cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
        drop(scope);
    }
    {
        let scope = scoped_tag(Tag::FREE_SPACE);
        context::set_ring(Ring::MetaFreeSpace);
        cache.insert(0x500, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
        drop(scope);
    }

    cache.flush(FlushMode::Normal).unwrap();
    let writes: Vec<Addr> = log.lock().unwrap().iter().map(|(a, _)| *a).collect();
    assert_eq!(writes, vec![0x100, 0x500, 0x900]);
}

#[test]
fn flush_me_last_defers_within_ring() {
    let (mut cache, log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x100, LAST_OK, blob(16, 0), InsertFlags::DIRTY | InsertFlags::FLUSH_ME_LAST).unwrap();
    cache.insert(0x200, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    cache.insert(0x300, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();

    // Only classes that opt in may carry the flag.
    let err = cache
        .insert(0x400, PLAIN, blob(16, 0), InsertFlags::DIRTY | InsertFlags::FLUSH_ME_LAST)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidFlags(_)));

    cache.flush(FlushMode::Normal).unwrap();
    let writes: Vec<Addr> = log.lock().unwrap().iter().map(|(a, _)| *a).collect();
    assert_eq!(*writes.last().unwrap(), 0x100);
}

#[test]
fn protected_entries_skip_flush_and_fail_destroy() {
    let (mut cache, log) = new_cache(1024 * 1024, 0);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    let _cell = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::empty()).unwrap();
    cache.mark_dirty(0x100).unwrap();

    cache.flush(FlushMode::Normal).unwrap();
    assert!(log.lock().unwrap().is_empty());
    assert!(cache.get_entry_status(0x100).dirty);

    let err = cache.flush(FlushMode::Invalidate).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));
    // Still consistent: the entry survives, unprotect + flush drains it.
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();
    cache.flush(FlushMode::Normal).unwrap();
    assert!(!cache.get_entry_status(0x100).dirty);
}

// ============================================================================
// Tagged operations
// ============================================================================

#[test]
fn tagged_flush_evict_and_retag() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);

    {
        let _scope = scoped_tag(Tag(0xA));
        cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
        cache.insert(0x200, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    }
    {
        let _scope = scoped_tag(Tag(0xB));
        cache.insert(0x300, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    }

    cache.flush_tagged(Tag(0xA)).unwrap();
    assert!(!cache.get_entry_status(0x100).dirty);
    assert!(!cache.get_entry_status(0x200).dirty);
    assert!(cache.get_entry_status(0x300).dirty);

    let evicted = cache.evict_tagged(Tag(0xA)).unwrap();
    assert_eq!(evicted, 2);
    assert!(!cache.get_entry_status(0x100).resident);
    assert!(cache.get_entry_status(0x300).resident);

    // Deep-copy rebranding.
    {
        let _scope = scoped_tag(Tag::COPIED);
        cache.insert(0x400, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    }
    let moved = cache.retag_copied(Tag::COPIED, Tag(0xB)).unwrap();
    assert_eq!(moved, 1);
    assert_eq!(cache.expunge_tag_type(Tag(0xB), PLAIN).unwrap(), 2);
    assert!(!cache.get_entry_status(0x300).resident);
    assert!(!cache.get_entry_status(0x400).resident);
}

// ============================================================================
// Auto-resize
// ============================================================================

#[test]
fn flash_increment_on_large_insert() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    cache
        .set_auto_resize_config(AutoResizeConfig {
            set_initial_size: true,
            initial_size: 1024 * 1024,
            min_size: 1024,
            max_size: 16 * 1024 * 1024,
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::Off,
            flash_incr_mode: FlashMode::AddSpace,
            flash_threshold: 0.5,
            flash_multiple: 2.0,
            ..AutoResizeConfig::default()
        })
        .unwrap();

    let _scope = scoped_tag(Tag(0x10));
    cache.insert(0x1000, PLAIN, blob(600 * 1024, 0), InsertFlags::empty()).unwrap();

    // 600 KiB crosses 0.5 * 1 MiB; ceiling grows by 2 * 600 KiB at once.
    let info = cache.get_cache_size();
    assert!(info.max_size >= 1024 * 1024 + 2 * 600 * 1024);
}

#[test]
fn epoch_decrement_shrinks_ceiling() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    cache
        .set_auto_resize_config(AutoResizeConfig {
            set_initial_size: true,
            initial_size: 1024 * 1024,
            min_size: 1024,
            max_size: 16 * 1024 * 1024,
            epoch_length: 100,
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::Threshold,
            upper_hr_threshold: 0.9,
            decrement: 0.5,
            apply_max_decrement: false,
            flash_incr_mode: FlashMode::Off,
            ..AutoResizeConfig::default()
        })
        .unwrap();

    let _scope = scoped_tag(Tag(0x10));
    cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::empty()).unwrap();

    let before = cache.get_cache_size().max_size;
    for _ in 0..100 {
        let _cell = cache.protect(0x100, PLAIN, &16usize, ProtectFlags::empty()).unwrap();
        cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();
        // The ceiling holds mid-epoch and halves only at the boundary.
        assert!(cache.get_cache_size().max_size <= before);
    }
    assert_eq!(cache.get_cache_size().max_size, before / 2);
}

#[test]
fn eviction_disable_rejected_while_resizing() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    cache
        .set_auto_resize_config(AutoResizeConfig {
            set_initial_size: true,
            initial_size: 1024 * 1024,
            min_size: 1024,
            max_size: 16 * 1024 * 1024,
            incr_mode: ResizeMode::Threshold,
            decr_mode: ResizeMode::Off,
            flash_incr_mode: FlashMode::Off,
            ..AutoResizeConfig::default()
        })
        .unwrap();

    let err = cache.set_evictions_enabled(false).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));

    cache
        .set_auto_resize_config(AutoResizeConfig {
            set_initial_size: true,
            initial_size: 1024 * 1024,
            min_size: 1024,
            max_size: 16 * 1024 * 1024,
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::Off,
            flash_incr_mode: FlashMode::Off,
            ..AutoResizeConfig::default()
        })
        .unwrap();
    cache.set_evictions_enabled(false).unwrap();
}

// ============================================================================
// Rings at shutdown
// ============================================================================

#[test]
fn settled_ring_rules_at_shutdown() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);

    // Outside shutdown: touching a settled ring silently unsettles it.
    cache.settle_ring(Ring::User);
    assert!(cache.is_ring_settled(Ring::User));
    cache.unsettle_ring(Ring::User).unwrap();
    cache.settle_ring(Ring::User);
    {
        let _scope = scoped_tag(Tag(0x10));
        cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap();
    }
    assert!(!cache.is_ring_settled(Ring::User));

    // After close every ring is settled and the shutdown flag is set:
    // any further mutation is a fatal ring violation.
    cache.close().unwrap();
    let _scope = scoped_tag(Tag(0x10));
    let err = cache.insert(0x200, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RingSettled(_)));
    assert!(err.is_fatal());
    let err = cache.unsettle_ring(Ring::User).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RingSettled(_)));
}

// ============================================================================
// Multi-writer
// ============================================================================

fn coordinated_cache(threshold: usize) -> (MetadataCache, WriteLog) {
    let (mut cache, log) = new_cache(1024 * 1024, 0);
    cache.set_coordinator(Coordinator::new(
        CoordinatorStrategy::Rank0Only,
        Box::new(LoopbackLink::default()),
        threshold,
    ));
    (cache, log)
}

#[test]
fn sync_point_flushes_and_resets_dirty_bytes() {
    let (mut cache, log) = coordinated_cache(64);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x100, PLAIN, blob(64, 0), InsertFlags::DIRTY).unwrap();

    // 64 dirty bytes reached the threshold: the insert itself ran a sync
    // point, flushing the candidate and resetting the ledger.
    let coord = cache.coordinator().unwrap();
    assert_eq!(coord.sync_points(), 1);
    assert_eq!(coord.dirty_bytes(), 0);
    assert!(!cache.get_entry_status(0x100).dirty);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn multiwriter_resize_accrues_initial_size() {
    // Pins the long-standing accounting quirk: a resize charges the
    // entry's size before the resize, not after.
    let (mut cache, _log) = coordinated_cache(1 << 20);
    let _scope = scoped_tag(Tag(0x10));

    cache.insert(0x100, PLAIN, blob(100, 0), InsertFlags::empty()).unwrap();
    let cell = cache.protect(0x100, PLAIN, &100usize, ProtectFlags::empty()).unwrap();
    {
        let mut guard = cell.write();
        guard.as_any_mut().downcast_mut::<Blob>().unwrap().bytes = vec![0; 900];
    }
    cache.resize_entry(0x100, 900).unwrap();
    cache.unprotect(0x100, UnprotectFlags::empty()).unwrap();

    assert_eq!(cache.coordinator().unwrap().dirty_bytes(), 100);
}

#[test]
fn read_only_rank_cannot_insert() {
    #[derive(Debug)]
    struct FollowerLink;
    impl coffer::cache::CohortLink for FollowerLink {
        fn rank(&self) -> u32 {
            1
        }
        fn cohort_size(&self) -> u32 {
            2
        }
        fn broadcast_cleaned(&mut self, _addrs: &[Addr]) -> Result<()> {
            Ok(())
        }
        fn collect_cleaned(&mut self) -> Result<Vec<Addr>> {
            Ok(Vec::new())
        }
        fn exchange_candidates(&mut self, local: &[Addr]) -> Result<Vec<Addr>> {
            Ok(local.to_vec())
        }
        fn barrier(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    cache.set_coordinator(Coordinator::new(
        CoordinatorStrategy::Rank0Only,
        Box::new(FollowerLink),
        1 << 20,
    ));

    let _scope = scoped_tag(Tag(0x10));
    let err = cache.insert(0x100, PLAIN, blob(16, 0), InsertFlags::DIRTY).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ReadOnly));
}

// ============================================================================
// Cache image
// ============================================================================

#[test]
fn cache_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("imaged.cf");
    let image_addr: Addr = 0x10000;

    let image_len = {
        let driver = FileDriver::open(&OpenConfig::path(&path)).unwrap();
        let config = CacheConfig {
            image_addr,
            ..CacheConfig::default()
        };
        let mut cache =
            MetadataCache::create(config, registry(), BlockIo::from_driver(Box::new(driver)))
                .unwrap();
        let _scope = scoped_tag(Tag(0x10));
        cache.insert(0x100, PLAIN, blob(32, 0x11), InsertFlags::DIRTY).unwrap();
        cache.insert(0x200, PLAIN, blob(48, 0x22), InsertFlags::DIRTY).unwrap();
        cache.create_flush_dependency(0x100, 0x200).unwrap();
        cache.close().unwrap();
        cache.image_location().1
    };
    assert!(image_len > 0);

    let driver = FileDriver::open(&OpenConfig::path(&path)).unwrap();
    let config = CacheConfig {
        image_addr,
        image_len,
        ..CacheConfig::default()
    };
    let mut cache =
        MetadataCache::create(config, registry(), BlockIo::from_driver(Box::new(driver))).unwrap();

    // The first protect decodes the image: both entries come back
    // resident with their dependency edge, and the protect is a hit.
    let _scope = scoped_tag(Tag(0x10));
    let cell = cache.protect(0x200, PLAIN, &48usize, ProtectFlags::READ_ONLY).unwrap();
    {
        let guard = cell.read();
        let b = guard.as_any().downcast_ref::<Blob>().unwrap();
        assert_eq!(b.bytes, vec![0x22; 48]);
    }
    cache.unprotect(0x200, UnprotectFlags::empty()).unwrap();

    let status = cache.get_entry_status(0x100);
    assert!(status.resident);
    assert_eq!(status.dep_child_count, 1);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 0);
}

// ============================================================================
// Load path
// ============================================================================

/// Length-prefixed blob whose first read is a fixed guess; the real length
/// sits in the prefix.
#[derive(Debug)]
struct PrefixedBlob {
    total: usize,
    data: Vec<u8>,
}

impl EntryPayload for PrefixedBlob {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
struct SpeculativeClass;

impl EntryClass for SpeculativeClass {
    fn id(&self) -> ClassId {
        ClassId(0)
    }
    fn name(&self) -> &'static str {
        "prefixed"
    }
    fn flags(&self) -> ClassFlags {
        ClassFlags::SPECULATIVE_LOAD
    }
    fn load_size(&self, _udata: &dyn Any) -> usize {
        8
    }
    fn deserialize(&self, image: &[u8], _udata: &dyn Any) -> Result<Box<dyn EntryPayload>> {
        let total = u32::from_le_bytes(image[0..4].try_into().unwrap()) as usize;
        Ok(Box::new(PrefixedBlob {
            total,
            data: image[4..].to_vec(),
        }))
    }
    fn image_len(&self, payload: &dyn EntryPayload) -> usize {
        payload.as_any().downcast_ref::<PrefixedBlob>().unwrap().total
    }
    fn serialize(&self, payload: &dyn EntryPayload, image: &mut [u8]) -> Result<()> {
        let blob = payload.as_any().downcast_ref::<PrefixedBlob>().unwrap();
        image[0..4].copy_from_slice(&(blob.total as u32).to_le_bytes());
        image[4..].copy_from_slice(&blob.data);
        Ok(())
    }
}

#[test]
fn speculative_load_rereads_with_parsed_length() {
    let registry =
        ClassRegistry::new(vec![Arc::new(SpeculativeClass) as Arc<dyn EntryClass>]).unwrap();
    let mut cache = MetadataCache::create(
        CacheConfig::default(),
        registry,
        BlockIo::from_driver(Box::new(MemoryDriver::new())),
    )
    .unwrap();

    // A 64-byte image: the 8-byte guess under-reads, the loader re-reads.
    let mut image = vec![0u8; 64];
    image[0..4].copy_from_slice(&64u32.to_le_bytes());
    image[63] = 0x7e;
    cache.io().write(0x500, &image).unwrap();

    let _scope = scoped_tag(Tag(0x10));
    let cell = cache.protect(0x500, ClassId(0), &(), ProtectFlags::READ_ONLY).unwrap();
    {
        let guard = cell.read();
        let blob = guard.as_any().downcast_ref::<PrefixedBlob>().unwrap();
        assert_eq!(blob.total, 64);
        assert_eq!(blob.data.len(), 60);
        assert_eq!(*blob.data.last().unwrap(), 0x7e);
    }
    cache.unprotect(0x500, UnprotectFlags::empty()).unwrap();
    assert_eq!(cache.get_entry_status(0x500).size, 64);
}

/// Blob whose last byte is the XOR of all preceding bytes.
#[derive(Debug)]
struct XorClass;

impl EntryClass for XorClass {
    fn id(&self) -> ClassId {
        ClassId(0)
    }
    fn name(&self) -> &'static str {
        "xor-checked"
    }
    fn flags(&self) -> ClassFlags {
        ClassFlags::HAS_CHECKSUM
    }
    fn load_size(&self, udata: &dyn Any) -> usize {
        *udata.downcast_ref::<usize>().unwrap_or(&0)
    }
    fn verify_checksum(&self, image: &[u8], _udata: &dyn Any) -> bool {
        let (body, check) = image.split_at(image.len() - 1);
        body.iter().fold(0u8, |acc, b| acc ^ b) == check[0]
    }
    fn deserialize(&self, image: &[u8], _udata: &dyn Any) -> Result<Box<dyn EntryPayload>> {
        Ok(Box::new(Blob {
            bytes: image.to_vec(),
        }))
    }
    fn image_len(&self, payload: &dyn EntryPayload) -> usize {
        payload.as_any().downcast_ref::<Blob>().unwrap().bytes.len()
    }
    fn serialize(&self, payload: &dyn EntryPayload, image: &mut [u8]) -> Result<()> {
        image.copy_from_slice(&payload.as_any().downcast_ref::<Blob>().unwrap().bytes);
        Ok(())
    }
}

#[test]
fn corrupt_image_rejected_unless_error_detection_off() {
    let registry = ClassRegistry::new(vec![Arc::new(XorClass) as Arc<dyn EntryClass>]).unwrap();
    let mut cache = MetadataCache::create(
        CacheConfig::default(),
        registry,
        BlockIo::from_driver(Box::new(MemoryDriver::new())),
    )
    .unwrap();

    let mut image = vec![0x11u8, 0x22, 0x33, 0x44, 0];
    let check = image[..4].iter().fold(0u8, |acc, b| acc ^ b);
    *image.last_mut().unwrap() = check ^ 0xff; // corrupt
    cache.io().write(0x600, &image).unwrap();

    let _scope = scoped_tag(Tag(0x10));
    let err = cache.protect(0x600, ClassId(0), &5usize, ProtectFlags::READ_ONLY).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Corruption(_)));
    assert!(!cache.get_entry_status(0x600).resident);

    // With error detection suppressed in the request context, the same
    // bytes load.
    context::set_error_detection(false);
    let _cell = cache.protect(0x600, ClassId(0), &5usize, ProtectFlags::READ_ONLY).unwrap();
    cache.unprotect(0x600, UnprotectFlags::empty()).unwrap();
}

#[test]
fn protect_loads_absent_entries_from_disk() {
    let (mut cache, _log) = new_cache(1024 * 1024, 0);
    cache.io().write(0x700, &[0x5a; 24]).unwrap();

    let _scope = scoped_tag(Tag(0x10));
    let cell = cache.protect(0x700, PLAIN, &24usize, ProtectFlags::READ_ONLY).unwrap();
    {
        let guard = cell.read();
        assert_eq!(guard.as_any().downcast_ref::<Blob>().unwrap().bytes, vec![0x5a; 24]);
    }
    cache.unprotect(0x700, UnprotectFlags::empty()).unwrap();

    assert_eq!(cache.stats().misses, 1);
    assert!(cache.get_entry_status(0x700).resident);
    assert!(!cache.get_entry_status(0x700).dirty);
}
