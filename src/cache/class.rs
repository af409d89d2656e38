// Entry class registry.
//
// Every metadata kind the cache can hold is described by an `EntryClass`:
// how to size its first read, parse it, measure and produce its serialized
// image, and what lifecycle events it wants to hear about. The registry is
// fixed at cache creation; class ids index into it.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

// ============================================================================
// Payloads
// ============================================================================

/// The in-core representation of one cached entry. Classes downcast through
/// `as_any` to reach their concrete type.
pub trait EntryPayload: Debug + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ============================================================================
// Class descriptors
// ============================================================================

/// Index into the class registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u16);

bitflags::bitflags! {
    /// Behavior switches a class declares up front.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// The initial load size is a guess; the loader re-reads with the
        /// parsed image length when the guess was short.
        const SPECULATIVE_LOAD = 1 << 0;
        /// Entries count toward entry totals but serialize to zero bytes.
        const GHOST = 1 << 1;
        /// Entries never carry an on-disk image (purely in-core state).
        const NO_IMAGE = 1 << 2;
        /// Entries of this class may be flushed with the flush-me-last set.
        const FLUSH_LAST_ALLOWED = 1 << 3;
        /// Multiple concurrent read-only protects are allowed.
        const READ_ONLY_CONCURRENCY = 1 << 4;
        /// Clean children stay resident while a dependency parent is dirty.
        const STAY_RESIDENT_WITH_PARENT = 1 << 5;
        /// Class serializes a checksum and wants it verified on load.
        const HAS_CHECKSUM = 1 << 6;
    }
}

/// Lifecycle events delivered to `EntryClass::notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    InsertedIntoCache,
    Loaded,
    Flushed,
    Evicted,
    Dirtied,
    Cleaned,
    ChildDirtied,
    ChildCleaned,
    ChildUnserialized,
    ChildSerialized,
}

/// Outcome of `pre_serialize`: the entry may ask to move, change size, or
/// both before its image is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreSerializeAction {
    Unchanged,
    Move(Addr),
    Resize(usize),
    MoveAndResize(Addr, usize),
}

/// The per-kind vtable the cache invokes on entries.
pub trait EntryClass: Debug + Send + Sync {
    fn id(&self) -> ClassId;

    fn name(&self) -> &'static str;

    fn flags(&self) -> ClassFlags {
        ClassFlags::empty()
    }

    /// Bytes to read before the first parse. For speculative classes this
    /// may under-estimate; the loader retries with the real image length.
    fn load_size(&self, udata: &dyn Any) -> usize;

    /// Verify an on-disk image before parsing. Only consulted when
    /// HAS_CHECKSUM is set.
    fn verify_checksum(&self, image: &[u8], udata: &dyn Any) -> bool {
        let _ = (image, udata);
        true
    }

    fn deserialize(&self, image: &[u8], udata: &dyn Any) -> Result<Box<dyn EntryPayload>>;

    /// Size the payload would serialize to right now.
    fn image_len(&self, payload: &dyn EntryPayload) -> usize;

    fn pre_serialize(&self, payload: &mut dyn EntryPayload, addr: Addr) -> Result<PreSerializeAction> {
        let _ = (payload, addr);
        Ok(PreSerializeAction::Unchanged)
    }

    /// Produce the serialized image into `image`, whose length is the
    /// current `image_len`.
    fn serialize(&self, payload: &dyn EntryPayload, image: &mut [u8]) -> Result<()>;

    fn notify(&self, event: NotifyEvent, payload: &mut dyn EntryPayload) -> Result<()> {
        let _ = (event, payload);
        Ok(())
    }

    /// Release the in-core representation. The default drops it.
    fn free_icr(&self, payload: Box<dyn EntryPayload>) -> Result<()> {
        drop(payload);
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable table of entry classes, fixed at cache creation.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: Vec<Arc<dyn EntryClass>>,
}

impl ClassRegistry {
    pub fn new(classes: Vec<Arc<dyn EntryClass>>) -> Result<Self> {
        for (idx, class) in classes.iter().enumerate() {
            if class.id().0 as usize != idx {
                return Err(ErrorKind::InvalidArgument(format!(
                    "class {} registered at slot {} but declares id {}",
                    class.name(),
                    idx,
                    class.id().0
                ))
                .into());
            }
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, id: ClassId) -> Result<&Arc<dyn EntryClass>> {
        self.classes
            .get(id.0 as usize)
            .ok_or_else(|| ErrorKind::UnknownClass(id.0).into())
    }
}
