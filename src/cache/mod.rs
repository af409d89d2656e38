// # Metadata Cache
//
// The per-container in-memory store for on-disk metadata. Every metadata
// read or mutation in a coffer container flows through one `MetadataCache`:
//
// - **Entry lifecycle**: `insert`, `protect`/`unprotect`, `pin`/`unpin`,
//   dirty/serialization marks, `resize_entry`, `move_entry`, expunge and
//   remove (`engine`)
// - **Entry classes**: the immutable vtable registry describing each
//   metadata kind (`class`)
// - **Index & replacement**: hash index, address-ordered index, LRU with
//   age-out epoch markers, pinned set (`index`)
// - **Tags & corking**: grouping entries by owning object (`tags`)
// - **Flush ordering**: ring-major, dependency-aware write-back (`flush`)
// - **Auto-resize**: epoch hit-rate control plus flash increments
//   (`resize`)
// - **Multi-writer coordination**: dirty-byte sync points over a cohort
//   link (`coordinator`)
// - **Cache image**: optional persisted snapshot of the working set
//   (`image`)

pub mod class;
pub mod coordinator;
pub mod engine;
pub mod entry;
pub mod flush;
pub mod image;
pub mod index;
pub mod resize;
pub mod tags;

pub use class::{
    ClassFlags, ClassId, ClassRegistry, EntryClass, EntryPayload, NotifyEvent, PreSerializeAction,
};
pub use coordinator::{CohortLink, Coordinator, CoordinatorStrategy, LoopbackLink};
pub use engine::{
    CacheConfig, CacheSizeInfo, InsertFlags, MetadataCache, ProtectFlags, UnprotectFlags,
};
pub use entry::{EntryFlags, EntryStatus, PayloadCell};
pub use flush::FlushMode;
pub use index::CacheStats;
pub use resize::{AutoResizeConfig, FlashMode, ResizeMode};
