// # Common Types
//
// Shared identifiers and constants used across all coffer modules: file
// addresses, logical-object tags, and flush rings.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Addresses
// ============================================================================

/// A byte offset within a container file.
pub type Addr = u64;

/// Sentinel for "no address" / "not yet allocated".
pub const ADDR_UNDEF: Addr = u64::MAX;

/// Returns true when `addr` names a real file location.
#[inline]
pub fn addr_defined(addr: Addr) -> bool {
    addr != ADDR_UNDEF
}

// ============================================================================
// Tags
// ============================================================================

/// The address of the logical object (group, dataset, ...) a metadata entry
/// belongs to. Internal entries carry one of the reserved sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub Addr);

impl Tag {
    /// No tag assigned; rejected by the sanity check for regular entries.
    pub const INVALID: Tag = Tag(ADDR_UNDEF);
    /// The container superblock and its extension messages.
    pub const SUPERBLOCK: Tag = Tag(ADDR_UNDEF - 1);
    /// Free-space manager metadata.
    pub const FREE_SPACE: Tag = Tag(ADDR_UNDEF - 2);
    /// Global-heap copies shared between objects.
    pub const GLOBAL_HEAP: Tag = Tag(ADDR_UNDEF - 3);
    /// Temporary tag applied during a deep object copy, rebranded by
    /// `retag_copied` once the destination object has an address.
    pub const COPIED: Tag = Tag(ADDR_UNDEF - 4);

    /// True for the reserved sentinels that mark cache-internal entries.
    #[inline]
    pub fn is_internal(self) -> bool {
        self.0 > ADDR_UNDEF - 5
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::INVALID => write!(f, "tag:invalid"),
            Tag::SUPERBLOCK => write!(f, "tag:superblock"),
            Tag::FREE_SPACE => write!(f, "tag:free-space"),
            Tag::GLOBAL_HEAP => write!(f, "tag:global-heap"),
            Tag::COPIED => write!(f, "tag:copied"),
            Tag(addr) => write!(f, "tag:{:#x}", addr),
        }
    }
}

// ============================================================================
// Rings
// ============================================================================

/// Flush-ordering domains. All dirty entries in ring *r* reach disk before
/// any entry in ring *r+1* is written; the superblock goes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ring {
    /// Ordinary object metadata.
    User = 0,
    /// Free-space managers tracking raw-data space.
    RawFreeSpace = 1,
    /// Free-space managers tracking metadata space.
    MetaFreeSpace = 2,
    /// Superblock extension messages.
    SuperblockExt = 3,
    /// The superblock itself.
    Superblock = 4,
}

impl Ring {
    pub const COUNT: usize = 5;

    /// All rings in flush order.
    pub const ALL: [Ring; Ring::COUNT] = [
        Ring::User,
        Ring::RawFreeSpace,
        Ring::MetaFreeSpace,
        Ring::SuperblockExt,
        Ring::Superblock,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Ring::User => "user",
            Ring::RawFreeSpace => "raw-free-space",
            Ring::MetaFreeSpace => "meta-free-space",
            Ring::SuperblockExt => "superblock-ext",
            Ring::Superblock => "superblock",
        }
    }

    pub fn from_index(idx: usize) -> Option<Ring> {
        Ring::ALL.get(idx).copied()
    }
}

impl Default for Ring {
    fn default() -> Self {
        Ring::User
    }
}
