// Free-space manager header.
//
// The fixed-size persisted record for one free-space manager: aggregate
// statistics plus the location and allocated size of the variable-size
// section-info block.

use crate::common::{Addr, ADDR_UNDEF};
use crate::error::{ErrorKind, Result};
use crate::freespace::bins::SectionTotals;

const HEADER_MAGIC: &[u8; 4] = b"CFSH";
const HEADER_VERSION: u8 = 1;

/// Encoded size of a header block on disk.
pub const HEADER_ENCODED_SIZE: usize = 4 + 1 + 2 + 8 * 5 + 8 + 8 + 8 + 1 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceHeader {
    pub version: u8,
    /// Number of section classes this manager was created with.
    pub class_count: u16,
    pub total_space: u64,
    pub section_count: u64,
    pub serializable_count: u64,
    pub ghost_count: u64,
    pub max_section_size: u64,
    /// Where the section-info block lives, or `ADDR_UNDEF` while floating.
    pub sinfo_addr: Addr,
    /// Bytes allocated on disk for the section info. Never shrinks across
    /// a close; see the serialization rules in `sinfo`.
    pub alloc_sinfo_size: u64,
    /// Bytes the current section info actually serializes to.
    pub sinfo_size: u64,
    /// Bytes used to encode a section offset.
    pub sect_off_size: u8,
    /// Bytes used to encode a section length.
    pub sect_len_size: u8,
}

impl FreeSpaceHeader {
    pub fn new(class_count: u16) -> Self {
        Self {
            version: HEADER_VERSION,
            class_count,
            total_space: 0,
            section_count: 0,
            serializable_count: 0,
            ghost_count: 0,
            max_section_size: 0,
            sinfo_addr: ADDR_UNDEF,
            alloc_sinfo_size: 0,
            sinfo_size: 0,
            sect_off_size: 8,
            sect_len_size: 8,
        }
    }

    pub fn sync_totals(&mut self, totals: SectionTotals) {
        self.total_space = totals.total_space;
        self.section_count = totals.section_count;
        self.serializable_count = totals.serializable_count;
        self.ghost_count = totals.ghost_count;
        self.max_section_size = totals.max_section_size;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_ENCODED_SIZE);
        out.extend_from_slice(HEADER_MAGIC);
        out.push(self.version);
        out.extend_from_slice(&self.class_count.to_le_bytes());
        out.extend_from_slice(&self.total_space.to_le_bytes());
        out.extend_from_slice(&self.section_count.to_le_bytes());
        out.extend_from_slice(&self.serializable_count.to_le_bytes());
        out.extend_from_slice(&self.ghost_count.to_le_bytes());
        out.extend_from_slice(&self.max_section_size.to_le_bytes());
        out.extend_from_slice(&self.sinfo_addr.to_le_bytes());
        out.extend_from_slice(&self.alloc_sinfo_size.to_le_bytes());
        out.extend_from_slice(&self.sinfo_size.to_le_bytes());
        out.push(self.sect_off_size);
        out.push(self.sect_len_size);
        let checksum = crc32c::crc32c(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        debug_assert_eq!(out.len(), HEADER_ENCODED_SIZE);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_ENCODED_SIZE {
            return Err(ErrorKind::Corruption("free-space header truncated".into()).into());
        }
        let (body, rest) = buf.split_at(HEADER_ENCODED_SIZE - 4);
        let stored = u32::from_le_bytes(rest[..4].try_into().unwrap());
        if crc32c::crc32c(body) != stored {
            return Err(
                ErrorKind::Corruption("free-space header checksum mismatch".into()).into(),
            );
        }
        if &body[0..4] != HEADER_MAGIC {
            return Err(ErrorKind::Corruption("bad free-space header magic".into()).into());
        }
        let version = body[4];
        if version != HEADER_VERSION {
            return Err(ErrorKind::Corruption(format!(
                "unsupported free-space header version {version}"
            ))
            .into());
        }
        let u64_at = |off: usize| u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        Ok(Self {
            version,
            class_count: u16::from_le_bytes(body[5..7].try_into().unwrap()),
            total_space: u64_at(7),
            section_count: u64_at(15),
            serializable_count: u64_at(23),
            ghost_count: u64_at(31),
            max_section_size: u64_at(39),
            sinfo_addr: u64_at(47),
            alloc_sinfo_size: u64_at(55),
            sinfo_size: u64_at(63),
            sect_off_size: body[71],
            sect_len_size: body[72],
        })
    }
}
