// Section-info serialization and lock protocol.
//
// The section-info block is the variable-size persisted form of every
// serializable section a free-space manager tracks: a prefix, one record
// per distinct section size (size, count, address deltas, class bytes),
// and a checksum trailer. Ghost sections contribute to counts only and are
// never encoded.
//
// The block is a shared resource between the header and the cache; the
// nested reference-count lock here arbitrates access. Acquiring read-write
// while read-only is held upgrades the mode in place.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use crate::freespace::bins::SectionBins;
use crate::freespace::section::{
    SectClassId, Section, SectionClassFlags, SectionClassRegistry,
};
use std::collections::BTreeMap;

const SINFO_MAGIC: &[u8; 4] = b"CFSI";
const SINFO_VERSION: u8 = 1;

// ============================================================================
// Size computation
// ============================================================================

/// Bytes the current section set would serialize to. Must agree exactly
/// with `encode`.
pub fn serialized_size(bins: &SectionBins, classes: &SectionClassRegistry) -> Result<u64> {
    let mut size = (4 + 1 + 4) as u64; // magic, version, record count
    let mut size_records: BTreeMap<u64, u64> = BTreeMap::new();
    for sect in bins.iter() {
        let class = classes.get(sect.class)?;
        if class.flags().contains(SectionClassFlags::GHOST) {
            continue;
        }
        *size_records.entry(sect.size).or_default() += 1;
        size += 8 + 2 + class.serialized_extra() as u64; // delta, class id, class bytes
    }
    size += size_records.len() as u64 * (8 + 4); // size, count per record
    size += 4; // checksum
    Ok(size)
}

// ============================================================================
// Encode / decode
// ============================================================================

pub fn encode(bins: &SectionBins, classes: &SectionClassRegistry) -> Result<Vec<u8>> {
    // Group serializable sections by size, address-ordered within a size.
    let mut by_size: BTreeMap<u64, Vec<&Section>> = BTreeMap::new();
    for sect in bins.iter() {
        let class = classes.get(sect.class)?;
        if class.flags().contains(SectionClassFlags::GHOST) {
            continue;
        }
        by_size.entry(sect.size).or_default().push(sect);
    }

    let mut out = Vec::new();
    out.extend_from_slice(SINFO_MAGIC);
    out.push(SINFO_VERSION);
    out.extend_from_slice(&(by_size.len() as u32).to_le_bytes());

    for (size, sections) in &by_size {
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
        let mut prev: Addr = 0;
        for sect in sections {
            let delta = sect.addr.wrapping_sub(prev);
            out.extend_from_slice(&delta.to_le_bytes());
            out.extend_from_slice(&sect.class.0.to_le_bytes());
            let extra = classes.get(sect.class)?.serialized_extra();
            out.extend(std::iter::repeat(0u8).take(extra));
            prev = sect.addr;
        }
    }
    let checksum = crc32c::crc32c(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Decode an encoded block. The encoding is self-delimiting, so trailing
/// padding (left by the avoid-shrink rule) is ignored.
pub fn decode(buf: &[u8], classes: &SectionClassRegistry) -> Result<Vec<Section>> {
    if buf.len() < 13 {
        return Err(ErrorKind::Corruption("section info truncated".into()).into());
    }
    let body = buf;
    if &body[0..4] != SINFO_MAGIC {
        return Err(ErrorKind::Corruption("bad section info magic".into()).into());
    }
    if body[4] != SINFO_VERSION {
        return Err(ErrorKind::Corruption(format!(
            "unsupported section info version {}",
            body[4]
        ))
        .into());
    }

    struct Cursor<'a> {
        body: &'a [u8],
        pos: usize,
    }
    impl<'a> Cursor<'a> {
        fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            if self.pos + n > self.body.len() {
                return Err(ErrorKind::Corruption("section info truncated".into()).into());
            }
            let slice = &self.body[self.pos..self.pos + n];
            self.pos += n;
            Ok(slice)
        }
    }
    let mut cur = Cursor { body, pos: 5 };

    let record_count = u32::from_le_bytes(cur.take(4)?.try_into().unwrap());
    let mut sections = Vec::new();
    for _ in 0..record_count {
        let size = u64::from_le_bytes(cur.take(8)?.try_into().unwrap());
        let count = u32::from_le_bytes(cur.take(4)?.try_into().unwrap());
        let mut prev: Addr = 0;
        for _ in 0..count {
            let delta = u64::from_le_bytes(cur.take(8)?.try_into().unwrap());
            let class = SectClassId(u16::from_le_bytes(cur.take(2)?.try_into().unwrap()));
            let extra = classes.get(class)?.serialized_extra();
            let _ = cur.take(extra)?;
            let addr = prev.wrapping_add(delta);
            sections.push(Section::new(addr, size, class));
            prev = addr;
        }
    }

    // Checksum sits directly after the records; anything beyond it is
    // avoid-shrink padding.
    let end = cur.pos;
    let stored = u32::from_le_bytes(cur.take(4)?.try_into().unwrap());
    if crc32c::crc32c(&body[..end]) != stored {
        return Err(ErrorKind::Corruption("section info checksum mismatch".into()).into());
    }
    Ok(sections)
}

// ============================================================================
// Lock protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Nested reference-count lock over the section-info block.
#[derive(Debug, Default)]
pub struct SinfoLock {
    refs: u32,
    mode: Option<AccessMode>,
    dirty: bool,
}

impl SinfoLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> bool {
        self.refs > 0
    }

    pub fn mode(&self) -> Option<AccessMode> {
        self.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Acquire or nest. A read-write request while read-only is held
    /// upgrades the whole nest to read-write.
    pub fn acquire(&mut self, mode: AccessMode) {
        match self.mode {
            None => self.mode = Some(mode),
            Some(AccessMode::ReadOnly) if mode == AccessMode::ReadWrite => {
                self.mode = Some(AccessMode::ReadWrite);
            }
            Some(_) => {}
        }
        self.refs += 1;
    }

    pub fn mark_dirty(&mut self) -> Result<()> {
        match self.mode {
            Some(AccessMode::ReadWrite) => {
                self.dirty = true;
                Ok(())
            }
            Some(AccessMode::ReadOnly) => Err(ErrorKind::InvalidState(
                "section info dirtied under a read-only lock".into(),
            )
            .into()),
            None => Err(ErrorKind::InvalidState(
                "section info dirtied while unlocked".into(),
            )
            .into()),
        }
    }

    /// Release one nesting level. Returns `Some(dirty)` when the final
    /// holder released; the caller then writes the block back if dirty.
    pub fn release(&mut self) -> Result<Option<bool>> {
        if self.refs == 0 {
            return Err(ErrorKind::InvalidState("section info lock underflow".into()).into());
        }
        self.refs -= 1;
        if self.refs == 0 {
            self.mode = None;
            let dirty = std::mem::take(&mut self.dirty);
            Ok(Some(dirty))
        } else {
            Ok(None)
        }
    }
}
