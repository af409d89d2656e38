// Size-binned section index.
//
// Sections live in one master address-ordered map; bins indexed by
// floor(log2(size)) each hold an ordered size map whose nodes are ordered
// address sets, so best-fit-lowest-address lookups stay O(log n). A
// separate address-ordered merge list covers only sections whose class
// permits merging.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use crate::freespace::section::{
    Section, SectionClassFlags, SectionClassRegistry,
};
use std::collections::{BTreeMap, BTreeSet};

#[inline]
pub(crate) fn bin_of(size: u64) -> usize {
    debug_assert!(size > 0);
    (63 - size.leading_zeros()) as usize
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BinStats {
    pub total: u64,
    pub serializable: u64,
    pub ghost: u64,
}

#[derive(Debug, Default)]
struct Bin {
    by_size: BTreeMap<u64, BTreeSet<Addr>>,
    stats: BinStats,
}

/// Aggregate counters mirrored at the header level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectionTotals {
    pub total_space: u64,
    pub section_count: u64,
    pub serializable_count: u64,
    pub ghost_count: u64,
    pub max_section_size: u64,
}

#[derive(Debug, Default)]
pub struct SectionBins {
    sections: BTreeMap<Addr, Section>,
    bins: Vec<Bin>,
    merge_list: BTreeSet<Addr>,
    totals: SectionTotals,
}

impl SectionBins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> SectionTotals {
        self.totals
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn get(&self, addr: Addr) -> Option<&Section> {
        self.sections.get(&addr)
    }

    pub fn bin_stats(&self, bin: usize) -> BinStats {
        self.bins.get(bin).map(|b| b.stats).unwrap_or_default()
    }

    /// The live section with the highest address, if any.
    pub fn last_section(&self) -> Option<&Section> {
        self.sections.values().next_back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    /// Neighbors adjoining `[addr, addr+size)` on the merge list.
    pub fn merge_neighbors(&self, addr: Addr, size: u64) -> (Option<Addr>, Option<Addr>) {
        let left = self
            .merge_list
            .range(..addr)
            .next_back()
            .copied()
            .filter(|&l| {
                self.sections
                    .get(&l)
                    .map(|s| s.end() == addr)
                    .unwrap_or(false)
            });
        let right = self
            .merge_list
            .range(addr + size..)
            .next()
            .copied()
            .filter(|&r| r == addr + size);
        (left, right)
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Link a section into the master map, its bin, and (when its class
    /// allows) the merge list.
    pub fn link(&mut self, section: Section, classes: &SectionClassRegistry) -> Result<()> {
        if section.size == 0 {
            return Err(ErrorKind::InvalidArgument("zero-size section".into()).into());
        }
        if let Some((&prev_addr, prev)) = self.sections.range(..=section.addr).next_back() {
            if prev_addr == section.addr || prev.end() > section.addr {
                return Err(ErrorKind::InvalidState(format!(
                    "section [{:#x}, {:#x}) overlaps existing [{:#x}, {:#x})",
                    section.addr,
                    section.end(),
                    prev_addr,
                    prev.end()
                ))
                .into());
            }
        }
        if let Some((&next_addr, _)) = self.sections.range(section.addr..).next() {
            if section.end() > next_addr {
                return Err(ErrorKind::InvalidState(format!(
                    "section [{:#x}, {:#x}) overlaps section at {:#x}",
                    section.addr,
                    section.end(),
                    next_addr
                ))
                .into());
            }
        }

        let class = classes.get(section.class)?;
        let ghost = class.flags().contains(SectionClassFlags::GHOST);
        let mergeable = !class.flags().contains(SectionClassFlags::NO_MERGE);

        let bin = bin_of(section.size);
        if self.bins.len() <= bin {
            self.bins.resize_with(bin + 1, Bin::default);
        }
        let slot = &mut self.bins[bin];
        slot.by_size
            .entry(section.size)
            .or_default()
            .insert(section.addr);
        slot.stats.total += 1;
        if ghost {
            slot.stats.ghost += 1;
            self.totals.ghost_count += 1;
        } else {
            slot.stats.serializable += 1;
            self.totals.serializable_count += 1;
        }

        if mergeable {
            self.merge_list.insert(section.addr);
        }
        self.totals.total_space += section.size;
        self.totals.section_count += 1;
        self.totals.max_section_size = self.totals.max_section_size.max(section.size);
        self.sections.insert(section.addr, section);
        Ok(())
    }

    /// Unlink and return the section at `addr`.
    pub fn unlink(&mut self, addr: Addr, classes: &SectionClassRegistry) -> Result<Section> {
        let section = self
            .sections
            .remove(&addr)
            .ok_or(ErrorKind::AddressNotFound(addr))?;
        let class = classes.get(section.class)?;
        let ghost = class.flags().contains(SectionClassFlags::GHOST);

        let bin = bin_of(section.size);
        let slot = &mut self.bins[bin];
        if let Some(set) = slot.by_size.get_mut(&section.size) {
            set.remove(&addr);
            if set.is_empty() {
                slot.by_size.remove(&section.size);
            }
        }
        slot.stats.total -= 1;
        if ghost {
            slot.stats.ghost -= 1;
            self.totals.ghost_count -= 1;
        } else {
            slot.stats.serializable -= 1;
            self.totals.serializable_count -= 1;
        }
        self.merge_list.remove(&addr);
        self.totals.total_space -= section.size;
        self.totals.section_count -= 1;
        Ok(section)
    }

    /// Swap a section's class in place, fixing ghost/serializable counts
    /// and merge-list membership.
    pub fn change_class(
        &mut self,
        addr: Addr,
        new_class: crate::freespace::section::SectClassId,
        classes: &SectionClassRegistry,
    ) -> Result<()> {
        let mut section = self.unlink(addr, classes)?;
        classes.get(new_class)?;
        section.class = new_class;
        self.link(section, classes)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Best fit: the smallest adequate section, lowest address first.
    /// Returns the address; the caller unlinks it.
    pub fn find_best(&self, size: u64) -> Option<Addr> {
        if size == 0 || self.sections.is_empty() {
            return None;
        }
        let start_bin = bin_of(size);
        for bin in start_bin..self.bins.len() {
            if let Some(slot) = self.bins.get(bin) {
                for (_, addrs) in slot.by_size.range(size..) {
                    if let Some(addr) = addrs.iter().next() {
                        return Some(*addr);
                    }
                }
            }
        }
        None
    }

    /// Alignment-aware fit: the lowest-address section that can yield an
    /// aligned block of `size` after splitting off its alignment padding
    /// as a section of its own.
    pub fn find_aligned(&self, size: u64, alignment: u64) -> Option<(Addr, u64)> {
        debug_assert!(alignment > 1);
        self.sections.values().find_map(|sect| {
            let pad = (alignment - (sect.addr % alignment)) % alignment;
            (sect.size >= pad + size).then_some((sect.addr, pad))
        })
    }

    /// The section starting exactly at `addr + size`, if large enough to
    /// give up `extra` bytes.
    pub fn extend_candidate(&self, addr: Addr, size: u64, extra: u64) -> Option<&Section> {
        self.sections
            .get(&(addr + size))
            .filter(|sect| sect.size >= extra)
    }
}
