// Free-space sections and their classes.
//
// A section is one contiguous free region of the container. Section
// classes parameterize how regions behave: whether they merge with
// neighbors, whether they serialize (ghost sections are counted but never
// encoded), and whether a section touching end-of-allocation may be given
// back by shrinking the container.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectClassId(pub u16);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionClassFlags: u32 {
        /// Sections are tracked in counts but never serialized.
        const GHOST = 1 << 0;
        /// Sections never merge with neighbors.
        const NO_MERGE = 1 << 1;
        /// Sections merge only with sections of the same class.
        const MERGE_SAME_CLASS_ONLY = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags for `FreeSpaceManager::add`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddFlags: u32 {
        /// Merge with adjoining neighbors to a fixed point.
        const MERGE = 1 << 0;
        /// Space returned by a deallocation: merge, then try to give the
        /// survivor straight back to the container if it touches
        /// end-of-allocation.
        const RETURNED_SPACE = 1 << 1;
        /// Called while deserializing the section info; skip the
        /// serialized-size recomputation until the load completes.
        const DESERIALIZING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Live,
    Serialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub addr: Addr,
    pub size: u64,
    pub class: SectClassId,
    pub state: SectionState,
}

impl Section {
    pub fn new(addr: Addr, size: u64, class: SectClassId) -> Self {
        Self {
            addr,
            size,
            class,
            state: SectionState::Live,
        }
    }

    #[inline]
    pub fn end(&self) -> Addr {
        self.addr + self.size
    }

    #[inline]
    pub fn adjoins(&self, other: &Section) -> bool {
        self.end() == other.addr || other.end() == self.addr
    }
}

/// Per-kind behavior hooks for sections.
pub trait SectionClass: Debug + Send + Sync {
    fn id(&self) -> SectClassId;

    fn name(&self) -> &'static str;

    fn flags(&self) -> SectionClassFlags {
        SectionClassFlags::empty()
    }

    /// Extra bytes this class serializes per section beyond the shared
    /// address/size encoding.
    fn serialized_extra(&self) -> usize {
        0
    }

    /// Hook invoked when a section enters the tracker.
    fn on_add(&self, sect: &mut Section, flags: AddFlags) -> Result<()> {
        let _ = (sect, flags);
        Ok(())
    }

    /// Whether `left` may absorb `right`. Adjacency and class-flag checks
    /// have already passed.
    fn can_merge(&self, left: &Section, right: &Section) -> bool {
        let _ = (left, right);
        true
    }

    fn merge(&self, left: &mut Section, right: Section) -> Result<()> {
        debug_assert_eq!(left.end(), right.addr);
        left.size += right.size;
        Ok(())
    }

    /// Whether a section ending at `eoa` may be given back by shrinking
    /// the container.
    fn can_shrink(&self, sect: &Section, eoa: Addr) -> bool {
        sect.end() == eoa
    }

    /// Hook invoked as the container consumes the section.
    fn on_shrink(&self, sect: &Section) -> Result<()> {
        let _ = sect;
        Ok(())
    }

    /// Split `take` bytes off the head of `sect`, returning the taken
    /// piece. `sect` keeps the tail.
    fn split(&self, sect: &mut Section, take: u64) -> Result<Section> {
        if take == 0 || take >= sect.size {
            return Err(ErrorKind::InvalidArgument(format!(
                "split of {take} bytes from a {}-byte section",
                sect.size
            ))
            .into());
        }
        let head = Section::new(sect.addr, take, sect.class);
        sect.addr += take;
        sect.size -= take;
        Ok(head)
    }
}

/// Immutable table of section classes, fixed at manager creation.
#[derive(Debug, Clone)]
pub struct SectionClassRegistry {
    classes: Vec<Arc<dyn SectionClass>>,
}

impl SectionClassRegistry {
    pub fn new(classes: Vec<Arc<dyn SectionClass>>) -> Result<Self> {
        for (idx, class) in classes.iter().enumerate() {
            if class.id().0 as usize != idx {
                return Err(ErrorKind::InvalidArgument(format!(
                    "section class {} registered at slot {} but declares id {}",
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

    pub fn get(&self, id: SectClassId) -> Result<&Arc<dyn SectionClass>> {
        self.classes
            .get(id.0 as usize)
            .ok_or_else(|| ErrorKind::UnknownClass(id.0).into())
    }

    /// Whether two sections may merge under both classes' rules.
    pub fn mergeable(&self, left: &Section, right: &Section) -> Result<bool> {
        let lc = self.get(left.class)?;
        let rc = self.get(right.class)?;
        if lc.flags().contains(SectionClassFlags::NO_MERGE)
            || rc.flags().contains(SectionClassFlags::NO_MERGE)
        {
            return Ok(false);
        }
        if (lc.flags().contains(SectionClassFlags::MERGE_SAME_CLASS_ONLY)
            || rc.flags().contains(SectionClassFlags::MERGE_SAME_CLASS_ONLY))
            && left.class != right.class
        {
            return Ok(false);
        }
        Ok(lc.can_merge(left, right))
    }
}

/// The standard free-region class: merges freely, serializes, shrinks.
#[derive(Debug)]
pub struct SimpleSectionClass {
    pub id: SectClassId,
    pub flags: SectionClassFlags,
}

impl SimpleSectionClass {
    pub fn new(id: u16) -> Self {
        Self {
            id: SectClassId(id),
            flags: SectionClassFlags::empty(),
        }
    }

    pub fn with_flags(id: u16, flags: SectionClassFlags) -> Self {
        Self {
            id: SectClassId(id),
            flags,
        }
    }
}

impl SectionClass for SimpleSectionClass {
    fn id(&self) -> SectClassId {
        self.id
    }

    fn name(&self) -> &'static str {
        "simple"
    }

    fn flags(&self) -> SectionClassFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency() {
        let a = Section::new(0x1000, 0x100, SectClassId(0));
        let b = Section::new(0x1100, 0x80, SectClassId(0));
        let c = Section::new(0x2000, 0x80, SectClassId(0));
        assert!(a.adjoins(&b));
        assert!(b.adjoins(&a));
        assert!(!a.adjoins(&c));
    }

    #[test]
    fn test_split_head() {
        let class = SimpleSectionClass::new(0);
        let mut sect = Section::new(0x1000, 0x100, SectClassId(0));
        let head = class.split(&mut sect, 0x40).unwrap();
        assert_eq!(head.addr, 0x1000);
        assert_eq!(head.size, 0x40);
        assert_eq!(sect.addr, 0x1040);
        assert_eq!(sect.size, 0xc0);

        assert!(class.split(&mut sect, 0xc0).is_err());
    }

    #[test]
    fn test_merge_rules() {
        let reg = SectionClassRegistry::new(vec![
            Arc::new(SimpleSectionClass::new(0)) as Arc<dyn SectionClass>,
            Arc::new(SimpleSectionClass::with_flags(1, SectionClassFlags::NO_MERGE)),
            Arc::new(SimpleSectionClass::with_flags(
                2,
                SectionClassFlags::MERGE_SAME_CLASS_ONLY,
            )),
        ])
        .unwrap();

        let a = Section::new(0x1000, 0x100, SectClassId(0));
        let b = Section::new(0x1100, 0x100, SectClassId(0));
        assert!(reg.mergeable(&a, &b).unwrap());

        let sep = Section::new(0x1100, 0x100, SectClassId(1));
        assert!(!reg.mergeable(&a, &sep).unwrap());

        let sym = Section::new(0x1100, 0x100, SectClassId(2));
        assert!(!reg.mergeable(&a, &sym).unwrap());
        let sym2 = Section::new(0x1200, 0x100, SectClassId(2));
        assert!(reg.mergeable(&sym, &sym2).unwrap());
    }
}
