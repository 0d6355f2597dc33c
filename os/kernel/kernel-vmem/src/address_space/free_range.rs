//! Searching for runs of never-reserved virtual pages.
//!
//! Absent tables are skipped a whole level span at a time, so scanning a
//! mostly empty window costs a handful of reads per gigabyte.

use super::{AddressSpace, Translation};
use crate::PhysMapper;
use crate::page_table::Level;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

impl<M: PhysMapper> AddressSpace<'_, M> {
    /// Whether `va` is unmapped, and where the next probe should start.
    ///
    /// The returned boundary is clipped to `limit`.
    fn probe(&self, va: VirtualAddress, limit: u64) -> (bool, u64) {
        let (free, span) = match self.lookup(va) {
            Translation::Missing(level) => (true, level.span()),
            Translation::Leaf {
                level: Level::Pt,
                entry,
            } => (entry.is_zero(), Size4K::SIZE),
            Translation::Leaf { level, .. } => (false, level.span()),
        };
        let next = (va.as_u64() | (span - 1)).checked_add(1).unwrap_or(limit);
        (free, next.min(limit))
    }

    /// Lowest address in `[start, end)` starting `pages` consecutive
    /// unmapped 4 KiB pages.
    ///
    /// Reserved and guard entries count as taken. `start` must be page
    /// aligned.
    #[must_use]
    pub fn find_free(&self, start: VirtualAddress, end: VirtualAddress, pages: u64) -> Option<VirtualAddress> {
        debug_assert!(start.is_aligned::<Size4K>());
        let need = pages.checked_mul(Size4K::SIZE)?;
        if need == 0 {
            return None;
        }

        let end = end.as_u64();
        let mut va = start.as_u64();
        let mut run_start = va;
        while va < end {
            let (free, next) = self.probe(VirtualAddress::new(va), end);
            if free {
                if next - run_start >= need {
                    return Some(VirtualAddress::new(run_start));
                }
            } else {
                run_start = next;
            }
            va = next;
        }
        None
    }

    /// Whether all of `[start, start + pages * 4K)` is unmapped.
    ///
    /// Returns the first taken page otherwise.
    pub fn check_free(&self, start: VirtualAddress, pages: u64) -> Result<(), VirtualAddress> {
        let end = pages
            .checked_mul(Size4K::SIZE)
            .and_then(|len| start.checked_add(len))
            .ok_or(start)?
            .as_u64();
        let mut va = start.as_u64();
        while va < end {
            let (free, next) = self.probe(VirtualAddress::new(va), end);
            if !free {
                return Err(VirtualAddress::new(va));
            }
            va = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::address_space::AddressSpace;
    use crate::entry::{EntryFlags, SoftBits};
    use crate::test_support::{BumpAlloc, TestPhys};
    use kernel_info::cpu::CpuCapabilities;
    use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

    const START: VirtualAddress = VirtualAddress::new(0x40_0000);
    const END: VirtualAddress = VirtualAddress::new(0x0000_8000_0000_0000);

    #[test]
    fn empty_space_returns_start() {
        let phys = TestPhys::with_frames(4);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        assert_eq!(space.find_free(START, END, 1), Some(START));
        assert_eq!(space.find_free(START, END, 1 << 30), Some(START));
        assert_eq!(space.find_free(START, END, 0), None);
    }

    #[test]
    fn runs_skip_reserved_and_guard_pages() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(1, 16);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);

        let reserved = EntryFlags::default().with_soft(SoftBits::UNUSED);
        let guard = EntryFlags::default().with_soft(SoftBits::GUARD);
        space.write_leaf(&mut alloc, START, reserved, PhysicalAddress::zero()).expect("reserve");
        space.write_leaf(&mut alloc, START + 0x3000, guard, PhysicalAddress::zero()).expect("guard");

        assert_eq!(space.find_free(START, END, 2), Some(START + 0x1000));
        assert_eq!(space.find_free(START, END, 3), Some(START + 0x4000));
        assert_eq!(space.check_free(START + 0x1000, 2), Ok(()));
        assert_eq!(space.check_free(START + 0x1000, 3), Err(START + 0x3000));
    }

    #[test]
    fn window_end_is_respected() {
        let phys = TestPhys::with_frames(4);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let end = START + 0x2000;
        assert_eq!(space.find_free(START, end, 2), Some(START));
        assert_eq!(space.find_free(START, end, 3), None);
    }

    #[test]
    fn top_of_the_address_space_does_not_overflow() {
        let phys = TestPhys::with_frames(4);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let start = VirtualAddress::new(0xFFFF_FFFF_FFFF_E000);
        let end = VirtualAddress::new(u64::MAX);
        assert_eq!(space.find_free(start, end, 1), Some(start));
        assert_eq!(space.find_free(start, end, 2), None);
    }
}
