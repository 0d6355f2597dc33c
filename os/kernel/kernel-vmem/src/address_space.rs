//! # Address Space (x86-64, PML4-rooted)
//!
//! A view of one translation tree: a PML4 frame plus the [`PhysMapper`] used
//! to reach its tables. The handle owns nothing; frames for new tables come
//! from the caller's [`FrameAlloc`] and go back to it when tables are pruned.
//!
//! ## Highlights
//!
//! - [`AddressSpace::lookup`] walks to the entry that decides a translation.
//! - [`AddressSpace::ensure_leaf_table`] creates missing PDPT/PD/PT levels.
//! - [`AddressSpace::write_leaf`] / [`AddressSpace::clear_leaf`] edit one
//!   4 KiB entry, [`AddressSpace::prune`] releases tables that became empty.
//! - [`AddressSpace::find_free`] looks for a run of never-reserved pages.
//! - [`AddressSpace::teardown`] releases everything under a range of PML4 slots.
//!
//! ## Safety
//!
//! - Mutating the active tree requires TLB maintenance by the caller.
//! - The handle assumes exclusive access to the tree for its lifetime.

mod free_range;

use crate::entry::{EntryFlags, PageEntry};
use crate::page_table::{EntryError, Level, TableIndex, clear_entry, set_entry};
use crate::{FrameAlloc, PhysMapper, PhysMapperExt};
use core::ops::Range;
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::KERNEL_HALF_FIRST_SLOT;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{debug, trace};

/// Where a walk for one virtual address ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Translation {
    /// The entry at `Level` is not present, so no table below it exists.
    /// Everything within `level.span()` of the address is unmapped.
    Missing(Level),
    /// The walk reached a leaf: a 4 KiB PT entry in any state, or a present
    /// huge leaf at [`Level::Pdpt`] / [`Level::Pd`].
    Leaf { level: Level, entry: PageEntry },
}

impl Translation {
    /// Physical address `va` resolves to, if the leaf is present.
    #[must_use]
    pub const fn physical(self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self {
            Self::Leaf { level, entry } if entry.present() => {
                let offset = va.as_u64() & (level.span() - 1);
                Some(PhysicalAddress::new(entry.physical_address().as_u64() + offset))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame for a new {0:?} table")]
    OutOfMemory(Level),
    #[error("a huge leaf at {0:?} already covers the address")]
    HugeLeafInTheWay(Level),
    #[error(transparent)]
    Entry(#[from] EntryError),
}

/// Handle to a single translation tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
    caps: CpuCapabilities,
}

/// Base virtual address of PML4 slot `slot`, sign-extended for the upper half.
#[inline]
#[must_use]
pub const fn slot_base(slot: usize) -> VirtualAddress {
    let raw = (slot as u64) << Level::Pml4.shift();
    if slot >= KERNEL_HALF_FIRST_SLOT {
        VirtualAddress::new(raw | 0xFFFF_0000_0000_0000)
    } else {
        VirtualAddress::new(raw)
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>, caps: CpuCapabilities) -> Self {
        Self { root, mapper, caps }
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn caps(&self) -> &CpuCapabilities {
        &self.caps
    }

    #[inline]
    pub fn pml4_entry(&self, slot: usize) -> PageEntry {
        self.mapper.read_table(self.root).get(TableIndex::new(slot))
    }

    /// Raw write of a PML4 slot, used to share kernel-half subtrees.
    #[inline]
    pub fn set_pml4_entry(&self, slot: usize, entry: PageEntry) {
        self.mapper.write_table(self.root).set(TableIndex::new(slot), entry);
    }

    /// Walk the tree for `va` and report the entry that decides it.
    pub fn lookup(&self, va: VirtualAddress) -> Translation {
        let mut table = self.root;
        for level in Level::ALL {
            let entry = self.mapper.read_table(table).get(level.index_of(va));
            if level == Level::Pt || (entry.present() && entry.page_size()) {
                return Translation::Leaf { level, entry };
            }
            match entry.next_table() {
                Some(next) => table = next,
                None => return Translation::Missing(level),
            }
        }
        Translation::Missing(Level::Pt)
    }

    /// Translate `va`, following huge leaves.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(va).physical(va)
    }

    /// The 4 KiB PT entry for `va`, if a PT covers it.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntry> {
        match self.lookup(va) {
            Translation::Leaf {
                level: Level::Pt,
                entry,
            } => Some(entry),
            _ => None,
        }
    }

    /// Frame of the PT covering `va`, if every level above it exists.
    fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            table = self.mapper.read_table(table).get(level.index_of(va)).next_table()?;
        }
        Some(table)
    }

    /// Create every missing table on the path to the PT covering `va`.
    ///
    /// New links are writable and carry `user` when the mapping is for user
    /// mode; existing links are upgraded to `user` when needed.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] when `alloc` runs dry. Tables created
    ///   before the failure stay linked; [`prune`](Self::prune) removes them.
    /// - [`MapError::HugeLeafInTheWay`] when a huge leaf already covers `va`.
    pub fn ensure_leaf_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let mut table = self.root;
        for (level, child) in [
            (Level::Pml4, Level::Pdpt),
            (Level::Pdpt, Level::Pd),
            (Level::Pd, Level::Pt),
        ] {
            table = self.ensure_child(alloc, table, level, child, va, user)?;
        }
        Ok(table)
    }

    /// Create the PDPT under PML4 slot `slot` if it is missing.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when `alloc` runs dry.
    pub fn ensure_pdpt<A: FrameAlloc>(&self, alloc: &mut A, slot: usize) -> Result<PhysicalPage<Size4K>, MapError> {
        self.ensure_child(alloc, self.root, Level::Pml4, Level::Pdpt, slot_base(slot), false)
    }

    fn ensure_child<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: Level,
        child: Level,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let index = level.index_of(va);
        let parent = self.mapper.write_table(table);
        let entry = parent.get(index);

        if let Some(next) = entry.next_table() {
            if user && !entry.user() {
                parent.set(index, entry.with_user(true));
            }
            return Ok(next);
        }
        if entry.present() {
            return Err(MapError::HugeLeafInTheWay(level));
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(child))?;
        self.mapper.zero_frame(frame);
        if let Err(e) = set_entry(level, parent, index, EntryFlags::table(user), frame.base(), &self.caps) {
            alloc.free_4k(frame);
            return Err(e.into());
        }
        trace!("new {child:?} table {frame:?} for {va}");
        Ok(frame)
    }

    /// Write the 4 KiB entry for `va`, creating tables as needed.
    ///
    /// Returns the previous entry.
    ///
    /// # Errors
    /// See [`ensure_leaf_table`](Self::ensure_leaf_table) and [`set_entry`].
    pub fn write_leaf<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        flags: EntryFlags,
        frame: PhysicalAddress,
    ) -> Result<PageEntry, MapError> {
        let pt = self.ensure_leaf_table(alloc, va, flags.user)?;
        let table = self.mapper.write_table(pt);
        Ok(set_entry(Level::Pt, table, Level::Pt.index_of(va), flags, frame, &self.caps)?)
    }

    /// Overwrite an existing 4 KiB entry without creating tables.
    ///
    /// `None` when no PT covers `va`; otherwise the result of [`set_entry`].
    pub fn rewrite_leaf(
        &self,
        va: VirtualAddress,
        flags: EntryFlags,
        frame: PhysicalAddress,
    ) -> Option<Result<PageEntry, EntryError>> {
        let pt = self.leaf_table(va)?;
        let table = self.mapper.write_table(pt);
        Some(set_entry(Level::Pt, table, Level::Pt.index_of(va), flags, frame, &self.caps))
    }

    /// Zero the 4 KiB entry for `va`; `None` when no PT covers it.
    pub fn clear_leaf(&self, va: VirtualAddress) -> Option<PageEntry> {
        let pt = self.leaf_table(va)?;
        Some(clear_entry(Level::Pt, self.mapper.write_table(pt), Level::Pt.index_of(va)))
    }

    /// Release tables on the path to `va` that no longer hold any entry.
    ///
    /// Works bottom-up and stops at the first non-empty table. PDPTs in the
    /// upper half are shared between every context and are never released.
    /// Returns the number of tables freed.
    pub fn prune<A: FrameAlloc>(&self, alloc: &mut A, va: VirtualAddress) -> usize {
        let mut path = [self.root; 4];
        for (depth, level) in [Level::Pml4, Level::Pdpt, Level::Pd].into_iter().enumerate() {
            match self.mapper.read_table(path[depth]).get(level.index_of(va)).next_table() {
                Some(next) => path[depth + 1] = next,
                None => return self.prune_path(alloc, va, &path[..=depth]),
            }
        }
        self.prune_path(alloc, va, &path)
    }

    fn prune_path<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        path: &[PhysicalPage<Size4K>],
    ) -> usize {
        let lowest = if va.is_higher_half() { 2 } else { 1 };
        let mut freed = 0;
        for depth in (lowest..path.len()).rev() {
            if !self.mapper.read_table(path[depth]).is_empty() {
                break;
            }
            let level = Level::ALL[depth - 1];
            clear_entry(level, self.mapper.write_table(path[depth - 1]), level.index_of(va));
            trace!("pruning empty {:?} table {:?} under {va}", Level::ALL[depth], path[depth]);
            alloc.free_4k(path[depth]);
            freed += 1;
        }
        freed
    }

    /// Install a present huge leaf at `level` mapping `va → pa`.
    ///
    /// # Errors
    /// See [`ensure_leaf_table`](Self::ensure_leaf_table) and [`set_entry`].
    pub fn map_huge<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        level: Level,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        let mut table = self.root;
        for (parent, child) in [
            (Level::Pml4, Level::Pdpt),
            (Level::Pdpt, Level::Pd),
            (Level::Pd, Level::Pt),
        ] {
            if parent == level {
                break;
            }
            table = self.ensure_child(alloc, table, parent, child, va, flags.user)?;
        }
        let flags = flags.with_present(true).with_huge_or_pat(true);
        set_entry(level, self.mapper.write_table(table), level.index_of(va), flags, pa, &self.caps)?;
        Ok(())
    }

    /// Release every table under the PML4 `slots`, reporting each non-zero
    /// leaf to `on_leaf` first, and clear the slots.
    ///
    /// Returns the number of tables freed.
    pub fn teardown<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        slots: Range<usize>,
        mut on_leaf: impl FnMut(&mut A, VirtualAddress, Level, PageEntry),
    ) -> usize {
        let mut freed = 0;
        for slot in slots {
            let entry = self.pml4_entry(slot);
            if let Some(pdpt) = entry.next_table() {
                freed += self.teardown_table(alloc, pdpt, Level::Pdpt, slot_base(slot), &mut on_leaf);
            }
            if !entry.is_zero() {
                self.set_pml4_entry(slot, PageEntry::ZERO);
            }
        }
        debug!("tore down {freed} tables under root {:?}", self.root);
        freed
    }

    fn teardown_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        frame: PhysicalPage<Size4K>,
        level: Level,
        base: VirtualAddress,
        on_leaf: &mut impl FnMut(&mut A, VirtualAddress, Level, PageEntry),
    ) -> usize {
        let mut freed = 0;
        for (index, entry) in self.mapper.read_table(frame).iter() {
            if entry.is_zero() {
                continue;
            }
            let va = base + index.as_usize() as u64 * level.span();
            match (level, entry.next_table()) {
                (Level::Pt, _) | (_, None) => on_leaf(alloc, va, level, entry),
                (_, Some(child)) => {
                    if let Some(next) = level.next() {
                        freed += self.teardown_table(alloc, child, next, va, on_leaf);
                    }
                }
            }
        }
        alloc.free_4k(frame);
        freed + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{PageState, SoftBits};
    use crate::test_support::{BumpAlloc, TestPhys};

    fn committed(frame: u64) -> (EntryFlags, PhysicalAddress) {
        (
            EntryFlags::default().with_present(true).with_writable(true),
            PhysicalAddress::new(frame * 4096),
        )
    }

    #[test]
    fn slot_bases_are_canonical() {
        assert_eq!(slot_base(0), VirtualAddress::new(0));
        assert_eq!(slot_base(1), VirtualAddress::new(0x80_0000_0000));
        assert_eq!(slot_base(256), VirtualAddress::new(0xFFFF_8000_0000_0000));
        assert_eq!(slot_base(511), VirtualAddress::new(0xFFFF_FF80_0000_0000));
        assert!(slot_base(300).is_canonical());
    }

    #[test]
    fn write_then_query() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);

        let va = VirtualAddress::new(0x40_3000);
        assert_eq!(space.lookup(va), Translation::Missing(Level::Pml4));

        let (flags, pa) = committed(20);
        let old = space.write_leaf(&mut alloc, va, flags, pa).expect("map");
        assert!(old.is_zero());
        assert_eq!(alloc.handed_out(), 4, "PDPT, PD and PT were created");

        assert_eq!(space.query(va + 0x123), Some(PhysicalAddress::new(20 * 4096 + 0x123)));
        assert_eq!(space.leaf_entry(va).map(PageEntry::state), Some(PageState::Committed));
        assert_eq!(space.leaf_entry(va + 4096).map(PageEntry::state), Some(PageState::Unmapped));
        assert_eq!(space.query(va + 4096), None);
    }

    #[test]
    fn user_links_are_upgraded() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(1, 16);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let va = VirtualAddress::new(0x40_0000);

        space.ensure_leaf_table(&mut alloc, va, false).expect("tables");
        assert!(!space.pml4_entry(0).user());

        space.ensure_leaf_table(&mut alloc, va, true).expect("tables");
        assert!(space.pml4_entry(0).user());
        assert_eq!(alloc.handed_out(), 4, "no new tables on the second call");
    }

    #[test]
    fn pdpts_are_created_once() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(1, 8);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);

        let pdpt = space.ensure_pdpt(&mut alloc, 510).expect("pdpt");
        assert_eq!(space.ensure_pdpt(&mut alloc, 510), Ok(pdpt));
        assert_eq!(space.pml4_entry(510).next_table(), Some(pdpt));
        assert!(!space.pml4_entry(510).user());
        assert_eq!(alloc.handed_out(), 2);
    }

    #[test]
    fn out_of_frames_names_the_missing_level() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(1, 3);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let va = VirtualAddress::new(0x40_0000);

        assert_eq!(
            space.ensure_leaf_table(&mut alloc, va, false),
            Err(MapError::OutOfMemory(Level::Pt))
        );
        assert_eq!(space.prune(&mut alloc, va), 2);
        assert_eq!(alloc.freed.len(), 2);
        assert!(space.pml4_entry(0).is_zero());
    }

    #[test]
    fn prune_keeps_shared_upper_pdpts() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(1, 16);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let va = VirtualAddress::new(0xFFFF_FF00_0000_0000);

        let (flags, pa) = committed(12);
        space.write_leaf(&mut alloc, va, flags, pa).expect("map");
        assert_eq!(space.clear_leaf(va).map(|e| e.present()), Some(true));

        assert_eq!(space.prune(&mut alloc, va), 2, "PT and PD only");
        assert!(space.pml4_entry(510).present());
        assert_eq!(space.lookup(va), Translation::Missing(Level::Pdpt));
    }

    #[test]
    fn prune_stops_at_occupied_tables() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(1, 16);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let a = VirtualAddress::new(0x40_0000);
        let b = VirtualAddress::new(0x40_1000);

        let (flags, pa) = committed(12);
        space.write_leaf(&mut alloc, a, flags, pa).expect("map");
        space
            .write_leaf(&mut alloc, b, EntryFlags::default().with_soft(SoftBits::GUARD), PhysicalAddress::zero())
            .expect("guard");

        space.clear_leaf(a);
        assert_eq!(space.prune(&mut alloc, a), 0, "the guard entry keeps the PT alive");
    }

    #[test]
    fn huge_leaves_block_4k_tables() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(1, 16);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);
        let va = VirtualAddress::new(0xFFFF_8000_0020_0000);

        space
            .map_huge(&mut alloc, Level::Pd, va, PhysicalAddress::new(0x20_0000), EntryFlags::default())
            .expect("2M leaf");
        assert_eq!(space.query(va + 0x1234), Some(PhysicalAddress::new(0x20_1234)));
        assert_eq!(
            space.ensure_leaf_table(&mut alloc, va, false),
            Err(MapError::HugeLeafInTheWay(Level::Pd))
        );
        assert_eq!(space.leaf_entry(va), None);
    }

    #[test]
    fn teardown_reports_leaves_and_frees_tables() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let space = AddressSpace::from_root(&phys, PhysicalPage::from_number(0), CpuCapabilities::ALL);

        for (i, va) in [0x40_0000_u64, 0x40_1000, 0x4000_0000].into_iter().enumerate() {
            let (flags, pa) = committed(20 + i as u64);
            space.write_leaf(&mut alloc, VirtualAddress::new(va), flags, pa).expect("map");
        }

        let mut seen = Vec::new();
        let freed = space.teardown(&mut alloc, 0..KERNEL_HALF_FIRST_SLOT, |_, va, level, entry| {
            assert_eq!(level, Level::Pt);
            seen.push((va.as_u64(), entry.frame_page().number()));
        });

        assert_eq!(seen, vec![(0x40_0000, 20), (0x40_1000, 21), (0x4000_0000, 22)]);
        assert_eq!(freed, 5, "one PDPT, two PDs, two PTs");
        assert_eq!(alloc.freed.len(), 5);
        assert!(space.pml4_entry(0).is_zero());
    }
}
