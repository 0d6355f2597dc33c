//! # Page Tables and Entry Primitives
//!
//! [`set_entry`] and [`clear_entry`] are the only functions that write raw
//! entries; everything above them composes these two.

use crate::entry::{EntryFlags, PageEntry};
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::TABLE_ENTRIES;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};

/// Translation level, numbered from the root.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Pml4 = 0,
    Pdpt = 1,
    Pd = 2,
    Pt = 3,
}

impl Level {
    /// Root to leaf.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Position of this level's index bits in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Index into this level's table for `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// Whether a PS=1 leaf may be installed at this level.
    #[inline]
    #[must_use]
    pub const fn allows_huge(self, caps: &CpuCapabilities) -> bool {
        match self {
            Self::Pdpt => caps.huge_1g,
            Self::Pd => true,
            Self::Pml4 | Self::Pt => false,
        }
    }

    /// Required alignment of the frame a leaf at this level points to.
    const fn leaf_alignment(self) -> u64 {
        match self {
            Self::Pdpt => Size1G::SIZE,
            Self::Pd => Size2M::SIZE,
            Self::Pml4 | Self::Pt => Size4K::SIZE,
        }
    }
}

/// Index into a 512-entry table.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(v: usize) -> Self {
        debug_assert!(v < TABLE_ENTRIES);
        Self(v as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One 4 KiB page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::ZERO; TABLE_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageEntry {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageEntry) {
        self.entries[index.as_usize()] = entry;
    }

    /// All 512 entries are zero (no link, no leaf, no software state).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_zero())
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableIndex, PageEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (TableIndex::new(i), *e))
    }

    pub fn clear(&mut self) {
        self.entries.fill(PageEntry::ZERO);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum EntryError {
    #[error("no huge leaves at {0:?} on this CPU")]
    HugeNotSupported(Level),
    #[error("dirty/global/PAT bits are only valid on leaves, not on a {0:?} table link")]
    LeafBitsOnTable(Level),
    #[error("{0:?} is not aligned for a {1:?} entry")]
    Unaligned(PhysicalAddress, Level),
    #[error("{0:?} exceeds the physical address width")]
    FrameOutOfRange(PhysicalAddress),
    #[error("a present entry cannot be tagged unused")]
    UnusedWhilePresent,
}

/// Write one entry of a `level` table.
///
/// `flags.huge_or_pat` selects a huge leaf at [`Level::Pdpt`] / [`Level::Pd`]
/// and the PAT bit at [`Level::Pt`]. `dirty`, `global` and PAT are accepted
/// only for leaves. `no_execute` and `global` are silently dropped when the
/// CPU lacks them, since setting them would raise reserved-bit faults.
///
/// Returns the previous entry.
///
/// # Errors
/// See [`EntryError`]; the table is left untouched on error.
pub fn set_entry(
    level: Level,
    table: &mut PageTable,
    index: TableIndex,
    mut flags: EntryFlags,
    frame: PhysicalAddress,
    caps: &CpuCapabilities,
) -> Result<PageEntry, EntryError> {
    if flags.present && flags.soft.unused() {
        return Err(EntryError::UnusedWhilePresent);
    }

    let huge = flags.huge_or_pat && level != Level::Pt;
    if huge && !level.allows_huge(caps) {
        return Err(EntryError::HugeNotSupported(level));
    }

    let leaf = level == Level::Pt || huge;
    if !leaf && (flags.dirty || flags.global) {
        return Err(EntryError::LeafBitsOnTable(level));
    }

    let alignment = if huge {
        level.leaf_alignment()
    } else {
        Size4K::SIZE
    };
    if frame.as_u64() & (alignment - 1) != 0 {
        return Err(EntryError::Unaligned(frame, level));
    }
    if !frame.is_representable() {
        return Err(EntryError::FrameOutOfRange(frame));
    }

    flags.no_execute &= caps.no_execute;
    flags.global &= caps.global_pages;

    let entry = flags.pack().with_physical_address(frame);
    let old = table.get(index);
    table.set(index, entry);
    Ok(old)
}

/// Zero one entry and return what it held.
pub fn clear_entry(_level: Level, table: &mut PageTable, index: TableIndex) -> PageEntry {
    let old = table.get(index);
    table.set(index, PageEntry::ZERO);
    old
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SoftBits;

    fn boxed_table() -> Box<PageTable> {
        Box::new(PageTable::zeroed())
    }

    #[test]
    fn indices_follow_address_bits() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        assert_eq!(Level::Pml4.index_of(va).as_usize(), 0x111);
        assert_eq!(Level::Pdpt.index_of(va).as_usize(), 0x020);
        assert_eq!(Level::Pd.index_of(va).as_usize(), 0x009);
        assert_eq!(Level::Pt.index_of(va).as_usize(), 0x034);
        assert_eq!(Level::Pd.span(), 2 * 1024 * 1024);
    }

    #[test]
    fn leaf_with_all_bits() {
        let mut t = boxed_table();
        let flags = EntryFlags::default()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_dirty(true)
            .with_global(true)
            .with_huge_or_pat(true)
            .with_no_execute(true);
        let old = set_entry(
            Level::Pt,
            &mut t,
            TableIndex::new(3),
            flags,
            PhysicalAddress::new(0x7000),
            &CpuCapabilities::ALL,
        )
        .expect("valid leaf");
        assert!(old.is_zero());

        let e = t.get(TableIndex::new(3));
        assert_eq!(e.into_bits(), 0x8000_0000_0000_71C7);
        assert!(!t.is_empty());
    }

    #[test]
    fn unsupported_bits_are_stripped() {
        let mut t = boxed_table();
        let flags = EntryFlags::default()
            .with_present(true)
            .with_global(true)
            .with_no_execute(true);
        set_entry(
            Level::Pt,
            &mut t,
            TableIndex::new(0),
            flags,
            PhysicalAddress::new(0x1000),
            &CpuCapabilities::MINIMAL,
        )
        .expect("valid leaf");
        let e = t.get(TableIndex::new(0));
        assert!(!e.global());
        assert!(!e.no_execute());
    }

    #[test]
    fn huge_leaves_need_support_and_alignment() {
        let mut t = boxed_table();
        let huge = EntryFlags::default().with_present(true).with_huge_or_pat(true);
        let idx = TableIndex::new(1);

        assert_eq!(
            set_entry(Level::Pdpt, &mut t, idx, huge, PhysicalAddress::new(0x4000_0000), &CpuCapabilities::MINIMAL),
            Err(EntryError::HugeNotSupported(Level::Pdpt))
        );
        assert_eq!(
            set_entry(Level::Pd, &mut t, idx, huge, PhysicalAddress::new(0x1000), &CpuCapabilities::ALL),
            Err(EntryError::Unaligned(PhysicalAddress::new(0x1000), Level::Pd))
        );
        assert_eq!(
            set_entry(Level::Pml4, &mut t, idx, huge, PhysicalAddress::zero(), &CpuCapabilities::ALL),
            Err(EntryError::HugeNotSupported(Level::Pml4))
        );
        assert!(t.is_empty(), "failed writes must not touch the table");

        set_entry(Level::Pd, &mut t, idx, huge, PhysicalAddress::new(0x20_0000), &CpuCapabilities::ALL)
            .expect("2M leaf");
        assert!(t.get(idx).page_size());
        assert_eq!(t.get(idx).next_table(), None);
    }

    #[test]
    fn table_links_reject_leaf_bits() {
        let mut t = boxed_table();
        let link = EntryFlags::table(false).with_global(true);
        assert_eq!(
            set_entry(Level::Pml4, &mut t, TableIndex::new(0), link, PhysicalAddress::new(0x1000), &CpuCapabilities::ALL),
            Err(EntryError::LeafBitsOnTable(Level::Pml4))
        );
    }

    #[test]
    fn present_unused_is_rejected() {
        let mut t = boxed_table();
        let flags = EntryFlags::default().with_present(true).with_soft(SoftBits::UNUSED);
        assert_eq!(
            set_entry(Level::Pt, &mut t, TableIndex::new(0), flags, PhysicalAddress::zero(), &CpuCapabilities::ALL),
            Err(EntryError::UnusedWhilePresent)
        );
    }

    #[test]
    fn frames_beyond_52_bits_are_rejected() {
        let mut t = boxed_table();
        let flags = EntryFlags::default().with_present(true);
        let pa = PhysicalAddress::new(1 << 52);
        assert_eq!(
            set_entry(Level::Pt, &mut t, TableIndex::new(0), flags, pa, &CpuCapabilities::ALL),
            Err(EntryError::FrameOutOfRange(pa))
        );
    }

    #[test]
    fn clear_returns_previous_entry() {
        let mut t = boxed_table();
        t.set(TableIndex::new(9), PageEntry::guard());
        let old = clear_entry(Level::Pt, &mut t, TableIndex::new(9));
        assert_eq!(old, PageEntry::guard());
        assert!(t.is_empty());
    }
}
