//! # Page-Table Entries
//!
//! One bit layout serves all four levels. Level-specific meaning:
//!
//! | Bit | PML4E / table PDPTE / table PDE | PTE and huge leaves |
//! |-----|----------------------------------|---------------------|
//! | 6 | ignored | dirty |
//! | 7 | PS (0 = next table) | PAT (PTE) / PS=1 (huge) |
//! | 8 | ignored | global |
//!
//! [`EntryFlags`] is the unpacked, per-field view callers build; the packed
//! [`PageEntry`] is what the hardware reads. Conversion and validation live
//! in [`set_entry`](crate::set_entry).

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use utils_accessors_derive::Setters;

/// Software-defined AVL field (14 bits split across bits 9..12 and 52..63).
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct SoftBits {
    /// Reserved page without a frame; committed on first access.
    pub unused: bool,
    /// Guard page; any access is a fatal fault.
    pub guard: bool,
    /// The frame belongs to the caller, not the frame allocator.
    pub borrowed: bool,
    #[bits(11)]
    __: u16,
    #[bits(2)]
    __: u8,
}

impl SoftBits {
    /// Width of the AVL field in bits.
    pub const WIDTH: u32 = 14;

    pub const NONE: Self = Self::new();
    pub const UNUSED: Self = Self::new().with_unused(true);
    pub const GUARD: Self = Self::new().with_guard(true);
    pub const BORROWED: Self = Self::new().with_borrowed(true);
}

/// x86-64 paging entry, common layout of all levels.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// PS in PDPTE/PDE, PAT in PTE.
    pub page_size: bool,
    pub global: bool,
    #[bits(3)]
    avl_low: u8,
    /// Bits 12..52: frame number of the target.
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    avl_high: u16,
    pub no_execute: bool,
}

/// What a 4 KiB leaf entry currently stands for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageState {
    Unmapped,
    Reserved,
    Guard,
    Committed,
}

impl PageEntry {
    pub const ZERO: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn soft(self) -> SoftBits {
        SoftBits::from_bits(self.avl_low() as u16 | (self.avl_high() << 3))
    }

    #[inline]
    #[must_use]
    pub const fn with_soft(self, soft: SoftBits) -> Self {
        let bits = soft.into_bits();
        debug_assert!(bits >> SoftBits::WIDTH == 0);
        self.with_avl_low((bits & 0b111) as u8)
            .with_avl_high(bits >> 3)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    /// Next-level table, if this is a present non-leaf entry.
    ///
    /// Only meaningful above the PT level.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.page_size() {
            Some(self.frame_page())
        } else {
            None
        }
    }

    /// Classify a 4 KiB leaf entry.
    #[must_use]
    pub const fn state(self) -> PageState {
        let soft = self.soft();
        if self.present() {
            PageState::Committed
        } else if soft.guard() {
            PageState::Guard
        } else if soft.unused() {
            PageState::Reserved
        } else {
            PageState::Unmapped
        }
    }

    /// Not-present leaf tagged `unused`, keeping the permissions the page
    /// will get once committed.
    #[must_use]
    pub const fn reserved(writable: bool, user: bool, no_execute: bool) -> Self {
        Self::new()
            .with_writable(writable)
            .with_user(user)
            .with_no_execute(no_execute)
            .with_soft(SoftBits::UNUSED)
    }

    /// Not-present leaf tagged `guard`.
    #[must_use]
    pub const fn guard() -> Self {
        Self::new().with_soft(SoftBits::GUARD)
    }

    /// Unpacked view of every field.
    #[must_use]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags {
            present: self.present(),
            writable: self.writable(),
            user: self.user(),
            write_through: self.write_through(),
            cache_disable: self.cache_disable(),
            accessed: self.accessed(),
            dirty: self.dirty(),
            huge_or_pat: self.page_size(),
            global: self.global(),
            no_execute: self.no_execute(),
            soft: self.soft(),
        }
    }
}

/// Unpacked entry bits, built with the generated `with_*` setters.
///
/// ```
/// use kernel_vmem::{EntryFlags, SoftBits};
///
/// let flags = EntryFlags::default()
///     .with_present(true)
///     .with_writable(true)
///     .with_no_execute(true);
/// assert!(flags.present && flags.writable && !flags.user);
/// assert_eq!(flags.soft, SoftBits::NONE);
/// ```
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct EntryFlags {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    /// PWT.
    pub write_through: bool,
    /// PCD.
    pub cache_disable: bool,
    pub accessed: bool,
    /// Leaf only.
    pub dirty: bool,
    /// PAT on a PTE, PS on a PDPTE/PDE.
    pub huge_or_pat: bool,
    /// Leaf only; dropped when the CPU lacks global pages.
    pub global: bool,
    /// Dropped when the CPU lacks NX.
    pub no_execute: bool,
    /// AVL field.
    pub soft: SoftBits,
}

impl EntryFlags {
    /// Flags of a present link to a next-level table.
    #[must_use]
    pub const fn table(user: bool) -> Self {
        Self {
            present: true,
            writable: true,
            user,
            write_through: false,
            cache_disable: false,
            accessed: false,
            dirty: false,
            huge_or_pat: false,
            global: false,
            no_execute: false,
            soft: SoftBits::NONE,
        }
    }

    pub(crate) const fn pack(self) -> PageEntry {
        PageEntry::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_dirty(self.dirty)
            .with_page_size(self.huge_or_pat)
            .with_global(self.global)
            .with_no_execute(self.no_execute)
            .with_soft(self.soft)
    }
}
