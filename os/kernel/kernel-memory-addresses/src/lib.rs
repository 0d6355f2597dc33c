//! # Typed Physical and Virtual Addresses
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at the
//! type level, plus page/frame types parameterized by the x86-64 page sizes.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`PhysicalPage<S>`] | A physical frame of size `S`; base is `S`-aligned. |
//! | [`VirtualPage<S>`] | A virtual page of size `S`; base is `S`-aligned. |
//!
//! Page sizes are sealed marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB, the frame granularity of the physical allocator
//! - [`Size2M`]: 2 MiB large pages
//! - [`Size1G`]: 1 GiB huge pages
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FF00_0000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_FF00_0000_1000);
//! assert_eq!(va.offset_in::<Size4K>(), 0x234);
//! assert!(va.is_canonical());
//! assert!(va.is_higher_half());
//!
//! let frame = PhysicalPage::<Size4K>::from_number(0x42);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x42_000));
//! assert_eq!(frame.number(), 0x42);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page;
mod physical_address;
mod virtual_address;

use core::fmt;
use core::hash::Hash;

pub use page::{PhysicalPage, VirtualPage};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes supported by 4-level paging.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes.
    const SIZE: u64;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Mask of the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

page_size!(
    /// 4 KiB page (4096 bytes).
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page.
    Size1G, 30, "1G"
);

/// Number of implemented virtual address bits with 4-level paging.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

/// Number of physical address bits a page-table entry can hold.
pub const PHYSICAL_ADDRESS_BITS: u32 = 52;

/// Number of 4 KiB pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(Size4K::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_sizes_are_consistent() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::SIZE, 512 * Size4K::SIZE);
        assert_eq!(Size1G::SIZE, 512 * Size2M::SIZE);
        assert_eq!(Size2M::OFFSET_MASK, 0x1F_FFFF);
        assert_eq!(format!("{:?}", Size1G), "1G");
    }
}
