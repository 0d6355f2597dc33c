//! # Direct-Map PhysMapper
//!
//! All physical memory is mapped once at [`PHYS_WINDOW_BASE`], so physical
//! address `pa` is visible at `PHYS_WINDOW_BASE + pa`:
//!
//! ```text
//! PHYS_WINDOW_BASE ┌────────────────────────┐ ◄── pa 0
//!                  │  boot alias (1 GiB)    │
//!                  ├────────────────────────┤ ◄── BOOT_WINDOW_SIZE
//!                  │  installed by the VMM  │
//!                  ├────────────────────────┤ ◄── highest usable end
//!                  │  unmapped              │
//! + PHYS_WINDOW_SIZE └──────────────────────┘
//! ```
//!
//! A [`DirectMap`] only promises what is mapped: before the VMM has installed
//! the full window it is built with [`DirectMap::boot`], afterwards with the
//! real end of memory.

use kernel_info::memory::{BOOT_WINDOW_SIZE, PHYS_WINDOW_BASE, PHYS_WINDOW_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectMap {
    limit: PhysicalAddress,
}

impl DirectMap {
    /// Window over `[0, limit)`, clipped to the window size.
    #[must_use]
    pub const fn with_coverage(limit: PhysicalAddress) -> Self {
        let limit = if limit.as_u64() > PHYS_WINDOW_SIZE {
            PhysicalAddress::new(PHYS_WINDOW_SIZE)
        } else {
            limit
        };
        Self { limit }
    }

    /// The part the boot loader mapped before the kernel took over.
    #[must_use]
    pub const fn boot() -> Self {
        Self::with_coverage(PhysicalAddress::new(BOOT_WINDOW_SIZE))
    }

    /// Where `pa` is visible.
    #[inline]
    #[must_use]
    pub const fn virtual_of(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(PHYS_WINDOW_BASE + pa.as_u64())
    }
}

impl PhysMapper for DirectMap {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u64() < self.limit.as_u64(), "{pa} outside the physical window");
        let va = Self::virtual_of(pa).as_mut_ptr::<T>();
        // SAFETY: the caller guarantees `pa` is covered and holds a valid `T`.
        unsafe { &mut *va }
    }

    #[inline]
    fn coverage(&self) -> PhysicalAddress {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_addresses_are_offset_into_the_window() {
        assert_eq!(
            DirectMap::virtual_of(PhysicalAddress::new(0x1234_5000)),
            VirtualAddress::new(0xFFFF_8000_1234_5000)
        );
    }

    #[test]
    fn coverage_is_clipped() {
        assert_eq!(DirectMap::boot().coverage(), PhysicalAddress::new(BOOT_WINDOW_SIZE));
        assert_eq!(
            DirectMap::with_coverage(PhysicalAddress::MAX).coverage(),
            PhysicalAddress::new(PHYS_WINDOW_SIZE)
        );
    }
}
