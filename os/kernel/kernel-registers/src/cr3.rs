#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: base of the PML4 of the active address space (PCID disabled).
///
/// Writing CR3 flushes every non-global TLB entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    #[bits(3)]
    __: u8,

    /// Bit 3: page-level write-through for the PML4 fetch.
    pub pwt: bool,

    /// Bit 4: page-level cache disable for the PML4 fetch.
    pub pcd: bool,

    #[bits(7)]
    __: u8,

    /// Bits 12..52: PML4 frame number.
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn for_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.number())
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.root_frame())
    }

    #[must_use]
    pub const fn root_address(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trip() {
        let root = PhysicalPage::<Size4K>::from_number(0x1_2345);
        let cr3 = Cr3::for_root(root);
        assert_eq!(cr3.into_bits(), 0x1_2345_000);
        assert_eq!(cr3.root(), root);
        assert!(!cr3.pwt() && !cr3.pcd());
    }

    #[test]
    fn flags_do_not_leak_into_root() {
        let cr3 = Cr3::from_bits(0x0000_0000_0040_0018);
        assert!(cr3.pwt());
        assert!(cr3.pcd());
        assert_eq!(cr3.root_address(), PhysicalAddress::new(0x40_0000));
    }
}
