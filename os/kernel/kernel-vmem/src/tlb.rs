//! TLB maintenance.
//!
//! Every change to a translation that may be cached must be followed by an
//! invalidation of that page on this CPU. The memory manager goes through the
//! [`Tlb`] trait so tests can record invalidations instead of executing
//! privileged instructions.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Local TLB invalidation.
pub trait Tlb {
    /// Drop any cached translation for the page containing `va`.
    fn invalidate(&self, va: VirtualAddress);

    /// Drop every non-global cached translation.
    fn flush_all(&self);
}

/// The executing CPU's TLB.
#[derive(Debug, Default, Copy, Clone)]
pub struct CpuTlb;

impl Tlb for CpuTlb {
    #[inline]
    fn invalidate(&self, va: VirtualAddress) {
        invalidate(va);
    }

    #[inline]
    fn flush_all(&self) {
        flush_all();
    }
}

/// `invlpg` for the page containing `va`.
#[inline]
pub fn invalidate(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}

/// Reload CR3 with its current value.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        Cr3::load_unsafe().store_unsafe();
    }
}

/// Make `root` the active PML4.
///
/// # Safety
/// The tree under `root` must map the currently executing code, stack and the
/// physical window identically to the tree being replaced.
#[inline]
pub unsafe fn switch_root(root: PhysicalPage<Size4K>) {
    unsafe { Cr3::for_root(root).store_unsafe() }
}

/// Root of the translation tree the CPU is currently using.
///
/// # Safety
/// Requires CPL 0.
#[inline]
#[must_use]
pub unsafe fn active_root() -> PhysicalPage<Size4K> {
    unsafe { Cr3::load_unsafe() }.root()
}
