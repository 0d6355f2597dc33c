//! # Page Faults
//!
//! Decides what a #PF means for the memory manager:
//!
//! | Faulting entry | Outcome |
//! |----------------|---------|
//! | reserved (`unused`) and the access fits its permissions | frame committed, [`FaultOutcome::Resolved`] |
//! | guard | [`FaultOutcome::GuardPage`] |
//! | committed (another CPU was faster) | [`FaultOutcome::Resolved`] |
//! | anything else | [`FaultOutcome::Fatal`] |
//!
//! The handler never blocks on anything but the VMM and frame locks, which
//! keep interrupts disabled while held.

use crate::error::VmmError;
use crate::vmm::{Context, VirtualMemoryManager};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, PageState, PhysMapper, Tlb};
use log::{debug, trace};

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read or execute, 1 = write.
    pub write: bool,
    /// Access from CPL 3.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    /// Protection-key violation (CR4.PKE).
    pub protection_key: bool,
    /// Shadow-stack access (CET).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (not mapped or not yet backed)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Why a fault cannot be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FatalFault {
    #[error("access to unmapped address {0}")]
    NotMapped(VirtualAddress),
    #[error("access to {0} violates the page's permissions")]
    ProtectionViolation(VirtualAddress),
    #[error("reserved bit set in the tables for {0}")]
    ReservedBit(VirtualAddress),
    #[error("user-mode access to kernel address {0}")]
    KernelAddressFromUser(VirtualAddress),
    #[error("no frame to back {0}")]
    OutOfMemory(VirtualAddress),
}

/// What the trap should do next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// Return to the faulting instruction.
    Resolved,
    /// Stack or buffer overflow into a guard page.
    GuardPage { address: VirtualAddress },
    Fatal(FatalFault),
}

impl<M: PhysMapper, T: Tlb> VirtualMemoryManager<M, T> {
    /// Resolve a fault at `va` in `ctx`, committing lazily reserved pages.
    #[must_use]
    pub fn handle_page_fault<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        error: PageFaultError,
    ) -> FaultOutcome {
        let outcome = self.resolve(frames, ctx, va, error);
        match outcome {
            FaultOutcome::Resolved => trace!("page fault at {va} resolved"),
            _ => debug!("page fault at {va} ({}): {outcome:?}", error.explain()),
        }
        outcome
    }

    fn resolve<A: FrameAlloc>(
        &self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        error: PageFaultError,
    ) -> FaultOutcome {
        if error.reserved_bit() {
            return FaultOutcome::Fatal(FatalFault::ReservedBit(va));
        }
        if error.user() && !va.is_lower_half() {
            return FaultOutcome::Fatal(FatalFault::KernelAddressFromUser(va));
        }
        if error.present() {
            return FaultOutcome::Fatal(FatalFault::ProtectionViolation(va));
        }
        if !va.is_canonical() {
            return FaultOutcome::Fatal(FatalFault::NotMapped(va));
        }

        let page = va.page::<Size4K>().base();
        let space = self.space(ctx.root());
        let Some(entry) = space.leaf_entry(page) else {
            return FaultOutcome::Fatal(FatalFault::NotMapped(va));
        };
        match entry.state() {
            PageState::Guard => FaultOutcome::GuardPage { address: va },
            PageState::Unmapped => FaultOutcome::Fatal(FatalFault::NotMapped(va)),
            PageState::Committed => {
                self.tlb().invalidate(page);
                FaultOutcome::Resolved
            }
            PageState::Reserved => {
                let denied = (error.user() && !entry.user())
                    || (error.write() && !entry.writable())
                    || (error.instruction_fetch() && entry.no_execute());
                if denied {
                    return FaultOutcome::Fatal(FatalFault::ProtectionViolation(va));
                }
                match self.commit(&space, frames, page, entry) {
                    Ok(()) => FaultOutcome::Resolved,
                    Err(VmmError::OutOfPhysicalMemory(_)) => FaultOutcome::Fatal(FatalFault::OutOfMemory(va)),
                    Err(_) => FaultOutcome::Fatal(FatalFault::NotMapped(va)),
                }
            }
        }
    }
}

/// Trap glue: read CR2 and CR3 and dispatch to the global memory manager.
///
/// The interrupt stub restarts the faulting instruction on
/// [`FaultOutcome::Resolved`] and kills the current thread otherwise.
///
/// # Safety
/// Must only be called from the #PF handler with the error code the CPU pushed.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn page_fault_entry(error_code: u64) -> FaultOutcome {
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;
    use kernel_registers::cr3::Cr3;

    let va = unsafe { Cr2::load_unsafe() }.fault_address();
    let root = unsafe { Cr3::load_unsafe() }.root();
    let error = PageFaultError::from_bits(error_code);
    match crate::manager::MemoryManager::global() {
        Some(mm) => mm.handle_page_fault(root, va, error),
        None => {
            log::error!("page fault at {va} before the memory manager exists: {}", error.explain());
            FaultOutcome::Fatal(FatalFault::NotMapped(va))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_decode() {
        let e = PageFaultError::from_bits(0b0000_0111);
        assert!(e.present() && e.write() && e.user());
        assert_eq!(e.explain(), "Write access to protected page");

        let fetch = PageFaultError::new().with_present(true).with_instruction_fetch(true).with_user(true);
        assert_eq!(fetch.into_bits(), 0b1_0101);
        assert!(fetch.explain().contains("NX"));

        assert!(PageFaultError::from_bits(0).explain().starts_with("Non-present"));
        assert!(PageFaultError::from_bits(0b1001).explain().starts_with("Reserved"));
    }
}
