//! Error types of the physical and virtual memory managers.

use kernel_info::boot::MemoryMapError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("invalid physical address {0}")]
    InvalidAddress(PhysicalAddress),
    #[error("invalid frame count {0}")]
    InvalidFrameCount(u64),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocInitError {
    #[error("malformed memory map: {0}")]
    Malformed(#[from] MemoryMapError),
    #[error("the memory map has no usable frame above the kernel image")]
    NoUsableMemory,
}

/// Failure while bringing the memory manager up; fatal at boot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryInitError {
    #[error(transparent)]
    Frames(#[from] FrameAllocInitError),
    #[error("cannot set up the kernel context: {0}")]
    Vmm(#[from] VmmError),
    #[error("a memory manager is already installed")]
    AlreadyInstalled,
}

/// What a frame was needed for when physical memory ran out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocationPurpose {
    /// Page contents; the caller may recover.
    Data,
    /// A page-table level; the mapping cannot proceed.
    PageTable,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory while allocating a {0:?} frame")]
    OutOfPhysicalMemory(AllocationPurpose),
    #[error("no free virtual range of the requested size")]
    AddressSpaceExhausted,
    #[error("invalid virtual address {0}")]
    InvalidAddress(VirtualAddress),
    #[error("invalid physical address {0}")]
    InvalidPhysicalAddress(PhysicalAddress),
    #[error("invalid length")]
    InvalidLength,
    #[error("virtual address {0} is already in use")]
    AddressInUse(VirtualAddress),
    #[error("virtual address {0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("the kernel context cannot be deleted")]
    KernelContext,
}

impl VmmError {
    /// Whether the failure hit kernel-critical bookkeeping rather than the
    /// caller's own request.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::OutOfPhysicalMemory(AllocationPurpose::PageTable))
    }
}

/// Internal inconsistencies of the frame allocator. These are bugs, so they
/// are logged and turned into a panic instead of being returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocatorInvariantViolation {
    #[error("frame {0} freed while already free")]
    DoubleFree(PhysicalAddress),
    #[error("frame {0} was never handed out by the frame allocator")]
    ForeignFrame(PhysicalAddress),
    #[error("tree node is full although it should have been split")]
    NodeOverflow,
    #[error("emergency reserve has no frame for a tree node")]
    ReserveExhausted,
    #[error("emergency reserve has no slot left")]
    ReserveFull,
    #[error("tree grew beyond {0} levels")]
    DepthExceeded(u8),
    #[error("free-range tree is corrupt: {0}")]
    CorruptTree(&'static str),
}

#[cold]
#[track_caller]
pub(crate) fn violation(v: AllocatorInvariantViolation) -> ! {
    error!("frame allocator invariant violated: {v}");
    panic!("{v}");
}
