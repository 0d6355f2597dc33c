use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Who an address space belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextKind {
    /// The one context built at boot; lives as long as the kernel.
    Kernel,
    /// A process address space from [`create_context`](super::VirtualMemoryManager::create_context).
    User,
}

/// An address space: the PML4 frame of one translation tree.
///
/// The upper half of every user context shares the kernel's second-level
/// tables. A `Context` is deliberately neither `Copy` nor `Clone`: handing it
/// to [`delete_context`](super::VirtualMemoryManager::delete_context) ends it.
#[derive(PartialEq, Eq)]
pub struct Context {
    root: PhysicalPage<Size4K>,
    kind: ContextKind,
}

impl Context {
    pub(crate) const fn new(root: PhysicalPage<Size4K>, kind: ContextKind) -> Self {
        Self { root, kind }
    }

    /// PML4 frame, as loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, ContextKind::Kernel)
    }

    /// Make this context the active one on the executing CPU.
    ///
    /// # Safety
    /// See [`kernel_vmem::tlb::switch_root`].
    pub unsafe fn activate(&self) {
        unsafe { kernel_vmem::tlb::switch_root(self.root) }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({:?}, root={})", self.kind, self.root.base())
    }
}
