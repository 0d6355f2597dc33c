//! # Memory Manager
//!
//! The one object the rest of the kernel talks to: the frame allocator and
//! the virtual memory manager behind their locks, plus the kernel context.
//!
//! ## Lock Order
//!
//! Every operation that needs both takes the VMM lock first, then the frame
//! lock. Both locks keep interrupts disabled while held, so the page-fault
//! path can take them as well.
//!
//! ## Bring-up
//!
//! ```text
//! boot alias (BOOT_WINDOW_SIZE) ──► frame allocator over the alias
//!                                         │
//!              adopt CR3 as kernel ◄──────┘
//!                     │
//!                     ▼
//!        install the full physical window ──► extend frame coverage
//! ```

use crate::error::{FrameAllocError, MemoryInitError, VmmError};
use crate::fault::{FaultOutcome, PageFaultError};
use crate::frame_alloc::PhysicalAllocator;
use crate::phys_mapper::DirectMap;
use crate::vmm::{Context, ContextKind, MapFlags, PageStatus, VirtualMemoryManager};
use kernel_info::boot::{KernelImage, MemoryMap};
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::{BOOT_WINDOW_SIZE, PHYS_WINDOW_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{IrqSpinLock, SyncOnceCell};
use kernel_vmem::{CpuTlb, PhysMapper, Tlb};
use log::info;

/// Frame accounting snapshot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total: u64,
    pub free: u64,
    /// Held in the allocator's emergency reserve, part of `free`.
    pub reserved: u64,
    /// Used for the allocator's own tree nodes, part of `free`.
    pub metadata: u64,
}

pub struct MemoryManager<M: PhysMapper + Clone = DirectMap, T: Tlb = CpuTlb> {
    vmm: IrqSpinLock<VirtualMemoryManager<M, T>>,
    frames: IrqSpinLock<PhysicalAllocator<M>>,
    kernel: Context,
}

static GLOBAL: SyncOnceCell<MemoryManager> = SyncOnceCell::new();

impl<M: PhysMapper + Clone, T: Tlb> MemoryManager<M, T> {
    #[must_use]
    pub const fn new(vmm: VirtualMemoryManager<M, T>, kernel: Context, frames: PhysicalAllocator<M>) -> Self {
        Self {
            vmm: IrqSpinLock::new(vmm),
            frames: IrqSpinLock::new(frames),
            kernel,
        }
    }

    /// Bring up both managers from the boot memory map.
    ///
    /// `window(limit)` builds a mapper for physical `[0, limit)`.
    ///
    /// # Safety
    /// `root` must be the active PML4 and the first [`BOOT_WINDOW_SIZE`] bytes
    /// of physical memory must already be reachable through `window`.
    ///
    /// # Errors
    /// Any [`MemoryInitError`]; the kernel cannot continue without memory.
    pub unsafe fn boot(
        map: &MemoryMap<'_>,
        image: KernelImage,
        root: PhysicalPage<Size4K>,
        caps: CpuCapabilities,
        tlb: T,
        window: impl Fn(PhysicalAddress) -> M,
    ) -> Result<Self, MemoryInitError> {
        let alias = window(PhysicalAddress::new(BOOT_WINDOW_SIZE));
        let mut frames = PhysicalAllocator::init(map, image, alias.clone())?;
        let (mut vmm, kernel) = unsafe { VirtualMemoryManager::adopt(alias, root, caps, tlb, &mut frames)? };

        let end = map.highest_usable_end().as_u64().clamp(BOOT_WINDOW_SIZE, PHYS_WINDOW_SIZE);
        let end = PhysicalAddress::new(end);
        vmm.install_physical_window(&mut frames, end)?;

        let full = window(end);
        vmm.replace_mapper(full.clone());
        frames.extend_coverage(map, image, full);
        info!(
            "memory manager up: {} of {} frames free",
            frames.free_frames(),
            frames.total_frames()
        );
        Ok(Self::new(vmm, kernel, frames))
    }

    #[inline]
    #[must_use]
    pub const fn kernel_context(&self) -> &Context {
        &self.kernel
    }

    /// Run `f` with both managers locked in order.
    fn with_both<R>(&self, f: impl FnOnce(&mut VirtualMemoryManager<M, T>, &mut PhysicalAllocator<M>) -> R) -> R {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        f(&mut vmm, &mut frames)
    }

    /// # Errors
    /// [`FrameAllocError::OutOfPhysicalMemory`].
    pub fn alloc_frame(&self) -> Result<PhysicalAddress, FrameAllocError> {
        self.frames.lock().alloc()
    }

    /// # Errors
    /// See [`PhysicalAllocator::alloc_dma`].
    pub fn alloc_dma(&self, max_address: PhysicalAddress, count: u64) -> Result<PhysicalAddress, FrameAllocError> {
        self.frames.lock().alloc_dma(max_address, count)
    }

    /// # Errors
    /// See [`PhysicalAllocator::free`].
    pub fn free_frame(&self, addr: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.frames.lock().free(addr)
    }

    /// # Errors
    /// See [`PhysicalAllocator::free_contiguous`].
    pub fn free_dma(&self, addr: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        self.frames.lock().free_contiguous(addr, count)
    }

    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.frames.lock().total_frames()
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.frames.lock().free_frames()
    }

    #[must_use]
    pub fn frame_stats(&self) -> FrameStats {
        let frames = self.frames.lock();
        FrameStats {
            total: frames.total_frames(),
            free: frames.free_frames(),
            reserved: frames.reserved_frames(),
            metadata: frames.metadata_frames(),
        }
    }

    /// Audit the frame allocator.
    ///
    /// # Panics
    /// On any inconsistency.
    pub fn check_frames(&self) {
        self.frames.lock().check_invariants();
    }

    /// # Errors
    /// See [`VirtualMemoryManager::map`].
    pub fn map(
        &self,
        ctx: &Context,
        hint: Option<VirtualAddress>,
        phys: Option<PhysicalAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.with_both(|vmm, frames| vmm.map(frames, ctx, hint, phys, pages, flags))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::map_guarded`].
    pub fn map_guarded(
        &self,
        ctx: &Context,
        hint: Option<VirtualAddress>,
        phys: Option<PhysicalAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.with_both(|vmm, frames| vmm.map_guarded(frames, ctx, hint, phys, pages, flags))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::unmap`].
    pub fn unmap(&self, ctx: &Context, va: VirtualAddress, pages: u64, free_frames: bool) -> Result<u64, VmmError> {
        self.with_both(|vmm, frames| vmm.unmap(frames, ctx, va, pages, free_frames))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::unmap_guarded`].
    pub fn unmap_guarded(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Result<u64, VmmError> {
        self.with_both(|vmm, frames| vmm.unmap_guarded(frames, ctx, va, pages, free_frames))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::remap`].
    pub fn remap(
        &self,
        src_ctx: &Context,
        src: VirtualAddress,
        dst_ctx: &Context,
        dst: Option<VirtualAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.with_both(|vmm, frames| vmm.remap(frames, src_ctx, src, dst_ctx, dst, pages, flags))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::use_pages`].
    pub fn use_pages(&self, ctx: &Context, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.with_both(|vmm, frames| vmm.use_pages(frames, ctx, va, pages))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::unuse_pages`].
    pub fn unuse_pages(&self, ctx: &Context, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.with_both(|vmm, frames| vmm.unuse_pages(frames, ctx, va, pages))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::alloc`].
    pub fn alloc(&self, ctx: &Context, pages: u64, flags: MapFlags) -> Result<VirtualAddress, VmmError> {
        self.with_both(|vmm, frames| vmm.alloc(frames, ctx, pages, flags))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::sysalloc`].
    pub fn sysalloc(&self, pages: u64) -> Result<VirtualAddress, VmmError> {
        self.with_both(|vmm, frames| vmm.sysalloc(frames, pages))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::sysfree`].
    pub fn sysfree(&self, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.with_both(|vmm, frames| vmm.sysfree(frames, va, pages))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::phys_addr_of`].
    pub fn phys_addr_of(&self, ctx: &Context, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        self.vmm.lock().phys_addr_of(ctx, va)
    }

    #[must_use]
    pub fn page_status(&self, ctx: &Context, va: VirtualAddress) -> PageStatus {
        self.vmm.lock().page_status(ctx, va)
    }

    /// # Errors
    /// See [`VirtualMemoryManager::create_context`].
    pub fn create_context(&self) -> Result<Context, VmmError> {
        self.with_both(|vmm, frames| vmm.create_context(frames))
    }

    /// # Errors
    /// See [`VirtualMemoryManager::delete_context`].
    pub fn delete_context(&self, ctx: Context) -> Result<u64, (VmmError, Context)> {
        self.with_both(|vmm, frames| vmm.delete_context(frames, ctx))
    }

    /// Resolve a fault in the translation tree rooted at `root`, the value of
    /// CR3 when the fault hit.
    #[must_use]
    pub fn handle_page_fault(&self, root: PhysicalPage<Size4K>, va: VirtualAddress, error: PageFaultError) -> FaultOutcome {
        let kind = if root == self.kernel.root() {
            ContextKind::Kernel
        } else {
            ContextKind::User
        };
        let ctx = Context::new(root, kind);
        self.with_both(|vmm, frames| vmm.handle_page_fault(frames, &ctx, va, error))
    }

    /// Whether a user-supplied buffer lies entirely in the user half.
    #[must_use]
    pub const fn userspace_pointer_valid(ptr: VirtualAddress, len: u64) -> bool {
        crate::vmm::userspace_pointer_valid(ptr, len)
    }
}

impl MemoryManager {
    /// Publish the kernel's memory manager; see [`global`](Self::global).
    ///
    /// # Errors
    /// Hands `self` back when one was already installed.
    pub fn install(self) -> Result<(), Self> {
        GLOBAL.set(self)
    }

    #[inline]
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// Boot the memory manager on the running CPU and install it.
    ///
    /// # Safety
    /// See [`boot`](Self::boot); CR3 is taken as the kernel root.
    ///
    /// # Errors
    /// See [`boot`](Self::boot). A second call fails with the already
    /// installed manager left in place.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn init_global(
        map: &MemoryMap<'_>,
        image: KernelImage,
        caps: CpuCapabilities,
    ) -> Result<(), MemoryInitError> {
        let root = unsafe { kernel_vmem::tlb::active_root() };
        let mm = unsafe { Self::boot(map, image, root, caps, CpuTlb, DirectMap::with_coverage)? };
        mm.install().map_err(|_| MemoryInitError::AlreadyInstalled)
    }
}
