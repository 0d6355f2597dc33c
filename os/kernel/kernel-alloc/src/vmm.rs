//! # Virtual Memory Manager
//!
//! The allocate / map / unmap / remap contract on top of the page-table
//! walker. Every virtual page of a context is in one of these states:
//!
//! ```text
//!            map (lazy)            first touch / use_pages
//! Unmapped ──────────────► Reserved ─────────────────────► Committed
//!    │  ▲                     ▲  │                           │  │
//!    │  │   unmap             │  └───────── unmap ──────┐    │  │
//!    │  └─────────────────────┼────────────────────────┴────┘  │
//!    │                        └──────── unuse_pages ───────────┘
//!    │ map_guarded
//!    ▼
//!  Guard ── unmap_guarded ──► Unmapped
//! ```
//!
//! A guard page never becomes committed; touching it is fatal (see
//! [`crate::fault`]).
//!
//! The manager owns no frames. Callers pass the frame allocator in, which
//! keeps the lock order visible at the call site: VMM first, then frames.
//! Methods that change tables take `&mut self` so a lock around the manager
//! serializes them.

mod context;
mod flags;

pub use context::{Context, ContextKind};
pub use flags::{MapFlags, PageStatus};

use crate::error::{AllocationPurpose, VmmError};
use flags::BORROWED;
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::{
    GUARD_PAGES, KERNEL_ARENA_END, KERNEL_ARENA_START, KERNEL_HALF_FIRST_SLOT, KERNEL_SHARED_SLOTS, PHYS_WINDOW_BASE,
    PHYS_WINDOW_SIZE, TABLE_ENTRIES, USERSPACE_END, USERSPACE_START,
};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{
    AddressSpace, CpuTlb, EntryFlags, FrameAlloc, Level, MapError, PageEntry, PageState, PhysMapper, PhysMapperExt,
    SoftBits, Tlb, Translation,
};
use log::{debug, error, info, warn};

const PAGE: u64 = Size4K::SIZE;
const GUARD_BYTES: u64 = GUARD_PAGES * PAGE;

pub struct VirtualMemoryManager<M: PhysMapper, T: Tlb = CpuTlb> {
    mapper: M,
    kernel_root: PhysicalPage<Size4K>,
    caps: CpuCapabilities,
    tlb: T,
}

/// What clearing a range touched.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
struct Cleared {
    freed: u64,
    borrowed: u64,
}

impl<M: PhysMapper, T: Tlb> VirtualMemoryManager<M, T> {
    /// Take over `root` as the kernel context.
    ///
    /// Creates the second-level tables of the shared kernel slots so every
    /// context created later sees the same kernel half.
    ///
    /// # Safety
    /// `root` must be a PML4 reachable through `mapper` that nothing else
    /// edits from now on.
    ///
    /// # Errors
    /// [`VmmError::OutOfPhysicalMemory`] when a shared table cannot be allocated.
    pub unsafe fn adopt<A: FrameAlloc>(
        mapper: M,
        root: PhysicalPage<Size4K>,
        caps: CpuCapabilities,
        tlb: T,
        frames: &mut A,
    ) -> Result<(Self, Context), VmmError> {
        let vmm = Self {
            mapper,
            kernel_root: root,
            caps,
            tlb,
        };
        let space = vmm.space(root);
        for slot in KERNEL_SHARED_SLOTS {
            space
                .ensure_pdpt(frames, slot)
                .map_err(|e| table_error(e, slot_address(slot)))?;
        }
        info!("kernel context adopted at {}, shared slots {KERNEL_SHARED_SLOTS:?}", root.base());
        Ok((vmm, Context::new(root, ContextKind::Kernel)))
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Swap in a mapper with a larger window once it is installed.
    pub fn replace_mapper(&mut self, mapper: M) -> M {
        core::mem::replace(&mut self.mapper, mapper)
    }

    #[inline]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    #[inline]
    pub const fn caps(&self) -> &CpuCapabilities {
        &self.caps
    }

    #[inline]
    pub const fn kernel_root(&self) -> PhysicalPage<Size4K> {
        self.kernel_root
    }

    #[inline]
    pub(crate) fn space(&self, root: PhysicalPage<Size4K>) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, root, self.caps)
    }

    /// Map physical `[0, end)` at [`PHYS_WINDOW_BASE`] in the kernel context.
    ///
    /// Uses 1 GiB leaves when the CPU has them, 2 MiB leaves otherwise; global
    /// when supported, never executable. Parts already mapped (the boot alias)
    /// are kept. Returns the number of leaves written.
    ///
    /// # Errors
    /// [`VmmError::OutOfPhysicalMemory`] for a missing table frame,
    /// [`VmmError::InvalidPhysicalAddress`] when `end` exceeds the window.
    pub fn install_physical_window<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        end: PhysicalAddress,
    ) -> Result<u64, VmmError> {
        if end.as_u64() > PHYS_WINDOW_SIZE {
            return Err(VmmError::InvalidPhysicalAddress(end));
        }
        let level = if self.caps.huge_1g { Level::Pdpt } else { Level::Pd };
        let flags = EntryFlags::table(false)
            .with_global(self.caps.global_pages)
            .with_no_execute(true);

        let space = self.space(self.kernel_root);
        let mut leaves = 0;
        let mut pa = 0;
        while pa < end.as_u64() {
            leaves += window_span(&space, frames, level, pa, flags)?;
            pa += level.span();
        }
        info!("physical window installed: [0, {end}) with {leaves} leaves at {level:?}");
        Ok(leaves)
    }

    /// Reserve or map `pages` pages in `ctx`.
    ///
    /// - With `hint`, exactly `[hint, hint + pages)` is used and must be
    ///   unmapped; otherwise the lowest free run in the user half
    ///   (`flags.user`) or the kernel arena is chosen.
    /// - With `phys`, the pages map `[phys, phys + pages)` and are never
    ///   returned to the frame allocator.
    /// - Otherwise `flags.allocate` decides between zeroed frames now and a
    ///   lazy reservation backed on first touch.
    ///
    /// On failure every entry and frame this call created is released again.
    ///
    /// # Errors
    /// [`VmmError::InvalidLength`], [`VmmError::InvalidAddress`],
    /// [`VmmError::InvalidPhysicalAddress`], [`VmmError::AddressInUse`],
    /// [`VmmError::AddressSpaceExhausted`], [`VmmError::OutOfPhysicalMemory`].
    pub fn map<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        hint: Option<VirtualAddress>,
        phys: Option<PhysicalAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        let va = self.map_in(frames, ctx.root(), hint, phys, pages, 0, flags)?;
        debug!("map {ctx:?} {va} +{pages} pages, phys={phys:?}, {flags:?}");
        Ok(va)
    }

    /// [`map`](Self::map) with [`GUARD_PAGES`] guard pages on each side.
    ///
    /// `hint` and the returned address are the first usable page.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_guarded<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        hint: Option<VirtualAddress>,
        phys: Option<PhysicalAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        let hint = hint
            .map(|va| va.checked_sub(GUARD_BYTES).ok_or(VmmError::InvalidAddress(va)))
            .transpose()?;
        let base = self.map_in(frames, ctx.root(), hint, phys, pages, GUARD_PAGES, flags)?;
        let va = base + GUARD_BYTES;
        debug!("map guarded {ctx:?} {va} +{pages} pages, {flags:?}");
        Ok(va)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_in<A: FrameAlloc>(
        &self,
        frames: &mut A,
        root: PhysicalPage<Size4K>,
        hint: Option<VirtualAddress>,
        phys: Option<PhysicalAddress>,
        pages: u64,
        guard: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        if pages == 0 {
            return Err(VmmError::InvalidLength);
        }
        let total = pages.checked_add(2 * guard).ok_or(VmmError::InvalidLength)?;
        if let Some(pa) = phys {
            check_physical(pa, pages)?;
        }

        let space = self.space(root);
        let base = place(&space, hint, total, flags.user)?;
        for i in 0..total {
            let va = base + i * PAGE;
            let written = if i < guard || i >= guard + pages {
                space
                    .write_leaf(frames, va, flags.guard(), PhysicalAddress::zero())
                    .map(drop)
                    .map_err(|e| table_error(e, va))
            } else {
                self.populate(&space, frames, va, phys.map(|pa| pa + (i - guard) * PAGE), flags)
            };
            if let Err(e) = written {
                self.clear_range(&space, frames, base, i, true);
                return Err(e);
            }
        }
        Ok(base)
    }

    /// Write one usable page of a new mapping.
    fn populate<A: FrameAlloc>(
        &self,
        space: &AddressSpace<'_, M>,
        frames: &mut A,
        va: VirtualAddress,
        phys: Option<PhysicalAddress>,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        match phys {
            Some(pa) => space
                .write_leaf(frames, va, flags.committed().with_soft(BORROWED), pa)
                .map(drop)
                .map_err(|e| table_error(e, va)),
            None if flags.allocate => {
                let frame = frames
                    .alloc_4k()
                    .ok_or(VmmError::OutOfPhysicalMemory(AllocationPurpose::Data))?;
                self.mapper.zero_frame(frame);
                match space.write_leaf(frames, va, flags.committed(), frame.base()) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        frames.free_4k(frame);
                        Err(table_error(e, va))
                    }
                }
            }
            None => space
                .write_leaf(frames, va, flags.reserved(), PhysicalAddress::zero())
                .map(drop)
                .map_err(|e| table_error(e, va)),
        }
    }

    /// Clear every entry of `[base, base + pages)` and release tables that
    /// became empty. Owned frames go back to `frames` when `free_frames`.
    fn clear_range<A: FrameAlloc>(
        &self,
        space: &AddressSpace<'_, M>,
        frames: &mut A,
        base: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Cleared {
        let mut cleared = Cleared::default();
        let end = base.as_u64() + pages * PAGE;
        let mut va = base.as_u64();
        while va < end {
            let addr = VirtualAddress::new(va);
            let span = match space.lookup(addr) {
                Translation::Leaf {
                    level: Level::Pt,
                    entry,
                } => {
                    if !entry.is_zero() {
                        space.clear_leaf(addr);
                        self.release(frames, addr, entry, free_frames, &mut cleared);
                    }
                    PAGE
                }
                // Huge leaves belong to the physical window and stay.
                Translation::Missing(level) | Translation::Leaf { level, .. } => level.span(),
            };
            va = (va | (span - 1)).saturating_add(1);
        }

        let table_span = Level::Pd.span();
        let mut va = base.as_u64() & !(table_span - 1);
        while va < end {
            space.prune(frames, VirtualAddress::new(va));
            va = va.saturating_add(table_span);
        }
        cleared
    }

    fn release<A: FrameAlloc>(
        &self,
        frames: &mut A,
        va: VirtualAddress,
        entry: PageEntry,
        free_frames: bool,
        cleared: &mut Cleared,
    ) {
        if !entry.present() {
            return;
        }
        self.tlb.invalidate(va);
        if entry.soft().borrowed() {
            cleared.borrowed += 1;
        } else if free_frames {
            frames.free_4k(entry.frame_page());
            cleared.freed += 1;
        }
    }

    /// Remove `[va, va + pages)` from `ctx`.
    ///
    /// Reserved and guard entries are simply cleared; committed frames are
    /// returned to `frames` when `free_frames` is set, unless they were
    /// supplied by the caller of [`map`](Self::map). Unmapping a range with
    /// nothing in it is a no-op. Returns the number of frames freed.
    ///
    /// # Errors
    /// [`VmmError::InvalidLength`] or [`VmmError::InvalidAddress`] for a
    /// malformed range.
    pub fn unmap<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Result<u64, VmmError> {
        self.unmap_in(frames, ctx.root(), va, pages, free_frames)
    }

    fn unmap_in<A: FrameAlloc>(
        &self,
        frames: &mut A,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Result<u64, VmmError> {
        range_end(va, pages)?;
        let cleared = self.clear_range(&self.space(root), frames, va, pages, free_frames);
        if free_frames && cleared.borrowed > 0 {
            warn!("unmap {va} +{pages}: {} borrowed frames left to their owner", cleared.borrowed);
        }
        debug!("unmap {va} +{pages} pages: {} frames freed", cleared.freed);
        Ok(cleared.freed)
    }

    /// Undo a [`map_guarded`](Self::map_guarded), guard pages included.
    ///
    /// # Errors
    /// [`VmmError::InvalidAddress`] when the range is not bracketed by guard pages.
    pub fn unmap_guarded<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Result<u64, VmmError> {
        self.unmap_guarded_in(frames, ctx.root(), va, pages, free_frames)
    }

    fn unmap_guarded_in<A: FrameAlloc>(
        &self,
        frames: &mut A,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> Result<u64, VmmError> {
        let start = va.checked_sub(GUARD_BYTES).ok_or(VmmError::InvalidAddress(va))?;
        let end = range_end(va, pages)?;
        range_end(end, GUARD_PAGES)?;

        let space = self.space(root);
        let is_guard = |at: VirtualAddress| space.leaf_entry(at).map(PageEntry::state) == Some(PageState::Guard);
        if !(0..GUARD_PAGES).all(|g| is_guard(start + g * PAGE) && is_guard(end + g * PAGE)) {
            return Err(VmmError::InvalidAddress(va));
        }
        self.unmap_in(frames, root, start, pages + 2 * GUARD_PAGES, free_frames)
    }

    /// Move `pages` committed pages from `src` in `src_ctx` to `dst_ctx`.
    ///
    /// Frames change owner without being freed or allocated; frames the
    /// source borrowed stay borrowed. `dst` works like the hint of
    /// [`map`](Self::map) and `flags` sets the new permissions.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] when a source page is not committed (nothing
    /// is changed then), otherwise as [`map`](Self::map).
    #[allow(clippy::too_many_arguments)]
    pub fn remap<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        src_ctx: &Context,
        src: VirtualAddress,
        dst_ctx: &Context,
        dst: Option<VirtualAddress>,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        range_end(src, pages)?;
        let from = self.space(src_ctx.root());
        let to = self.space(dst_ctx.root());

        let committed = |va: VirtualAddress| from.leaf_entry(va).filter(|e| e.present()).ok_or(VmmError::NotMapped(va));
        for i in 0..pages {
            committed(src + i * PAGE)?;
        }

        let base = place(&to, dst, pages, flags.user)?;
        for i in 0..pages {
            let va = base + i * PAGE;
            let moved = committed(src + i * PAGE).and_then(|entry| {
                let soft = if entry.soft().borrowed() { BORROWED } else { SoftBits::NONE };
                to.write_leaf(frames, va, flags.committed().with_soft(soft), entry.physical_address())
                    .map(drop)
                    .map_err(|e| table_error(e, va))
            });
            if let Err(e) = moved {
                self.clear_range(&to, frames, base, i, false);
                return Err(e);
            }
        }
        self.clear_range(&from, frames, src, pages, false);
        debug!("remap {src_ctx:?} {src} -> {dst_ctx:?} {base} +{pages} pages");
        Ok(base)
    }

    /// Back every reserved page of `[va, va + pages)` with a zeroed frame.
    ///
    /// Committed pages are left alone. Returns the number of pages committed.
    /// Pages committed before an allocation failure stay committed.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] when a page is neither reserved nor committed
    /// (checked before anything changes), [`VmmError::OutOfPhysicalMemory`].
    pub fn use_pages<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
    ) -> Result<u64, VmmError> {
        range_end(va, pages)?;
        let space = self.space(ctx.root());
        for i in 0..pages {
            let at = va + i * PAGE;
            match space.leaf_entry(at).map(PageEntry::state) {
                Some(PageState::Reserved | PageState::Committed) => {}
                _ => return Err(VmmError::NotMapped(at)),
            }
        }

        let mut committed = 0;
        for i in 0..pages {
            let at = va + i * PAGE;
            if let Some(entry) = space.leaf_entry(at).filter(|e| e.state() == PageState::Reserved) {
                self.commit(&space, frames, at, entry)?;
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Turn the reserved entry `entry` at `va` into a committed one.
    pub(crate) fn commit<A: FrameAlloc>(
        &self,
        space: &AddressSpace<'_, M>,
        frames: &mut A,
        va: VirtualAddress,
        entry: PageEntry,
    ) -> Result<(), VmmError> {
        let frame = frames
            .alloc_4k()
            .ok_or(VmmError::OutOfPhysicalMemory(AllocationPurpose::Data))?;
        self.mapper.zero_frame(frame);
        let flags = entry.flags().with_present(true).with_soft(SoftBits::NONE);
        match space.rewrite_leaf(va, flags, frame.base()) {
            Some(Ok(_)) => Ok(()),
            _ => {
                frames.free_4k(frame);
                Err(VmmError::InvalidAddress(va))
            }
        }
    }

    /// Give the frames of `[va, va + pages)` back while keeping the
    /// reservation and its permissions. Returns the number of frames freed.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] for pages that are neither committed nor
    /// reserved, [`VmmError::InvalidAddress`] for pages with a borrowed
    /// frame. Nothing changes in either case.
    pub fn unuse_pages<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
    ) -> Result<u64, VmmError> {
        range_end(va, pages)?;
        let space = self.space(ctx.root());
        for i in 0..pages {
            let at = va + i * PAGE;
            match space.leaf_entry(at) {
                Some(e) if e.present() && e.soft().borrowed() => return Err(VmmError::InvalidAddress(at)),
                Some(e) if matches!(e.state(), PageState::Reserved | PageState::Committed) => {}
                _ => return Err(VmmError::NotMapped(at)),
            }
        }

        let mut freed = 0;
        for i in 0..pages {
            let at = va + i * PAGE;
            let Some(entry) = space.leaf_entry(at).filter(|e| e.present()) else {
                continue;
            };
            let lazy = MapFlags::of_entry(entry).reserved();
            if let Some(Ok(_)) = space.rewrite_leaf(at, lazy, PhysicalAddress::zero()) {
                self.tlb.invalidate(at);
                frames.free_4k(entry.frame_page());
                freed += 1;
            }
        }
        debug!("unuse {ctx:?} {va} +{pages} pages: {freed} frames freed");
        Ok(freed)
    }

    /// Anonymous user memory in `ctx`, lazily backed unless `flags.allocate`.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn alloc<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        ctx: &Context,
        pages: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.map(frames, ctx, None, None, pages, flags.with_user(true))
    }

    /// Guarded, zeroed, writable kernel memory from the kernel arena.
    ///
    /// # Errors
    /// [`VmmError::OutOfPhysicalMemory`] for data frames and
    /// [`VmmError::AddressSpaceExhausted`].
    ///
    /// # Panics
    /// When a page table cannot be allocated.
    pub fn sysalloc<A: FrameAlloc>(&mut self, frames: &mut A, pages: u64) -> Result<VirtualAddress, VmmError> {
        let flags = MapFlags::KERNEL_DATA.with_allocate(true);
        match self.map_in(frames, self.kernel_root, None, None, pages, GUARD_PAGES, flags) {
            Ok(base) => Ok(base + GUARD_BYTES),
            Err(e) if e.is_critical() => {
                error!("kernel allocation of {pages} pages failed: {e}");
                panic!("kernel allocation of {pages} pages failed: {e}");
            }
            Err(e) => Err(e),
        }
    }

    /// Release a [`sysalloc`](Self::sysalloc) result.
    ///
    /// # Errors
    /// As [`unmap_guarded`](Self::unmap_guarded).
    pub fn sysfree<A: FrameAlloc>(&mut self, frames: &mut A, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.unmap_guarded_in(frames, self.kernel_root, va, pages, true)
    }

    /// Physical address `va` translates to in `ctx`.
    ///
    /// # Errors
    /// [`VmmError::InvalidAddress`] for non-canonical addresses,
    /// [`VmmError::NotMapped`] when nothing is committed there.
    pub fn phys_addr_of(&self, ctx: &Context, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        if !va.is_canonical() {
            return Err(VmmError::InvalidAddress(va));
        }
        self.space(ctx.root()).query(va).ok_or(VmmError::NotMapped(va))
    }

    #[must_use]
    pub fn page_status(&self, ctx: &Context, va: VirtualAddress) -> PageStatus {
        if !va.is_canonical() {
            return PageStatus::Unmapped;
        }
        let translation = self.space(ctx.root()).lookup(va);
        match translation {
            Translation::Missing(_) => PageStatus::Unmapped,
            Translation::Leaf { level, entry } => match entry.state() {
                PageState::Unmapped => PageStatus::Unmapped,
                PageState::Reserved => PageStatus::Reserved,
                PageState::Guard => PageStatus::Guard,
                PageState::Committed => {
                    let pa = translation.physical(va).unwrap_or(PhysicalAddress::zero());
                    PageStatus::committed(entry, level, pa.align_down::<Size4K>())
                }
            },
        }
    }

    /// A new user context sharing the kernel half.
    ///
    /// # Errors
    /// [`VmmError::OutOfPhysicalMemory`] for the root table.
    pub fn create_context<A: FrameAlloc>(&mut self, frames: &mut A) -> Result<Context, VmmError> {
        let root = frames
            .alloc_4k()
            .ok_or(VmmError::OutOfPhysicalMemory(AllocationPurpose::PageTable))?;
        self.mapper.zero_frame(root);

        let kernel = self.space(self.kernel_root);
        let user = self.space(root);
        for slot in KERNEL_HALF_FIRST_SLOT..TABLE_ENTRIES {
            user.set_pml4_entry(slot, kernel.pml4_entry(slot));
        }
        debug!("context created at {}", root.base());
        Ok(Context::new(root, ContextKind::User))
    }

    /// Free every owned frame and table of a user context, then its root.
    ///
    /// The context must not be active on any CPU. Returns the number of page
    /// frames freed, tables not counted.
    ///
    /// # Errors
    /// [`VmmError::KernelContext`]; the context is handed back untouched.
    pub fn delete_context<A: FrameAlloc>(&mut self, frames: &mut A, ctx: Context) -> Result<u64, (VmmError, Context)> {
        if ctx.is_kernel() {
            return Err((VmmError::KernelContext, ctx));
        }
        let mut freed = 0;
        let tables = self
            .space(ctx.root())
            .teardown(frames, 0..KERNEL_HALF_FIRST_SLOT, |frames, _, level, entry| {
                if level == Level::Pt && entry.present() && !entry.soft().borrowed() {
                    frames.free_4k(entry.frame_page());
                    freed += 1;
                }
            });
        frames.free_4k(ctx.root());
        debug!("{ctx:?} deleted: {freed} frames and {} tables freed", tables + 1);
        Ok(freed)
    }
}

/// Whether `[ptr, ptr + len)` lies entirely in the user half.
#[must_use]
pub const fn userspace_pointer_valid(ptr: VirtualAddress, len: u64) -> bool {
    let start = ptr.as_u64();
    match start.checked_add(len) {
        Some(end) => start >= USERSPACE_START && end <= USERSPACE_END,
        None => false,
    }
}

/// Canonical address of PML4 slot `slot`.
const fn slot_address(slot: usize) -> VirtualAddress {
    kernel_vmem::address_space::slot_base(slot)
}

/// Exclusive end of `pages` pages at `va`, validated.
fn range_end(va: VirtualAddress, pages: u64) -> Result<VirtualAddress, VmmError> {
    if pages == 0 {
        return Err(VmmError::InvalidLength);
    }
    if !va.is_aligned::<Size4K>() || !va.is_canonical() {
        return Err(VmmError::InvalidAddress(va));
    }
    let end = pages
        .checked_mul(PAGE)
        .and_then(|len| va.checked_add(len))
        .ok_or(VmmError::InvalidLength)?;
    if va.is_lower_half() && end.as_u64() > USERSPACE_END {
        return Err(VmmError::InvalidAddress(va));
    }
    Ok(end)
}

/// Where new mappings may go.
const fn window(user: bool) -> (VirtualAddress, VirtualAddress) {
    if user {
        (VirtualAddress::new(USERSPACE_START), VirtualAddress::new(USERSPACE_END))
    } else {
        (VirtualAddress::new(KERNEL_ARENA_START), VirtualAddress::new(KERNEL_ARENA_END))
    }
}

/// Pick the base of `pages` new pages: the hint if it is free, else the
/// lowest free run of the window.
fn place<M: PhysMapper>(
    space: &AddressSpace<'_, M>,
    hint: Option<VirtualAddress>,
    pages: u64,
    user: bool,
) -> Result<VirtualAddress, VmmError> {
    let (lo, hi) = window(user);
    match hint {
        Some(va) => {
            let end = range_end(va, pages)?;
            if va < lo || end > hi {
                return Err(VmmError::InvalidAddress(va));
            }
            space.check_free(va, pages).map_err(VmmError::AddressInUse)?;
            Ok(va)
        }
        None => space.find_free(lo, hi, pages).ok_or(VmmError::AddressSpaceExhausted),
    }
}

fn check_physical(pa: PhysicalAddress, pages: u64) -> Result<(), VmmError> {
    let last = pages
        .checked_sub(1)
        .and_then(|n| n.checked_mul(PAGE))
        .and_then(|len| pa.checked_add(len));
    match last {
        Some(last) if pa.is_aligned::<Size4K>() && last.is_representable() => Ok(()),
        _ => Err(VmmError::InvalidPhysicalAddress(pa)),
    }
}

fn table_error(e: MapError, va: VirtualAddress) -> VmmError {
    match e {
        MapError::OutOfMemory(_) => VmmError::OutOfPhysicalMemory(AllocationPurpose::PageTable),
        MapError::HugeLeafInTheWay(_) => VmmError::AddressInUse(va),
        MapError::Entry(_) => VmmError::InvalidAddress(va),
    }
}

/// Map one `level` sized span of the physical window at `pa`, descending
/// where a finer mapping already exists.
fn window_span<M: PhysMapper, A: FrameAlloc>(
    space: &AddressSpace<'_, M>,
    frames: &mut A,
    level: Level,
    pa: u64,
    flags: EntryFlags,
) -> Result<u64, VmmError> {
    let va = VirtualAddress::new(PHYS_WINDOW_BASE + pa);
    match space.lookup(va) {
        Translation::Missing(missing) if missing <= level => {
            space
                .map_huge(frames, level, va, PhysicalAddress::new(pa), flags)
                .map_err(|e| table_error(e, va))?;
            Ok(1)
        }
        Translation::Leaf { level: found, entry } if found <= level && entry.present() => Ok(0),
        _ => {
            let Some(next) = level.next() else {
                return Ok(0);
            };
            let mut leaves = 0;
            for i in 0..TABLE_ENTRIES as u64 {
                let sub = pa + i * next.span();
                if next == Level::Pt {
                    let at = VirtualAddress::new(PHYS_WINDOW_BASE + sub);
                    if space.leaf_entry(at).is_some_and(PageEntry::is_zero) {
                        space
                            .write_leaf(frames, at, flags.with_present(true), PhysicalAddress::new(sub))
                            .map_err(|e| table_error(e, at))?;
                        leaves += 1;
                    }
                } else {
                    leaves += window_span(space, frames, next, sub, flags)?;
                }
            }
            Ok(leaves)
        }
    }
}
