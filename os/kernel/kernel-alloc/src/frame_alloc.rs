//! # Physical Frame Allocator
//!
//! Free physical memory is kept as power-of-two sized, naturally aligned
//! ranges in a B-tree ([`tree`]) keyed by `(size_exp, page_number)`. The
//! tree is self-hosting: its non-root nodes occupy frames taken from the very
//! pool it indexes.
//!
//! ```text
//!   alloc_dma(ceiling, n) ──► smallest size class ≥ n, lowest start that fits
//!            │                    │
//!            │                    └─► remainder reinserted as aligned pieces
//!            ▼
//!   free(addr) ──► buddy lookup by exact key, merge while possible, insert
//! ```
//!
//! ## Node Frames and the Emergency Reserve
//!
//! A split needs a fresh frame. Those come from a small [`reserve`] of
//! ranges held outside the tree, which is refilled from the largest tree
//! range and drained back into the tree after every public operation.
//! Inserting when the reserve is short parks ranges in the reserve instead
//! of the tree, so an insertion never needs more frames than it has.
//!
//! Merges during deletion release node frames into the reserve, so a tree
//! that shrinks gives its metadata back.
//!
//! ## Accounting
//!
//! `free_frames` counts every managed frame not handed out by
//! [`PhysicalAllocator::alloc_dma`]: tree ranges, reserve ranges and node
//! frames. `total_frames` grows when [`PhysicalAllocator::extend_coverage`]
//! brings more memory in.
//!
//! Every inserted extent is recorded ([`MAX_EXTENTS`] disjoint extents at
//! most, neighbours merged). Frees outside the recorded extents are rejected,
//! so memory the allocator never owned cannot enter the pool.

mod boot;
mod extents;
mod node;
mod range_key;
mod reserve;
mod tree;

pub use extents::MAX_EXTENTS;
pub use range_key::{MAX_EXP, RangeKey};
pub use reserve::RESERVE_HIGH;
pub use tree::MAX_DEPTH;

use crate::error::{AllocatorInvariantViolation as Violation, FrameAllocError, FrameAllocInitError, violation};
use kernel_info::boot::{KernelImage, MemoryMap};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use extents::Extents;
use log::{debug, error, info, trace, warn};
use range_key::{aligned_pieces, exp_for};
use reserve::Reserve;
use tree::RangeTree;

const _: () = assert!(2 * (MAX_DEPTH as u64 + 2) <= RESERVE_HIGH);

/// Unlimited DMA ceiling.
pub const NO_CEILING: PhysicalAddress = PhysicalAddress::MAX;

pub struct PhysicalAllocator<M: PhysMapper> {
    tree: RangeTree,
    reserve: Reserve,
    extents: Extents,
    mapper: M,
    /// Frames below this page number have been offered to the allocator.
    limit: u64,
    total: u64,
    allocated: u64,
}

impl<M: PhysMapper> PhysicalAllocator<M> {
    /// An allocator without any memory.
    pub const fn new(mapper: M) -> Self {
        Self {
            tree: RangeTree::new(),
            reserve: Reserve::new(),
            extents: Extents::new(),
            mapper,
            limit: 0,
            total: 0,
            allocated: 0,
        }
    }

    /// Build the allocator from the boot memory map.
    ///
    /// Only frames `mapper` reaches are inserted; see [`extend_coverage`](Self::extend_coverage).
    ///
    /// # Errors
    /// [`FrameAllocInitError::NoUsableMemory`] when nothing could be inserted.
    pub fn init(map: &MemoryMap<'_>, image: KernelImage, mapper: M) -> Result<Self, FrameAllocInitError> {
        let mut pfa = Self::new(mapper);
        if pfa.add_extents(map, image, 0) == 0 {
            error!("memory map {map:?} has no usable frame above {:?}", image.end);
            return Err(FrameAllocInitError::NoUsableMemory);
        }
        info!(
            "frame allocator ready: {} frames below {}, {} node frames, {} in reserve",
            pfa.total,
            pfa.mapper.coverage(),
            pfa.metadata_frames(),
            pfa.reserved_frames()
        );
        Ok(pfa)
    }

    /// [`init`](Self::init) from the raw record buffer of the boot loader.
    ///
    /// # Errors
    /// [`FrameAllocInitError::Malformed`] for a buffer that is not a whole
    /// number of records, otherwise as [`init`](Self::init).
    pub fn init_from_bytes(raw: &[u8], image: KernelImage, mapper: M) -> Result<Self, FrameAllocInitError> {
        let map = MemoryMap::from_bytes(raw)?;
        Self::init(&map, image, mapper)
    }

    /// Switch to a mapper with a larger window and insert the usable frames
    /// it newly reaches. Returns the number of frames added.
    pub fn extend_coverage(&mut self, map: &MemoryMap<'_>, image: KernelImage, mapper: M) -> u64 {
        let from = self.limit << Size4K::SHIFT;
        self.mapper = mapper;
        let added = self.add_extents(map, image, from);
        info!(
            "frame allocator coverage extended to {}: {added} frames added, {} total",
            self.mapper.coverage(),
            self.total
        );
        added
    }

    fn add_extents(&mut self, map: &MemoryMap<'_>, image: KernelImage, from: u64) -> u64 {
        let to = self.mapper.coverage().as_u64();
        let mut added = 0;
        boot::usable_extents(map, image, from, to, |start, end| {
            if !self.extents.add(start >> Size4K::SHIFT, end >> Size4K::SHIFT) {
                warn!("more than {MAX_EXTENTS} disjoint extents, leaving [{start:#x}, {end:#x}) unused");
                return;
            }
            trace!("inserting free extent [{start:#x}, {end:#x})");
            for piece in aligned_pieces(start >> Size4K::SHIFT, end >> Size4K::SHIFT) {
                self.release(piece);
                added += piece.frames();
            }
        });
        self.total += added;
        self.limit = self.limit.max(to >> Size4K::SHIFT);
        self.settle();
        added
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.total - self.allocated
    }

    /// Frames parked in the emergency reserve.
    #[inline]
    #[must_use]
    pub const fn reserved_frames(&self) -> u64 {
        self.reserve.frames()
    }

    /// Frames holding tree nodes.
    #[inline]
    #[must_use]
    pub const fn metadata_frames(&self) -> u64 {
        self.tree.node_frames()
    }

    /// Disjoint physical extents under management.
    #[inline]
    #[must_use]
    pub const fn managed_extents(&self) -> usize {
        self.extents.count()
    }

    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u8 {
        self.tree.depth()
    }

    /// One frame anywhere in physical memory.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfPhysicalMemory`].
    pub fn alloc(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        self.alloc_dma(NO_CEILING, 1)
    }

    /// `count` physically contiguous frames ending at or below `max_address`.
    ///
    /// The smallest size class that holds `count` frames wins; within a class
    /// the lowest start address that stays below the ceiling. Ranges in the
    /// tree are preferred over the emergency reserve.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidFrameCount`] for zero or impossibly large counts.
    /// - [`FrameAllocError::OutOfPhysicalMemory`] when no range below the
    ///   ceiling is big enough, regardless of memory above it.
    pub fn alloc_dma(&mut self, max_address: PhysicalAddress, count: u64) -> Result<PhysicalAddress, FrameAllocError> {
        if count == 0 || count > 1 << MAX_EXP {
            return Err(FrameAllocError::InvalidFrameCount(count));
        }
        let exp = exp_for(count) as u8;
        let ceiling = max_address.as_u64() >> Size4K::SHIFT;
        let fits = |k: RangeKey| k.exp() >= exp && k.page().checked_add(count).is_some_and(|end| end <= ceiling);

        let key = if let Some(key) = self.first_fit(exp, &fits) {
            self.remove_from_tree(key);
            key
        } else if let Some(key) = self.reserve.best_fit(fits) {
            self.reserve.remove(key);
            key
        } else {
            debug!("no {count} contiguous frames below {max_address} ({} free)", self.free_frames());
            return Err(FrameAllocError::OutOfPhysicalMemory);
        };

        for piece in aligned_pieces(key.page() + count, key.end_page()) {
            self.insert(piece);
        }
        self.allocated += count;
        self.settle();
        Ok(key.base())
    }

    /// Lowest fitting key of the smallest fitting size class `>= exp`.
    fn first_fit(&self, exp: u8, fits: &impl Fn(RangeKey) -> bool) -> Option<RangeKey> {
        let mut class = exp;
        while class <= MAX_EXP {
            let candidate = self.tree.ceiling(&self.mapper, RangeKey::class_start(class))?;
            if fits(candidate) {
                return Some(candidate);
            }
            // `candidate` has the lowest start of its class, so nothing
            // else in the class fits either.
            class = candidate.exp() + 1;
        }
        None
    }

    /// Return one frame.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidAddress`] for unaligned or null addresses and
    /// for frames outside the usable memory the allocator was built from,
    /// such as the kernel image or reserved holes.
    ///
    /// # Panics
    /// When the frame is already free.
    pub fn free(&mut self, addr: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.free_contiguous(addr, 1)
    }

    /// Return `count` frames starting at `addr`, e.g. an [`alloc_dma`](Self::alloc_dma) result.
    ///
    /// # Errors
    /// As [`free`](Self::free), plus [`FrameAllocError::InvalidFrameCount`].
    ///
    /// # Panics
    /// When any part of the range is already free.
    pub fn free_contiguous(&mut self, addr: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::InvalidFrameCount(count));
        }
        if !addr.is_aligned::<Size4K>() || addr.as_u64() == 0 {
            return Err(FrameAllocError::InvalidAddress(addr));
        }
        let first = addr.frame_number();
        let end = first
            .checked_add(count)
            .filter(|end| self.extents.contains(first, *end))
            .ok_or(FrameAllocError::InvalidAddress(addr))?;
        if count > self.allocated {
            violation(Violation::DoubleFree(addr));
        }

        for piece in aligned_pieces(first, end) {
            if self.is_free(piece.page()) {
                violation(Violation::DoubleFree(piece.base()));
            }
            self.release(piece);
        }
        self.allocated -= count;
        self.settle();
        Ok(())
    }

    /// Whether `page` lies in any free range.
    fn is_free(&self, page: u64) -> bool {
        (0..=MAX_EXP).any(|exp| self.tree.contains(&self.mapper, RangeKey::enclosing(page, exp)))
            || self.reserve.covers(page)
    }

    /// Put a range back, merging it with free buddies first.
    fn release(&mut self, mut key: RangeKey) {
        while let Some(buddy) = key.buddy() {
            if !self.remove_from_tree(buddy) && !self.reserve.remove(buddy) {
                break;
            }
            key = key.parent();
        }
        self.insert(key);
    }

    /// Insert into the tree once the reserve can pay for the splits, or park
    /// the range in the reserve when nothing larger can be moved there.
    fn insert(&mut self, key: RangeKey) {
        while self.reserve.frames() < self.tree.split_budget() {
            match self.tree.max(&self.mapper) {
                Some(max) if max.frames() > key.frames() => {
                    self.remove_from_tree(max);
                    self.reserve.push(max);
                }
                _ => {
                    self.reserve.push(key);
                    return;
                }
            }
        }
        self.tree_insert(key);
    }

    fn tree_insert(&mut self, key: RangeKey) {
        let reserve = &mut self.reserve;
        self.tree.insert(&self.mapper, key, || {
            reserve.take().unwrap_or_else(|| violation(Violation::ReserveExhausted))
        });
    }

    fn remove_from_tree(&mut self, key: RangeKey) -> bool {
        let reserve = &mut self.reserve;
        self.tree.remove(&self.mapper, key, |frame| reserve.push(RangeKey::of(frame.number(), 0)))
    }

    /// Bring the reserve back between one split budget and [`RESERVE_HIGH`].
    fn settle(&mut self) {
        loop {
            let budget = self.tree.split_budget();
            let frames = self.reserve.frames();
            if frames < budget {
                let Some(max) = self.tree.max(&self.mapper) else {
                    break;
                };
                trace!("reserve at {frames} frames, taking {max} from the tree");
                self.remove_from_tree(max);
                self.reserve.push(max);
            } else if frames > RESERVE_HIGH {
                let Some(largest) = self.reserve.largest() else {
                    break;
                };
                if frames - largest.frames() > 2 * budget {
                    self.reserve.remove(largest);
                    self.coalesce_into_tree(largest);
                } else if !self.reserve.halve_largest() {
                    break;
                }
            } else {
                break;
            }
        }
    }

    /// Tree-only buddy merge, used when draining the reserve.
    fn coalesce_into_tree(&mut self, mut key: RangeKey) {
        while let Some(buddy) = key.buddy() {
            if !self.remove_from_tree(buddy) {
                break;
            }
            key = key.parent();
        }
        self.tree_insert(key);
    }

    /// Visit every free range as `(start, frames)`: tree ranges in key order,
    /// then reserve ranges.
    pub fn free_ranges(&self, mut f: impl FnMut(PhysicalAddress, u64)) {
        self.tree.for_each(&self.mapper, &mut |k| f(k.base(), k.frames()));
        for k in self.reserve.ranges() {
            f(k.base(), k.frames());
        }
    }

    /// Audit the tree and the frame accounting.
    ///
    /// # Panics
    /// On any inconsistency.
    pub fn check_invariants(&self) {
        self.tree.check(&self.mapper);
        let mut in_ranges = 0;
        self.free_ranges(|_, frames| in_ranges += frames);
        if in_ranges + self.metadata_frames() + self.allocated != self.total {
            violation(Violation::CorruptTree("frame accounting does not add up"));
        }
    }
}

impl<M: PhysMapper> FrameAlloc for PhysicalAllocator<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc().ok().map(PhysicalPage::containing)
    }

    /// Page tables and committed pages only ever come from this allocator,
    /// so a rejected frame means the ownership model is broken.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.free(frame.base()) {
            error!("cannot return {frame:?} to the frame allocator: {e}");
            violation(Violation::ForeignFrame(frame.base()));
        }
    }
}
