//! # Page-Table Walker
//!
//! Pure manipulation of the x86-64 4-level translation tree. Nothing in here
//! decides *what* to map; callers (the virtual memory manager) pass frames in
//! through [`FrameAlloc`] and reach table frames through a [`PhysMapper`].
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//!
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//!             │        └─ PS=1 → 2 MiB leaf
//!             └────────── PS=1 → 1 GiB leaf
//! ```
//!
//! Levels are numbered top-down ([`Level::Pml4`] = 0 … [`Level::Pt`] = 3).
//!
//! ## Software State in Not-Present Entries
//!
//! When `P=0` the hardware ignores every other bit. The three low
//! (bits 9..12) and eleven high (bits 52..63) *available* bits form a 14-bit
//! AVL field ([`SoftBits`]) that records what the kernel knows about a page
//! that is not (yet) backed:
//!
//! | P | AVL | State |
//! |---|-----|-------|
//! | 0 | 0 (whole entry zero) | never reserved ([`PageState::Unmapped`]) |
//! | 0 | `unused` | reserved, frame allocated on first touch ([`PageState::Reserved`]) |
//! | 0 | `guard` | guard page, every access is fatal ([`PageState::Guard`]) |
//! | 1 | anything but `unused` | backed by a frame ([`PageState::Committed`]) |
//!
//! A present entry never carries `unused`. `borrowed` marks frames the
//! caller supplied (MMIO, frame buffers) that must not be returned to the
//! frame allocator.
//!
//! ## The Physical Window
//!
//! Every table frame is reached through the [`PhysMapper`] capability. In the
//! kernel this is a window mapping all physical memory at a fixed virtual
//! offset; in tests it is plain host memory.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod entry;
pub mod page_table;
pub mod tlb;

pub use crate::address_space::{AddressSpace, MapError, Translation};
pub use crate::entry::{EntryFlags, PageEntry, PageState, SoftBits};
pub use crate::page_table::{EntryError, Level, PageTable, TableIndex, clear_entry, set_entry};
pub use crate::tlb::{CpuTlb, Tlb, flush_all, invalidate};

pub use kernel_info::cpu::CpuCapabilities;
pub use kernel_memory_addresses as addresses;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of zero-or-more 4 KiB frames for page tables and page contents.
pub trait FrameAlloc {
    /// One frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Give a frame obtained from [`alloc_4k`](Self::alloc_4k) back.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }
}

/// Turns physical addresses into references in the current address space.
pub trait PhysMapper {
    /// Borrow the `T` stored at physical address `pa`.
    ///
    /// # Safety
    /// - `pa` must lie below [`coverage`](Self::coverage) and be aligned for `T`.
    /// - The bytes at `pa` must be a valid `T`, and no other live reference may
    ///   alias them mutably for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Exclusive upper bound of the physical memory this mapper reaches.
    fn coverage(&self) -> PhysicalAddress;

    /// Whether the whole frame is reachable.
    #[inline]
    fn reaches(&self, frame: PhysicalPage<Size4K>) -> bool {
        frame.base().as_u64() < self.coverage().as_u64()
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }

    fn coverage(&self) -> PhysicalAddress {
        (**self).coverage()
    }
}

/// Table-typed access on top of a [`PhysMapper`].
///
/// The aliasing between "page table" and "addressable memory" is confined to
/// these accessors.
pub trait PhysMapperExt: PhysMapper {
    #[inline]
    fn read_table<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a PageTable {
        debug_assert!(self.reaches(frame), "table {frame:?} outside the physical window");
        // SAFETY: table frames are only ever created zeroed through `write_table`.
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    #[inline]
    fn write_table<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        debug_assert!(self.reaches(frame), "table {frame:?} outside the physical window");
        // SAFETY: as above; the caller serializes access through the VMM lock.
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Fill a frame with zeros.
    #[inline]
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        debug_assert!(self.reaches(frame), "frame {frame:?} outside the physical window");
        // SAFETY: any 4 KiB frame is a valid `[u8; 4096]`.
        let bytes = unsafe { self.phys_to_mut::<[u8; 4096]>(frame.base()) };
        bytes.fill(0);
    }
}

impl<M: PhysMapper + ?Sized> PhysMapperExt for M {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// One 4 KiB-aligned frame of simulated RAM.
    #[repr(C, align(4096))]
    pub struct Aligned4K([u8; 4096]);

    /// Simulated physical memory starting at physical address zero.
    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            frames.resize_with(n, || Aligned4K([0; 4096]));
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = usize::try_from(pa.frame_number()).expect("frame index");
            let off = usize::try_from(pa.offset_in::<Size4K>()).expect("offset");
            let base = self.frames[idx].0.as_ptr().cast_mut();
            unsafe { &mut *base.add(off).cast::<T>() }
        }

        fn coverage(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.frames.len() as u64 * 4096)
        }
    }

    /// Hands out frames `[next, end)` in order and records what comes back.
    pub struct BumpAlloc {
        next: u64,
        end: u64,
        pub freed: Vec<PhysicalPage<Size4K>>,
    }

    impl BumpAlloc {
        pub fn new(first_frame: u64, end_frame: u64) -> Self {
            Self {
                next: first_frame,
                end: end_frame,
                freed: Vec::new(),
            }
        }

        pub fn handed_out(&self) -> u64 {
            self.next
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let frame = PhysicalPage::from_number(self.next);
            self.next += 1;
            Some(frame)
        }

        fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
            self.freed.push(frame);
        }
    }
}
