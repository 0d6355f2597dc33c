#![allow(dead_code)]

use kernel_alloc::frame_alloc::PhysicalAllocator;
use kernel_alloc::vmm::{Context, VirtualMemoryManager};
use kernel_info::boot::{KernelImage, MemoryMap, MemoryMapEntry};
use kernel_info::cpu::CpuCapabilities;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{PhysMapper, Tlb};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const FRAME: u64 = 4096;

/// Low RAM: boot tables below 1 MiB, the kernel image up to 2 MiB, then
/// 4 MiB of usable memory.
pub const LOW_RAM_END: u64 = 0x60_0000;
pub const BOOT_ROOT: u64 = 0x1000;
pub const IMAGE_START: u64 = 0x10_0000;
pub const IMAGE_END: u64 = 0x20_0000;
/// 1 MiB of usable memory above 4 GiB.
pub const HIGH_RAM_START: u64 = 0x1_0000_0000;
pub const HIGH_RAM_END: u64 = 0x1_0010_0000;

pub const STANDARD_MAP: [MemoryMapEntry; 4] = [
    MemoryMapEntry::reserved(0, IMAGE_START),
    MemoryMapEntry::reserved(IMAGE_START, IMAGE_END - IMAGE_START),
    MemoryMapEntry::usable(IMAGE_END, LOW_RAM_END - IMAGE_END),
    MemoryMapEntry::usable(HIGH_RAM_START, HIGH_RAM_END - HIGH_RAM_START),
];

pub const STANDARD_FRAMES: u64 = (LOW_RAM_END - IMAGE_END + HIGH_RAM_END - HIGH_RAM_START) / FRAME;

pub fn image() -> KernelImage {
    KernelImage::new(PhysicalAddress::new(IMAGE_START), PhysicalAddress::new(IMAGE_END))
}

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

struct Region {
    base: u64,
    frames: Vec<Aligned4K>,
}

/// Simulated physical memory made of disjoint zero-filled regions.
pub struct SparseRam {
    regions: Vec<Region>,
}

impl SparseRam {
    pub fn new(extents: &[(u64, u64)]) -> Self {
        let regions = extents
            .iter()
            .map(|&(base, end)| {
                assert_eq!(base % FRAME, 0);
                let n = usize::try_from((end - base) / FRAME).expect("region size");
                let mut frames = Vec::with_capacity(n);
                frames.resize_with(n, || Aligned4K([0; 4096]));
                Region { base, frames }
            })
            .collect();
        Self { regions }
    }

    /// RAM backing [`STANDARD_MAP`].
    pub fn standard() -> Self {
        Self::new(&[(0, LOW_RAM_END), (HIGH_RAM_START, HIGH_RAM_END)])
    }

    /// The whole RAM.
    pub fn view(&self) -> RamView<'_> {
        let end = self
            .regions
            .iter()
            .map(|r| r.base + r.frames.len() as u64 * FRAME)
            .max()
            .unwrap_or(0);
        self.view_below(PhysicalAddress::new(end))
    }

    /// Only `[0, limit)`, like a partially installed physical window.
    pub fn view_below(&self, limit: PhysicalAddress) -> RamView<'_> {
        RamView { ram: self, limit }
    }

    fn frame_ptr(&self, pa: u64) -> *mut u8 {
        let region = self
            .regions
            .iter()
            .find(|r| pa >= r.base && pa < r.base + r.frames.len() as u64 * FRAME)
            .unwrap_or_else(|| panic!("{pa:#x} is not backed by simulated RAM"));
        let idx = usize::try_from((pa - region.base) / FRAME).expect("frame index");
        let off = usize::try_from(pa % FRAME).expect("offset");
        unsafe { region.frames[idx].0.as_ptr().cast_mut().add(off) }
    }

    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        unsafe { self.frame_ptr(pa.as_u64()).cast::<u64>().read() }
    }

    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        unsafe { self.frame_ptr(pa.as_u64()).cast::<u64>().write(value) }
    }

    /// Fill a whole frame, e.g. to check that it is zeroed before reuse.
    pub fn scribble(&self, frame: PhysicalAddress) {
        for i in 0..FRAME / 8 {
            self.write_u64(frame + i * 8, 0xDEAD_BEEF_DEAD_BEEF);
        }
    }

    pub fn is_zero(&self, frame: PhysicalAddress) -> bool {
        (0..FRAME / 8).all(|i| self.read_u64(frame + i * 8) == 0)
    }
}

#[derive(Copy, Clone)]
pub struct RamView<'a> {
    ram: &'a SparseRam,
    limit: PhysicalAddress,
}

impl PhysMapper for RamView<'_> {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert!(pa < self.limit, "{pa} is outside the mapped window");
        unsafe { &mut *self.ram.frame_ptr(pa.as_u64()).cast::<T>() }
    }

    fn coverage(&self) -> PhysicalAddress {
        self.limit
    }
}

/// Records invalidations instead of executing them.
#[derive(Default)]
pub struct RecordingTlb {
    invalidated: Mutex<Vec<VirtualAddress>>,
    flushes: AtomicU64,
}

impl RecordingTlb {
    pub fn saw(&self, va: VirtualAddress) -> bool {
        self.invalidated.lock().expect("poisoned").contains(&va)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidated.lock().expect("poisoned").len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Tlb for RecordingTlb {
    fn invalidate(&self, va: VirtualAddress) {
        self.invalidated.lock().expect("poisoned").push(va);
    }

    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

pub type TestVmm<'a> = VirtualMemoryManager<RamView<'a>, RecordingTlb>;
pub type TestFrames<'a> = PhysicalAllocator<RamView<'a>>;

/// Frame allocator over [`STANDARD_MAP`].
pub fn frames(ram: &SparseRam) -> TestFrames<'_> {
    PhysicalAllocator::init(&MemoryMap::from_entries(&STANDARD_MAP), image(), ram.view()).expect("frame allocator")
}

/// Frame allocator and VMM over [`STANDARD_MAP`], with the boot tables'
/// empty PML4 at [`BOOT_ROOT`] adopted as the kernel context.
pub fn machine(ram: &SparseRam, caps: CpuCapabilities) -> (TestVmm<'_>, TestFrames<'_>, Context) {
    let mut frames = frames(ram);
    let root = PhysicalPage::<Size4K>::from_number(BOOT_ROOT / FRAME);
    let (vmm, kernel) = unsafe { VirtualMemoryManager::adopt(ram.view(), root, caps, RecordingTlb::default(), &mut frames) }
        .expect("adopt");
    (vmm, frames, kernel)
}

/// Whether `pa` is a frame the standard map declares usable.
pub fn is_usable(pa: PhysicalAddress) -> bool {
    let pa = pa.as_u64();
    (IMAGE_END..LOW_RAM_END).contains(&pa) || (HIGH_RAM_START..HIGH_RAM_END).contains(&pa)
}
