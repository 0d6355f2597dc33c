mod common;

use common::{FRAME, HIGH_RAM_END, HIGH_RAM_START, RecordingTlb, STANDARD_FRAMES, SparseRam};
use kernel_alloc::error::MemoryInitError;
use kernel_alloc::fault::{FaultOutcome, PageFaultError};
use kernel_alloc::manager::MemoryManager;
use kernel_alloc::vmm::{MapFlags, PageStatus};
use kernel_info::boot::{MemoryMap, MemoryMapEntry};
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::PHYS_WINDOW_BASE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use std::thread;

type TestManager<'a> = MemoryManager<common::RamView<'a>, RecordingTlb>;

fn boot<'a>(ram: &'a SparseRam, map: &MemoryMap<'_>) -> Result<TestManager<'a>, MemoryInitError> {
    let root = PhysicalPage::<Size4K>::from_number(common::BOOT_ROOT / FRAME);
    unsafe {
        MemoryManager::boot(
            map,
            common::image(),
            root,
            CpuCapabilities::ALL,
            RecordingTlb::default(),
            |limit| ram.view_below(limit),
        )
    }
}

#[test]
fn boot_reaches_memory_beyond_the_boot_window() {
    let ram = SparseRam::standard();
    let mm = boot(&ram, &MemoryMap::from_entries(&common::STANDARD_MAP)).expect("boot");

    let stats = mm.frame_stats();
    assert_eq!(stats.total, STANDARD_FRAMES, "the frames above 4 GiB were added");
    assert!(stats.free < stats.total, "page tables were taken");
    mm.check_frames();

    let kernel = mm.kernel_context();
    let high = VirtualAddress::new(PHYS_WINDOW_BASE + HIGH_RAM_START);
    assert_eq!(mm.phys_addr_of(kernel, high), Ok(PhysicalAddress::new(HIGH_RAM_START)));
    assert!(matches!(
        mm.page_status(kernel, VirtualAddress::new(PHYS_WINDOW_BASE + HIGH_RAM_END - FRAME)),
        PageStatus::Committed { borrowed: false, .. }
    ));
}

#[test]
fn boot_without_memory_fails() {
    let ram = SparseRam::standard();
    let nothing = [MemoryMapEntry::reserved(0, HIGH_RAM_END)];
    assert!(matches!(
        boot(&ram, &MemoryMap::from_entries(&nothing)),
        Err(MemoryInitError::Frames(_))
    ));
}

#[test]
fn faults_are_resolved_in_the_context_that_took_them() {
    let ram = SparseRam::standard();
    let mm = boot(&ram, &MemoryMap::from_entries(&common::STANDARD_MAP)).expect("boot");

    let kernel_page = mm
        .map(mm.kernel_context(), None, None, 1, MapFlags::KERNEL_DATA)
        .expect("kernel lazy");
    let write = PageFaultError::new().with_write(true);
    assert_eq!(
        mm.handle_page_fault(mm.kernel_context().root(), kernel_page, write),
        FaultOutcome::Resolved
    );

    let user = mm.create_context().expect("context");
    let heap = mm.alloc(&user, 2, MapFlags::USER_DATA).expect("heap");
    assert_eq!(
        mm.handle_page_fault(user.root(), heap, write.with_user(true)),
        FaultOutcome::Resolved
    );
    assert!(mm.page_status(&user, heap).is_committed());
    assert_eq!(mm.page_status(mm.kernel_context(), heap), PageStatus::Unmapped);

    assert_eq!(mm.delete_context(user).map_err(|(e, _)| e), Ok(1));
    assert_eq!(mm.unmap(mm.kernel_context(), kernel_page, 1, true), Ok(1));
    mm.check_frames();
}

#[test]
fn frames_can_be_shared_between_threads() {
    let ram = SparseRam::standard();
    let mm = boot(&ram, &MemoryMap::from_entries(&common::STANDARD_MAP)).expect("boot");
    let free = mm.free_frames();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..64 {
                    let frame = mm.alloc_frame().expect("frame");
                    let stack = mm.sysalloc(1).expect("sysalloc");
                    mm.sysfree(stack, 1).expect("sysfree");
                    mm.free_frame(frame).expect("free");
                }
            });
        }
    });

    assert_eq!(mm.free_frames(), free);
    mm.check_frames();
}

#[test]
fn dma_buffers_round_trip() {
    let ram = SparseRam::standard();
    let mm = boot(&ram, &MemoryMap::from_entries(&common::STANDARD_MAP)).expect("boot");
    let free = mm.free_frames();

    let buf = mm.alloc_dma(PhysicalAddress::new(HIGH_RAM_START), 16).expect("dma");
    assert!(buf.as_u64() + 16 * FRAME <= HIGH_RAM_START);
    assert_eq!(mm.free_frames(), free - 16);
    mm.free_dma(buf, 16).expect("free");
    assert_eq!(mm.free_frames(), free);
}

#[test]
fn user_pointer_validation_is_exposed() {
    assert!(TestManager::userspace_pointer_valid(VirtualAddress::new(0x40_0000), 8));
    assert!(!TestManager::userspace_pointer_valid(VirtualAddress::new(PHYS_WINDOW_BASE), 8));
}
