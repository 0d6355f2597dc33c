mod common;

use common::{FRAME, SparseRam};
use kernel_alloc::fault::{FatalFault, FaultOutcome, PageFaultError};
use kernel_alloc::vmm::{MapFlags, PageStatus};
use kernel_info::cpu::CpuCapabilities;
use kernel_info::memory::KERNEL_ARENA_START;
use kernel_memory_addresses::VirtualAddress;

fn read() -> PageFaultError {
    PageFaultError::new()
}

fn user_write() -> PageFaultError {
    PageFaultError::new().with_user(true).with_write(true)
}

#[test]
fn first_touch_commits_a_zeroed_frame() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, _kernel) = common::machine(&ram, CpuCapabilities::ALL);
    let user = vmm.create_context(&mut frames).expect("context");
    let heap = vmm.alloc(&mut frames, &user, 4, MapFlags::USER_DATA).expect("alloc");
    let before = frames.free_frames();

    let at = heap + 2 * FRAME + 0x18;
    assert_eq!(vmm.handle_page_fault(&mut frames, &user, at, user_write()), FaultOutcome::Resolved);
    assert_eq!(frames.free_frames(), before - 1);

    let PageStatus::Committed { frame, writable, user: u, .. } = vmm.page_status(&user, at) else {
        panic!("the faulting page is committed");
    };
    assert!(writable && u);
    assert!(ram.is_zero(frame));
    assert_eq!(vmm.page_status(&user, heap), PageStatus::Reserved, "neighbours stay lazy");

    // A second CPU faulting on the same page finds it already committed.
    assert_eq!(vmm.handle_page_fault(&mut frames, &user, at, user_write()), FaultOutcome::Resolved);
    assert_eq!(frames.free_frames(), before - 1);
}

#[test]
fn guard_pages_are_reported() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, kernel) = common::machine(&ram, CpuCapabilities::ALL);
    let stack = vmm.sysalloc(&mut frames, 2).expect("stack");

    let overflow = stack - 8;
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, overflow, PageFaultError::new().with_write(true)),
        FaultOutcome::GuardPage { address: overflow }
    );
    assert_eq!(vmm.page_status(&kernel, overflow), PageStatus::Guard, "guards are never backed");
}

#[test]
fn unmapped_addresses_are_fatal() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, kernel) = common::machine(&ram, CpuCapabilities::ALL);

    let nowhere = VirtualAddress::new(KERNEL_ARENA_START + 0x5000);
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, nowhere, read()),
        FaultOutcome::Fatal(FatalFault::NotMapped(nowhere))
    );

    let hole = VirtualAddress::new(0x0000_9000_0000_0000);
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, hole, read()),
        FaultOutcome::Fatal(FatalFault::NotMapped(hole))
    );
}

#[test]
fn permissions_are_checked_before_committing() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, kernel) = common::machine(&ram, CpuCapabilities::ALL);
    let user = vmm.create_context(&mut frames).expect("context");

    let code = vmm.alloc(&mut frames, &user, 1, MapFlags::USER_CODE).expect("code");
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &user, code, user_write()),
        FaultOutcome::Fatal(FatalFault::ProtectionViolation(code))
    );
    assert_eq!(vmm.page_status(&user, code), PageStatus::Reserved, "nothing was committed");

    let data = vmm.alloc(&mut frames, &user, 1, MapFlags::USER_DATA).expect("data");
    let fetch = PageFaultError::new().with_user(true).with_instruction_fetch(true);
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &user, data, fetch),
        FaultOutcome::Fatal(FatalFault::ProtectionViolation(data))
    );

    let secret = vmm
        .map(&mut frames, &kernel, None, None, 1, MapFlags::KERNEL_DATA)
        .expect("kernel data");
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &user, secret, user_write()),
        FaultOutcome::Fatal(FatalFault::KernelAddressFromUser(secret))
    );
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, secret, read()),
        FaultOutcome::Resolved,
        "the kernel itself may touch it"
    );
}

#[test]
fn present_and_reserved_bit_faults_are_fatal() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, kernel) = common::machine(&ram, CpuCapabilities::ALL);
    let page = vmm.sysalloc(&mut frames, 1).expect("page");

    let protection = PageFaultError::new().with_present(true).with_write(true);
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, page, protection),
        FaultOutcome::Fatal(FatalFault::ProtectionViolation(page))
    );
    let corrupt = PageFaultError::new().with_present(true).with_reserved_bit(true);
    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, page, corrupt),
        FaultOutcome::Fatal(FatalFault::ReservedBit(page))
    );
}

#[test]
fn running_out_of_frames_is_fatal() {
    let ram = SparseRam::standard();
    let (mut vmm, mut frames, kernel) = common::machine(&ram, CpuCapabilities::ALL);
    let lazy = vmm
        .map(&mut frames, &kernel, None, None, 1, MapFlags::KERNEL_DATA)
        .expect("lazy");
    while frames.alloc().is_ok() {}

    assert_eq!(
        vmm.handle_page_fault(&mut frames, &kernel, lazy, read()),
        FaultOutcome::Fatal(FatalFault::OutOfMemory(lazy))
    );
    assert_eq!(vmm.page_status(&kernel, lazy), PageStatus::Reserved);
}
