//! # Memory Layout

/// Size of a physical frame and of a virtual page.
pub const FRAME_SIZE: u64 = 4096;

/// Entries per page table at every level.
pub const TABLE_ENTRIES: usize = 512;

/// Lowest user address handed out; the first 4 MiB stay unmapped to catch null dereferences.
pub const USERSPACE_START: u64 = 0x0000_0000_0040_0000;

/// End (exclusive) of the user half.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First PML4 slot of the kernel half.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// Base of the window through which all physical memory is addressable.
///
/// Physical address `pa` is visible at `PHYS_WINDOW_BASE + pa`.
pub const PHYS_WINDOW_BASE: u64 = 0xffff_8000_0000_0000;

/// The window spans exactly one PML4 slot.
pub const PHYS_WINDOW_SIZE: u64 = 512 * 1024 * 1024 * 1024;

/// PML4 slot occupied by the physical window.
pub const PHYS_WINDOW_SLOT: usize = 256;

/// Physical memory covered by the boot loader's temporary alias of the window.
///
/// Until the final window is installed only frames below this bound are reachable.
pub const BOOT_WINDOW_SIZE: u64 = 1024 * 1024 * 1024;

/// Start of the kernel virtual allocation arena (`sysalloc`, kernel `map`).
pub const KERNEL_ARENA_START: u64 = 0xffff_ff00_0000_0000;

/// End (exclusive) of the kernel virtual allocation arena.
pub const KERNEL_ARENA_END: u64 = KERNEL_BASE;

/// Where the kernel image executes.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// PML4 slots whose second-level tables are created at boot and shared by all contexts.
pub const KERNEL_SHARED_SLOTS: [usize; 3] = [PHYS_WINDOW_SLOT, 510, 511];

/// Guard pages placed on each side of a guarded mapping.
pub const GUARD_PAGES: u64 = 1;

const _: () = {
    assert!(USERSPACE_START.is_multiple_of(FRAME_SIZE));
    assert!(USERSPACE_END.is_multiple_of(FRAME_SIZE));
    assert!((PHYS_WINDOW_BASE >> 39) & 0x1FF == PHYS_WINDOW_SLOT as u64);
    assert!((KERNEL_ARENA_START >> 39) & 0x1FF == 510);
    assert!((KERNEL_BASE >> 39) & 0x1FF == 511);
    assert!(PHYS_WINDOW_BASE + PHYS_WINDOW_SIZE <= KERNEL_ARENA_START);
    assert!(KERNEL_ARENA_START < KERNEL_ARENA_END);
    assert!(BOOT_WINDOW_SIZE <= PHYS_WINDOW_SIZE);
    assert!(GUARD_PAGES > 0);
};
