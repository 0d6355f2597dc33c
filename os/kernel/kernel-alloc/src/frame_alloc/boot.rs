//! Turning the boot memory map into insertable frame extents.
//!
//! The map is untrusted: entries may be unsorted, unaligned or overlapping.
//! Each usable extent is trimmed inward to whole frames and then has every
//! reserved extent, every earlier usable extent and the kernel image carved
//! out of it, so no frame is inserted twice and no reserved frame at all.

use kernel_info::boot::{KernelImage, MemoryMap, MemoryMapEntry};
use kernel_memory_addresses::{PageSize, Size4K};
use log::warn;

const FRAME: u64 = Size4K::SIZE;

#[inline]
const fn align_up(v: u64) -> u64 {
    v.saturating_add(FRAME - 1) & !(FRAME - 1)
}

#[inline]
const fn align_down(v: u64) -> u64 {
    v & !(FRAME - 1)
}

/// Visit every free extent `[start, end)` in bytes, frame aligned, that lies
/// within `[window_start, window_end)`.
pub fn usable_extents(
    map: &MemoryMap<'_>,
    image: KernelImage,
    window_start: u64,
    window_end: u64,
    mut out: impl FnMut(u64, u64),
) {
    let floor = align_up(image.end.as_u64()).max(FRAME).max(window_start);
    for (index, entry) in map.iter().enumerate() {
        if !entry.is_usable() {
            continue;
        }
        let start = align_up(entry.base).max(floor);
        let end = align_down(entry.end()).min(window_end);
        if align_up(entry.base) != entry.base || align_down(entry.end()) != entry.end() {
            warn!("memory map extent {entry:?} is not frame aligned, trimming");
        }
        carve(map, image, index, 0, start, end, &mut out);
    }
}

/// The `k`-th extent to cut out of usable extent `current`; index `map.len()`
/// is the kernel image.
fn exclusion(map: &MemoryMap<'_>, image: KernelImage, current: usize, k: usize) -> Option<(u64, u64)> {
    if k == map.len() {
        return Some((align_down(image.start.as_u64()), align_up(image.end.as_u64())));
    }
    let entry: MemoryMapEntry = map.get(k)?;
    if k == current {
        None
    } else if !entry.is_usable() {
        Some((align_down(entry.base), align_up(entry.end())))
    } else if k < current {
        Some((align_up(entry.base), align_down(entry.end())))
    } else {
        None
    }
}

fn carve(
    map: &MemoryMap<'_>,
    image: KernelImage,
    current: usize,
    first: usize,
    start: u64,
    end: u64,
    out: &mut impl FnMut(u64, u64),
) {
    if start >= end {
        return;
    }
    for k in first..=map.len() {
        let Some((xs, xe)) = exclusion(map, image, current, k) else {
            continue;
        };
        if xs < end && xe > start {
            if k < map.len() {
                warn!(
                    "memory map extent {current} overlaps extent {k} at [{:#x}, {:#x})",
                    xs.max(start),
                    xe.min(end)
                );
            }
            carve(map, image, current, k + 1, start, xs, out);
            carve(map, image, current, k + 1, xe, end, out);
            return;
        }
    }
    out(start, end);
}
