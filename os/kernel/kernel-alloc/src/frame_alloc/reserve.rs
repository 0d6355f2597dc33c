//! Emergency reserve of free ranges kept outside the tree.
//!
//! Node splits draw their frames from here, never from the range being
//! inserted, so an insertion cannot recurse into another insertion. The
//! allocator keeps at least one split budget worth of frames here whenever
//! the tree holds anything.

use super::range_key::RangeKey;
use crate::error::{AllocatorInvariantViolation as Violation, violation};
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Slots for reserve ranges.
const SLOTS: usize = 96;

/// Frames above which surplus is returned to the tree.
pub const RESERVE_HIGH: u64 = 16;

pub struct Reserve {
    ranges: [RangeKey; SLOTS],
    len: usize,
    frames: u64,
}

impl Reserve {
    pub const fn new() -> Self {
        Self {
            ranges: [RangeKey::new(); SLOTS],
            len: 0,
            frames: 0,
        }
    }

    #[inline]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn ranges(&self) -> &[RangeKey] {
        &self.ranges[..self.len]
    }

    pub fn push(&mut self, key: RangeKey) {
        if self.len == SLOTS {
            violation(Violation::ReserveFull);
        }
        self.ranges[self.len] = key;
        self.len += 1;
        self.frames += key.frames();
    }

    fn swap_remove(&mut self, i: usize) -> RangeKey {
        let key = self.ranges[i];
        self.len -= 1;
        self.ranges[i] = self.ranges[self.len];
        self.frames -= key.frames();
        key
    }

    /// Remove `key` if present.
    pub fn remove(&mut self, key: RangeKey) -> bool {
        match self.ranges().iter().position(|k| *k == key) {
            Some(i) => {
                self.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether any reserve range covers `page`.
    pub fn covers(&self, page: u64) -> bool {
        self.ranges().iter().any(|k| k.contains_page(page))
    }

    /// Smallest range, lowest address first, satisfying `fits`.
    pub fn best_fit(&self, fits: impl Fn(RangeKey) -> bool) -> Option<RangeKey> {
        self.ranges().iter().copied().filter(|k| fits(*k)).min()
    }

    #[inline]
    pub fn largest(&self) -> Option<RangeKey> {
        self.ranges().iter().copied().max()
    }

    /// One frame for a tree node, cut from the smallest range.
    pub fn take(&mut self) -> Option<PhysicalPage<Size4K>> {
        let smallest = self.ranges().iter().copied().enumerate().min_by_key(|(_, k)| *k)?;
        let mut key = self.swap_remove(smallest.0);
        while let Some((low, high)) = key.halves() {
            self.push(high);
            key = low;
        }
        Some(PhysicalPage::from_number(key.page()))
    }

    /// Split the largest range in two, both halves staying here.
    pub fn halve_largest(&mut self) -> bool {
        let Some((i, key)) = self.ranges().iter().copied().enumerate().max_by_key(|(_, k)| *k) else {
            return false;
        };
        let Some((low, high)) = key.halves() else {
            return false;
        };
        self.swap_remove(i);
        self.push(low);
        self.push(high);
        true
    }
}
