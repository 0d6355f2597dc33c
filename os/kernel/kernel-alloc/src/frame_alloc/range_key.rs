//! Keys of the free-range tree.

use bitfield_struct::bitfield;
use core::cmp::Ordering;
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// Largest `size_exp`: a 52-bit physical address space holds 2^40 frames.
pub const MAX_EXP: u8 = 40;

/// `2^size_exp` free frames starting at `page_number`, which is a multiple
/// of the range length.
///
/// The raw value orders keys by size first and start second, so an in-order
/// walk visits the smallest ranges first and ranges of one size by address.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct RangeKey {
    #[bits(52)]
    page_number: u64,
    #[bits(6)]
    size_exp: u8,
    #[bits(6)]
    __: u8,
}

impl RangeKey {
    #[inline]
    #[must_use]
    pub const fn of(page: u64, exp: u8) -> Self {
        debug_assert!(exp <= MAX_EXP);
        debug_assert!(page & ((1 << exp) - 1) == 0, "range start is not aligned to its size");
        Self::new().with_page_number(page).with_size_exp(exp)
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> u64 {
        self.page_number()
    }

    #[inline]
    #[must_use]
    pub const fn exp(self) -> u8 {
        self.size_exp()
    }

    #[inline]
    #[must_use]
    pub const fn frames(self) -> u64 {
        1 << self.size_exp()
    }

    /// One past the last page.
    #[inline]
    #[must_use]
    pub const fn end_page(self) -> u64 {
        self.page() + self.frames()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.page() << Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn contains_page(self, page: u64) -> bool {
        page >= self.page() && page < self.end_page()
    }

    /// The equally sized neighbour this range merges with.
    #[inline]
    #[must_use]
    pub const fn buddy(self) -> Option<Self> {
        if self.exp() >= MAX_EXP {
            return None;
        }
        Some(Self::of(self.page() ^ self.frames(), self.exp()))
    }

    /// The range formed with the buddy.
    #[inline]
    #[must_use]
    pub const fn parent(self) -> Self {
        let exp = self.exp() + 1;
        Self::of(self.page() & !((1 << exp) - 1), exp)
    }

    /// Lower and upper half; `None` for single frames.
    #[inline]
    #[must_use]
    pub const fn halves(self) -> Option<(Self, Self)> {
        if self.exp() == 0 {
            return None;
        }
        let exp = self.exp() - 1;
        Some((
            Self::of(self.page(), exp),
            Self::of(self.page() + (1 << exp), exp),
        ))
    }

    /// The range of size `2^exp` that holds `page`.
    #[inline]
    #[must_use]
    pub const fn enclosing(page: u64, exp: u8) -> Self {
        Self::of(page & !((1 << exp) - 1), exp)
    }

    /// Smallest key of size class `exp`.
    #[inline]
    #[must_use]
    pub const fn class_start(exp: u8) -> Self {
        Self::new().with_size_exp(exp)
    }
}

impl PartialOrd for RangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.into_bits().cmp(&other.into_bits())
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}) 2^{}", self.base().as_u64(), self.end_page() << Size4K::SHIFT, self.exp())
    }
}

/// `ceil(log2(count))`; `count` must be non-zero.
#[inline]
#[must_use]
pub const fn exp_for(count: u64) -> u32 {
    count.next_power_of_two().trailing_zeros()
}

/// Split `[start, end)` (in frames) into maximal aligned power-of-two ranges,
/// lowest address first.
pub fn aligned_pieces(start: u64, end: u64) -> impl Iterator<Item = RangeKey> {
    let mut next = start;
    core::iter::from_fn(move || {
        if next >= end {
            return None;
        }
        let by_alignment = if next == 0 { u32::from(MAX_EXP) } else { next.trailing_zeros() };
        let by_length = (end - next).ilog2();
        let exp = by_alignment.min(by_length).min(u32::from(MAX_EXP));
        let key = RangeKey::of(next, exp as u8);
        next += key.frames();
        Some(key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_size_major() {
        let small_high = RangeKey::of(0x1000, 0);
        let big_low = RangeKey::of(0x10, 4);
        assert!(small_high < big_low);
        assert!(RangeKey::of(1, 0) < RangeKey::of(2, 0));
        assert!(RangeKey::class_start(3) <= RangeKey::of(0, 3));
        assert!(RangeKey::of(0xF_FFFF_FFFF, 0) < RangeKey::class_start(1));
    }

    #[test]
    fn buddies_and_halves() {
        let k = RangeKey::of(8, 2);
        assert_eq!(k.buddy(), Some(RangeKey::of(12, 2)));
        assert_eq!(RangeKey::of(12, 2).parent(), RangeKey::of(8, 3));
        assert_eq!(k.halves(), Some((RangeKey::of(8, 1), RangeKey::of(10, 1))));
        assert_eq!(RangeKey::of(5, 0).halves(), None);
        assert_eq!(RangeKey::enclosing(13, 2), RangeKey::of(12, 2));
        assert!(k.contains_page(11));
        assert!(!k.contains_page(12));
        assert_eq!(k.base(), PhysicalAddress::new(0x8000));
    }

    #[test]
    fn log2_rounding() {
        assert_eq!(exp_for(1), 0);
        assert_eq!(exp_for(2), 1);
        assert_eq!(exp_for(3), 2);
        assert_eq!(exp_for(4), 2);
        assert_eq!(exp_for(513), 10);
    }

    #[test]
    fn pieces_are_maximal_and_aligned() {
        let pieces: Vec<_> = aligned_pieces(3, 20).map(|k| (k.page(), k.exp())).collect();
        assert_eq!(pieces, vec![(3, 0), (4, 2), (8, 3), (16, 2)]);

        let from_zero: Vec<_> = aligned_pieces(0, 6).map(|k| (k.page(), k.exp())).collect();
        assert_eq!(from_zero, vec![(0, 2), (4, 1)]);
        assert_eq!(aligned_pieces(7, 7).count(), 0);
    }
}
