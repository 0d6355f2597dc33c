use crate::{PHYSICAL_ADDRESS_BITS, PageSize, PhysicalPage, Size4K};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// Carries no validation beyond being below 2^52 when used to build a
/// page-table entry; see [`PhysicalAddress::is_representable`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Highest possible address; used as "no ceiling" by the frame allocator.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & S::OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset_in::<S>() == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::OFFSET_MASK)
    }

    /// Rounds up to the next `S` boundary, saturating at the highest aligned address.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        match self.0.checked_add(S::OFFSET_MASK) {
            Some(v) => Self(v & !S::OFFSET_MASK),
            None => Self(u64::MAX & !S::OFFSET_MASK),
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// 4 KiB frame number (`address >> 12`).
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 >> Size4K::SHIFT
    }

    /// Whether the address fits into the 52 physical address bits of a page-table entry.
    #[inline]
    #[must_use]
    pub const fn is_representable(self) -> bool {
        self.0 >> PHYSICAL_ADDRESS_BITS == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size2M;

    #[test]
    fn alignment_helpers() {
        let pa = PhysicalAddress::new(0x20_1234);
        assert!(!pa.is_aligned::<Size4K>());
        assert_eq!(pa.align_down::<Size4K>().as_u64(), 0x20_1000);
        assert_eq!(pa.align_up::<Size4K>().as_u64(), 0x20_2000);
        assert_eq!(pa.align_down::<Size2M>().as_u64(), 0x20_0000);
        assert_eq!(pa.offset_in::<Size4K>(), 0x234);
        assert_eq!(pa.frame_number(), 0x201);
    }

    #[test]
    fn align_up_saturates() {
        let pa = PhysicalAddress::new(u64::MAX - 5);
        assert_eq!(pa.align_up::<Size4K>().as_u64(), u64::MAX & !0xFFF);
    }

    #[test]
    fn representable_range() {
        assert!(PhysicalAddress::new((1 << 52) - 1).is_representable());
        assert!(!PhysicalAddress::new(1 << 52).is_representable());
        assert!(!PhysicalAddress::MAX.is_representable());
    }

    #[test]
    fn debug_format() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
    }
}
