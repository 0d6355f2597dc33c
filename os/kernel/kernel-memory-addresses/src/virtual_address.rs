use crate::{PageSize, VIRTUAL_ADDRESS_BITS, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// The value is kept as given; canonical form is checked on demand with
/// [`VirtualAddress::is_canonical`] since user-supplied pointers must be
/// validated before use rather than silently normalized.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
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
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, bytes: u64) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Bits 63..47 are all equal (48-bit canonical form).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> (VIRTUAL_ADDRESS_BITS - 1);
        upper == 0 || upper == (1 << (64 - VIRTUAL_ADDRESS_BITS + 1)) - 1
    }

    /// Canonical and in the lower (user) half.
    #[inline]
    #[must_use]
    pub const fn is_lower_half(self) -> bool {
        self.0 >> (VIRTUAL_ADDRESS_BITS - 1) == 0
    }

    /// Canonical and in the upper (kernel) half.
    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        !self.is_lower_half() && self.is_canonical()
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size4K;

    #[test]
    fn canonical_form() {
        assert!(VirtualAddress::new(0).is_canonical());
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_FFFF).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(u64::MAX).is_canonical());
    }

    #[test]
    fn halves() {
        assert!(VirtualAddress::new(0x40_0000).is_lower_half());
        assert!(!VirtualAddress::new(0x40_0000).is_higher_half());
        assert!(VirtualAddress::new(0xFFFF_FFFF_8000_0000).is_higher_half());
        // non-canonical belongs to neither half
        let hole = VirtualAddress::new(0x0000_9000_0000_0000);
        assert!(!hole.is_lower_half());
        assert!(!hole.is_higher_half());
    }

    #[test]
    fn page_and_offset() {
        let va = VirtualAddress::new(0x1234_5678);
        assert_eq!(va.page::<Size4K>().base().as_u64(), 0x1234_5000);
        assert_eq!(va.offset_in::<Size4K>(), 0x678);
        assert_eq!(va.checked_sub(0x1000), Some(VirtualAddress::new(0x1234_4678)));
        assert_eq!(VirtualAddress::new(u64::MAX).checked_add(1), None);
    }
}
