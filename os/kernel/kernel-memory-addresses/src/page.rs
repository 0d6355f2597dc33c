use crate::{PageSize, PhysicalAddress, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// A physical frame of size `S`. The base address is always `S`-aligned.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::OFFSET_MASK,
            _size: PhantomData,
        }
    }

    /// The frame starting exactly at `addr`, or `None` if `addr` is unaligned.
    #[inline]
    #[must_use]
    pub const fn from_start(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    /// Frame with the given frame number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self {
            base: number << S::SHIFT,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.base >> S::SHIFT
    }

    /// The frame `count` frames further up, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, count: u64) -> Option<Self> {
        match self.number().checked_add(count) {
            Some(n) if n <= (u64::MAX >> S::SHIFT) => Some(Self::from_number(n)),
            _ => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::as_str(), self.base)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(page: PhysicalPage<S>) -> Self {
        page.base()
    }
}

/// A virtual page of size `S`. The base address is always `S`-aligned.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    /// The page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::OFFSET_MASK,
            _size: PhantomData,
        }
    }

    /// The page starting exactly at `addr`, or `None` if `addr` is unaligned.
    #[inline]
    #[must_use]
    pub const fn from_start(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    /// The page `count` pages further up, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, count: u64) -> Option<Self> {
        match count.checked_mul(S::SIZE) {
            Some(bytes) => match self.base.checked_add(bytes) {
                Some(base) => Some(Self {
                    base,
                    _size: PhantomData,
                }),
                None => None,
            },
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::as_str(), self.base)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(page: VirtualPage<S>) -> Self {
        page.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size1G, Size4K};

    #[test]
    fn frames_round_trip_numbers() {
        let f = PhysicalPage::<Size4K>::from_number(7);
        assert_eq!(f.base().as_u64(), 0x7000);
        assert_eq!(f.checked_add(1).map(PhysicalPage::number), Some(8));
        assert_eq!(
            PhysicalPage::<Size4K>::from_start(PhysicalAddress::new(0x7001)),
            None
        );
    }

    #[test]
    fn huge_frame_alignment() {
        let g = PhysicalPage::<Size1G>::containing(PhysicalAddress::new(0x4000_1234));
        assert_eq!(g.base().as_u64(), 0x4000_0000);
        assert_eq!(g.number(), 1);
    }

    #[test]
    fn virtual_pages_step() {
        let p = VirtualPage::<Size4K>::containing(VirtualAddress::new(0x40_0FFF));
        assert_eq!(p.base().as_u64(), 0x40_0000);
        assert_eq!(p.checked_add(2).map(VirtualPage::base), Some(VirtualAddress::new(0x40_2000)));
        assert_eq!(
            VirtualPage::<Size4K>::containing(VirtualAddress::new(u64::MAX)).checked_add(1),
            None
        );
    }
}
