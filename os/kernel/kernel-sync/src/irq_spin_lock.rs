use crate::{IrqGuard, RawSpin};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A spin lock whose guard also holds interrupts off.
///
/// The interrupt state is saved before spinning and restored only after the
/// lock has been released, so a handler on the same core can never observe
/// the lock as held by the code it interrupted.
pub struct IrqSpinLock<T> {
    raw: RawSpin,
    inner: UnsafeCell<T>,
}

// SAFETY: access to `inner` is serialized by `raw`.
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            raw: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Disable interrupts, then spin until the lock is free.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.raw.lock();
        IrqSpinLockGuard { lock: self, _irq: irq }
    }

    /// Single attempt; interrupts are left untouched on failure.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        if self.raw.try_lock() {
            Some(IrqSpinLockGuard { lock: self, _irq: irq })
        } else {
            None
        }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Releases the lock, then restores the interrupt flag.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // `_irq` is dropped after this body runs.
        unsafe { self.lock.raw.unlock() }
    }
}
