//! Interrupt flag control.
//!
//! The `cli`/`sti`/`pushfq` sequences are only emitted for the bare-metal
//! kernel target. Hosted builds see interrupts as permanently disabled, which
//! makes [`IrqGuard`] a no-op there.

/// Bit 9 of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
#[inline]
pub fn disable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn enable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Whether `RFLAGS.IF` is set.
#[inline]
#[must_use]
pub fn enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = RFLAGS_IF;
        false
    }
}

/// Disables interrupts on creation and restores the previous state on drop.
///
/// Nesting is fine: only the outermost guard re-enables interrupts.
///
/// ```
/// use kernel_sync::IrqGuard;
///
/// {
///     let _outer = IrqGuard::new();
///     let _inner = IrqGuard::new();
/// }
/// ```
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = enabled();
        if were_enabled {
            disable();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}
