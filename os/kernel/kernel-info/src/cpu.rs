//! # CPU Capabilities
//!
//! Which optional paging features the processor supports. The page-table
//! walker refuses (or strips) bit patterns the CPU would treat as reserved.

/// Paging-related CPU features.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CpuCapabilities {
    /// `EFER.NXE` may be set: bit 63 of entries means no-execute.
    pub no_execute: bool,
    /// `CR4.PGE` may be set: the global bit survives CR3 reloads.
    pub global_pages: bool,
    /// 1 GiB leaves at the PDPT level are supported.
    pub huge_1g: bool,
}

impl CpuCapabilities {
    /// Everything supported; the common case on 64-bit hardware.
    pub const ALL: Self = Self {
        no_execute: true,
        global_pages: true,
        huge_1g: true,
    };

    /// Nothing optional supported.
    pub const MINIMAL: Self = Self {
        no_execute: false,
        global_pages: false,
        huge_1g: false,
    };

    /// Query `CPUID` leaves `0x1` and `0x8000_0001`.
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    #[allow(unused_unsafe)]
    pub fn detect() -> Self {
        use core::arch::x86_64::__cpuid;

        // SAFETY: CPUID is available on every x86-64 processor.
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        let basic = unsafe { __cpuid(0x1) };
        let (nx, gb) = if max_extended >= 0x8000_0001 {
            let ext = unsafe { __cpuid(0x8000_0001) };
            (ext.edx & (1 << 20) != 0, ext.edx & (1 << 26) != 0)
        } else {
            (false, false)
        };

        Self {
            no_execute: nx,
            global_pages: basic.edx & (1 << 13) != 0,
            huge_1g: gb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        assert!(CpuCapabilities::ALL.no_execute && CpuCapabilities::ALL.huge_1g);
        assert_eq!(CpuCapabilities::default(), CpuCapabilities::MINIMAL);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn detect_is_stable() {
        assert_eq!(CpuCapabilities::detect(), CpuCapabilities::detect());
    }
}
