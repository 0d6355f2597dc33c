//! # Memory Layout and Boot Hand-off
//!
//! Shared, compile-time configuration of the kernel's address space together
//! with the data the boot loader hands to the memory subsystem.
//!
//! ## Modules
//!
//! * [`memory`]: address-space layout constants (user half, physical window,
//!   kernel allocation arena, guard-page count).
//! * [`boot`]: the physical memory map and the kernel image bounds. Both are
//!   treated as untrusted input.
//! * [`cpu`]: the CPU capability descriptor gating which page-table bits may be set.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌──────────────────────────────┐
//!                       │ null guard (never mapped)    │
//! USERSPACE_START       ├──────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │ user half (per context)      │
//! USERSPACE_END         ├──────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │ non-canonical hole           │
//! PHYS_WINDOW_BASE      ├──────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │ physical window (PML4 #256)  │
//!                       │ all RAM at a fixed offset    │
//!                       ├──────────────────────────────┤ 0xffff_8080_0000_0000
//!                       │ unused                       │
//! KERNEL_ARENA_START    ├──────────────────────────────┤ 0xffff_ff00_0000_0000
//!                       │ kernel allocations (#510)    │
//! KERNEL_BASE           ├──────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │ kernel image (#511)          │
//! 0xffff_ffff_ffff_ffff └──────────────────────────────┘
//! ```
//!
//! The kernel half (PML4 slots 256..512) is shared by every address-space
//! context. Its second-level tables for the slots above are created once at
//! boot and never freed, so copying the upper half of the kernel's PML4 into a
//! new context is enough to share all present and future kernel mappings.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod cpu;
pub mod memory;
