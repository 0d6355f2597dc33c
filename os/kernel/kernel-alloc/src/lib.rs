//! # Kernel Memory Management
//!
//! Physical frame allocation, virtual memory management and page-fault
//! resolution for the kernel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 MemoryManager                       │
//! │    • the kernel's entry point, one per system       │
//! │    • locks: VMM first, then frames                  │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Virtual Memory Manager (VMM)              │
//! │    • map / unmap / remap, guard pages               │
//! │    • lazy commit, contexts, page-fault handling     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ kernel-vmem (page-table walker)
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • B-tree of free ranges, stored in free memory   │
//! │    • power-of-two ranges, buddy coalescing          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Window                        │
//! │    • all RAM mapped at PHYS_WINDOW_BASE             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below [`manager`] is generic over [`kernel_vmem::PhysMapper`]
//! and [`kernel_vmem::Tlb`], so the whole stack runs against host memory in
//! tests.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  never mapped (null guard)      │
//! USERSPACE_START       ├─────────────────────────────────┤
//!                       │  user half, per context         │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │  non-canonical hole             │
//! PHYS_WINDOW_BASE      ├─────────────────────────────────┤
//!                       │  physical window (512 GiB)      │
//!                       ├─────────────────────────────────┤
//! KERNEL_ARENA_START    │  kernel arena (sysalloc)        │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │  kernel image                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The PML4 slots of the physical window, the kernel arena and the kernel
//! image are shared by every context.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::manager::MemoryManager;
//! use kernel_alloc::vmm::MapFlags;
//!
//! let mm = MemoryManager::global().expect("memory manager installed at boot");
//! let stack = mm.sysalloc(4)?;
//! let user = mm.create_context()?;
//! let buf = mm.alloc(&user, 2, MapFlags::USER_DATA)?;
//! mm.unmap(&user, buf, 2, true)?;
//! mm.sysfree(stack, 4)?;
//! # Ok::<(), kernel_alloc::error::VmmError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod error;
pub mod fault;
pub mod frame_alloc;
pub mod manager;
pub mod phys_mapper;
pub mod vmm;

pub use crate::error::{FrameAllocError, MemoryInitError, VmmError};
pub use crate::fault::{FaultOutcome, FatalFault, PageFaultError};
pub use crate::frame_alloc::PhysicalAllocator;
pub use crate::manager::MemoryManager;
pub use crate::phys_mapper::DirectMap;
pub use crate::vmm::{Context, ContextKind, MapFlags, PageStatus, VirtualMemoryManager};
