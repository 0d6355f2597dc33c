//! # Kernel synchronization primitives
//!
//! * [`IrqSpinLock`]: spin lock that keeps interrupts disabled while held, so an
//!   interrupt (or the page-fault path) can never spin on a lock its own core owns.
//! * [`IrqGuard`]: the RAII interrupt-disable building block.
//! * [`SyncOnceCell`]: write-once cell for boot-time singletons.
//!
//! On hosted targets (unit tests) the interrupt flag is not touched.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod irq_spin_lock;
mod raw_spin;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use irq_spin_lock::{IrqSpinLock, IrqSpinLockGuard};
pub use raw_spin::RawSpin;
pub use sync_once_cell::SyncOnceCell;
