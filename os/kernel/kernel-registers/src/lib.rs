//! # Typed Control Registers
//!
//! Only the registers the memory subsystem touches: `CR2` (faulting linear
//! address) and `CR3` (root of the active translation hierarchy). Raw
//! `mov` access is compiled only with the `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// Reading control registers is privileged and requires CPL 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// Writing control registers is privileged and changes global CPU state;
    /// the caller guarantees the new value keeps the running code mapped.
    unsafe fn store_unsafe(self);
}
