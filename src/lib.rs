// ============================================================================
// src/lib.rs - PCI/PCIe host enumeration + hardware IOMMU core
// ============================================================================
//!
//! Coordinated pair of engines: the device power/save-restore and
//! bridge interrupt/AER state machines that own the PCI(e) topology,
//! and the hardware IOMMU (VT-d style remapping) that owns per-device
//! address spaces, queued invalidation and interrupt remapping. See
//! `DESIGN.md` for how each module grounds on the crate this was built
//! from.
//!
//! `#![no_std]` outside test builds; the crate still uses `alloc` for
//! its arenas (config-shadows, address spaces, QI rings) the way the
//! host kernel's own allocator would back them. Plain `cargo test`
//! links `std` so the inline `#[cfg(test)] mod tests` blocks and
//! `tests/` scenarios can run without a custom harness.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod host;
pub mod io;
pub mod mm;
pub mod pcie;
pub mod power;
pub mod sync;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
