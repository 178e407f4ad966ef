// ============================================================================
// src/io/iommu/mod.rs - Hardware IOMMU subsystem (C6-C8)
// ============================================================================
//!
//! DMAR blob parsing, the per-unit register driver, the queued-
//! invalidation engine and the global controller that ties them to the
//! address-space allocator in [`crate::mm`].

pub mod controller;
pub mod dmar;
pub mod qi;
pub mod remap_unit;

pub use controller::{DeviceMapperOption, IommuController, MapCommand, MapSpec, ReservedRange, SourceId};
pub use dmar::{DmarParseError, DmarTable, HardwareUnitInfo, ReservedMemoryInfo, RhsaInfo};
pub use qi::{QiEngine, QiRing, QiStats};
pub use remap_unit::{RemapUnit, UnitCapSummary, UnitCaps, UnitInitError, UnitRegs};
