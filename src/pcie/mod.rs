// ============================================================================
// src/pcie/mod.rs - Bridge interrupt/AER engine (C10) + enumerator glue (C11)
// ============================================================================
//!
//! The register-level PCIe capability access itself lives in
//! [`crate::io::pci`] (shared with legacy PCI); this module is the two
//! components built on top of it that are PCIe-specific: the bridge
//! hot-plug/AER state machine (C10) and the capability-discovery +
//! publish glue that feeds it and the config-shadow engine (C9).

pub mod bridge;
pub mod enumerator;

pub use bridge::{AerEvent, AerEventBus, AerSourceStatus, BridgeDescriptor, BridgeEngine, BridgeId, IntsPending};
pub use enumerator::{
    discover_capabilities, enumerate_function, AerPolicy, AspmPolicy, DiscoveredCapabilities,
    EnumerationInput, MessageSignaledKind, PublishedFunction,
};
