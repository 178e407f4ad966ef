// ============================================================================
// I/O subsystem: PCI/PCIe configuration access and the hardware IOMMU
// (C6-C8). ACPI table scanning and generic interrupt-vector management
// are host responsibilities outside this crate's scope (spec.md §1).
// ============================================================================
pub mod iommu;
pub mod pci;
