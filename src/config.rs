//! Runtime tunables (SPEC_FULL.md §0 "Configuration").
//!
//! The distilled spec leaves these as named constants scattered through
//! §3/§4 (`bsafe`, `breserve`, the 600 ms QI deadline, the hot-plug
//! debounce, ...). A host assembling the controller picks concrete
//! values at `controller_new()` time instead of editing source, the way
//! `mm::buddy_allocator`/`io::interrupt_manager` expose their ranges as
//! named `const`s elsewhere in this crate — here they become
//! constructor fields with the same defaults.

#![allow(dead_code)]

/// Tunables for one [`crate::iommu::IommuController`] instance.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Below this many free buddy pages, `space_alloc` still prefers
    /// the interval allocator (C3) for anything >= 128 pages
    /// (spec.md §4.5 `large_threshold`, "`<bsafe`: 128 pages").
    pub bsafe_threshold_pages: u64,
    /// Between `bsafe` and `breserve`, the large-alloc threshold
    /// tightens to 32 pages.
    pub breserve_threshold_pages: u64,
    /// Default ring size (descriptor count) for a remap unit's QI ring,
    /// before it is clamped to the unit's reported capability. Mirrors
    /// `original_source`'s `kQIPageCount * 256` (two 256-descriptor
    /// pages -> 512 entries).
    pub qi_ring_size: usize,
    /// Insert a mid-batch write-stamp command every this many
    /// descriptors, even before the terminating one, so a large unmap's
    /// invalidation batch never outgrows the ring before it can drain.
    /// Grounded in `original_source/vtd.c`'s `kQIIndexStoreMask` (31 ->
    /// every 32 descriptors).
    pub qi_stamp_every: u32,
    /// Hard deadline for a QI stamp wait (context/interrupt invalidate,
    /// `space_unmap_memory`'s free-queue drain). Exceeding it is a
    /// policy-level fatal condition (spec.md §7 "Deadline exceeded").
    pub qi_deadline_ms: u32,
    /// Depth of each address space's two free queues
    /// (`free_queue[isLarge]`).
    pub free_queue_depth: usize,
    /// Hot-plug presence debounce window (spec.md §4.10).
    pub hotplug_debounce_ms: u32,
    /// Depth of the AER event ring drained by the bridge engine (C10).
    pub aer_ring_depth: usize,
    /// `true`: `unit_faults` aborts on a primary fault entry (spec.md
    /// §9 Open Question: default is "log", not "panic").
    pub panic_on_fault: bool,
    /// Maximum `check_free` entries drained per call (spec.md §4.7:
    /// "Process up to 8 entries per call").
    pub check_free_burst: usize,
    /// Whether `adjust_device` attaches a per-device mapper to devices
    /// other than the exempted host-integrated GPU (spec.md §4.8
    /// `kIOPCIConfiguratorDeviceMap`). `false` leaves every device on
    /// the global default space.
    pub per_device_mapping: bool,
    /// Clear by default: the host-integrated GPU is left off the IOMMU
    /// entirely unless the platform opts in (spec.md §4.8
    /// `kIOPCIConfiguratorIGIsMapped`).
    pub map_igpu: bool,
}

impl CoreConfig {
    /// Defaults matching the literal constants named throughout
    /// spec.md §3/§4.
    pub const fn defaults() -> Self {
        Self {
            bsafe_threshold_pages: 128,
            breserve_threshold_pages: 32,
            qi_ring_size: 512,
            qi_stamp_every: 32,
            qi_deadline_ms: 600,
            free_queue_depth: 256,
            hotplug_debounce_ms: 2000,
            aer_ring_depth: 64,
            panic_on_fault: false,
            check_free_burst: 8,
            per_device_mapping: true,
            map_igpu: false,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let c = CoreConfig::default();
        assert_eq!(c.qi_deadline_ms, 600);
        assert_eq!(c.hotplug_debounce_ms, 2000);
        assert_eq!(c.check_free_burst, 8);
    }
}
