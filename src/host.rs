//! Collaborator contracts the host kernel must provide (spec.md §6.1).
//!
//! One trait per collaborator, the way `io::pci::traits::ConfigSpaceAccessor`
//! abstracts Legacy-I/O vs. ECAM config access behind a single interface:
//! each collaborator here has exactly one real implementation outside this
//! crate (the kernel's work-loop, its PM root domain, ...), so a trait per
//! collaborator is enough — no need for the `enum`-dispatch style used where
//! this crate itself has more than one concrete backend (`BridgeKind` in
//! `enumerator`). The crate is re-expressible on any host that implements
//! these, per spec.md §1.

use alloc::boxed::Box;

use crate::error::CoreResult;

/// `runAction(gate-closure)` semantics: schedule a closure to run inside
/// the configurator gate (spec.md §5's single-threaded work-loop). Every
/// mutation of a config-shadow or a device's PM state must go through
/// this.
pub trait WorkLoop: Send + Sync {
    /// Run `action` on the gate thread, blocking the caller until it
    /// completes. Re-entrant from the gate thread itself.
    fn run_action(&self, action: &mut dyn FnMut());
}

/// Interrupt/timer event-source primitives (spec.md §6.1). One instance
/// per hot-plug debounce timer, per AER-capable root port, per remap
/// unit's fault/QI interrupt.
pub trait EventSource: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    /// Arm a one-shot timeout; firing invokes the source's registered
    /// action exactly once. Re-arming before it fires replaces the
    /// previous deadline (used by the hot-plug debounce, spec.md §4.10).
    fn set_timeout_ms(&self, ms: u32);
}

/// Segment-walking abstraction over a DMA-able memory descriptor
/// (spec.md §6.1). `map_memory`/`unmap_memory` (C8) drive a device
/// mapper's page table through this instead of assuming a single
/// physically-contiguous buffer.
pub trait MemoryDescriptor {
    /// `(phys_addr, length)` of the segment starting at `offset`, or
    /// `None` once `offset` has walked past the descriptor's length.
    fn walk_segments(&self, offset: u64) -> Option<(u64, u64)>;
    /// Direction-aware cache/bus preparation before first touch.
    fn prepare(&self, direction: Direction) -> CoreResult<()>;
    /// Establish a kernel mapping; returns the mapped region's
    /// properties (virtual base is opaque to this crate — the flag the
    /// core needs is whether the mapping is a single physically
    /// contiguous run, which governs whether `map_memory` can use one
    /// table walk or must scatter-gather per segment).
    fn map(&self, direction: Direction, flags: MapFlags) -> CoreResult<MappedRegion>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapFlags {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub virtual_base: u64,
    pub physically_contiguous: bool,
}

/// Key -> object lookups on a device node (spec.md §6.1, §6.4). The
/// *keys* are part of this interface; their values are opaque to the
/// core. Concrete key strings a host must recognise are in
/// [`keys`] below.
pub trait DeviceRegistry {
    fn get_property(&self, key: &str) -> Option<PropertyValue>;
    fn set_property(&self, key: &str, value: PropertyValue);
    fn remove_property(&self, key: &str);
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    U64(u64),
}

/// PM root-domain hooks the bridge engine (C10) and the IOMMU
/// controller (C8) call into around wake events and CPU assertions.
pub trait PmRootDomain: Send + Sync {
    fn claim_system_wake_event(&self, reason: &str);
    fn set_property(&self, key: &str, value: PropertyValue);
    /// Create a CPU-busy assertion, held while probing a freshly
    /// hot-plugged device (spec.md §4.10 step 5f). Returns a token
    /// released by `release_pm_assertion`.
    fn create_pm_assertion(&self, cpu: bool) -> u64;
    fn release_pm_assertion(&self, token: u64);
}

/// Boxed collaborator bundle, assembled once by the host and handed to
/// `IommuController::install` / the enumerator glue.
pub struct HostContext {
    pub work_loop: Box<dyn WorkLoop>,
    pub pm_root_domain: Box<dyn PmRootDomain>,
}

/// Wall-clock source for the QI engine's 600 ms stamp-wait deadlines and
/// the hot-plug debounce timer (spec.md §4.7/§4.10). Not named in
/// spec.md §6.1's collaborator list, but required to make those
/// deadlines observable without pulling a time source into `no_std`
/// directly — see DESIGN.md.
pub trait DeadlineClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Host-backed physical page allocator for the structures C8 owns
/// outright — the root-entry table, context pages and QI rings (spec.md
/// §4.8 "Allocate a 256-entry root-entry table and one context-page").
/// Not named in spec.md §6.1 either; the distilled spec assumes these
/// come from the same kernel allocator as everything else, which this
/// crate has no business reimplementing — see DESIGN.md.
pub trait PhysPageAllocator: Send + Sync {
    /// Allocate `npages` physically-contiguous, zeroed 4 KiB pages;
    /// returns the base physical address.
    fn alloc_pages(&self, npages: usize) -> u64;
}

/// Device-node / nub property keys the core reads or writes (spec.md
/// §6.4). Values behind these keys are opaque to the core; only the
/// key strings are part of the contract.
pub mod keys {
    pub const PCI_THUNDERBOLT: &str = "PCI-Thunderbolt";
    pub const PCI_HOTPLUG_CAPABLE: &str = "PCIHotplugCapable";
    pub const IO_POLLED_INTERFACE_ACTIVE: &str = "IOPolledInterfaceActive";
    pub const IOPCI_DEVICE_HIDDEN: &str = "IOPCIDeviceHidden";
    pub const IOPCI_DEVICE_CHANGED: &str = "IOPCIDeviceChanged";
    pub const IOPLATFORM_DEVICE_ASPM_ENABLE: &str = "IOPlatformDeviceASPMEnable";
    pub const IOPLATFORM_DEVICE_RELOCATED: &str = "IOPlatformDeviceRelocated";
    pub const IOPLATFORM_SET_DEVICE_INTERRUPTS: &str = "IOPlatformSetDeviceInterrupts";
    pub const IOPLATFORM_RESOLVE_PCI_INTERRUPT: &str = "IOPlatformResolvePCIInterrupt";
    pub const IOPLATFORM_FREE_DEVICE_RESOURCES: &str = "IOPlatformFreeDeviceResources";
    pub const IOPLATFORM_GET_MESSAGED_INTERRUPT_ADDRESS: &str =
        "IOPlatformGetMessagedInterruptAddress";
    pub const IOPLATFORM_GET_MESSAGED_INTERRUPT_CONTROLLER: &str =
        "IOPlatformGetMessagedInterruptController";
    pub const IOPCI_TUNNEL_ID: &str = "IOPCITunnelID";
    pub const IOPCI_TUNNEL_CONTROLLER: &str = "IOPCITunnelController";
    pub const IOPCI_TUNNELLED: &str = "IOPCITunnelled";
    pub const IOPCI_TUNNEL_L1_ENABLE: &str = "IOPCITunnelL1Enable";
    pub const IOPCI_TUNNEL_ROOT_DEVICE_VENDOR_ID: &str = "IOPCITunnelRootDeviceVendorID";
    pub const IOPCI_TUNNEL_ROOT_DEVICE_MODEL_ID: &str = "IOPCITunnelRootDeviceModelID";
    pub const IOPCI_ONLINE: &str = "IOPCIOnline";
    /// Cleared on a hot-plug 1->0 transition alongside [`IOPCI_ONLINE`]
    /// (spec.md §4.10 step 5e); not in the distilled spec's §6.4 list
    /// but named by the same paragraph, so carried here too.
    pub const IOPCI_CONFIGURED: &str = "IOPCIConfigured";
    pub const IOPCI_EJECTABLE: &str = "IOPCIEjectable";
    pub const IOPCI_HOT_PLUG: &str = "IOPCIHotPlug";
    pub const IOPCI_LINK_CHANGE: &str = "IOPCILinkChange";
    pub const IOPCI_HP_TYPE: &str = "IOPCIHPType";
    pub const IOPCI_TUNNEL_BOOT_DEFER: &str = "IOPCITunnelBootDefer";
}
