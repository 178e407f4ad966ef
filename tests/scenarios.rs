//! End-to-end scenarios S1-S6 from spec.md §8.
//!
//! Each test below exercises several components together the way the
//! scenario in the spec does, using fakes for the host collaborators
//! (`ConfigSpaceAccessor`, `PmRootDomain`, `DeviceRegistry`,
//! `EventSource`, `UnitRegs`, `DeadlineClock`, `PhysPageAllocator`) the
//! same way the inline `#[cfg(test)]` modules do per-component.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use vtd_core::config::CoreConfig;
use vtd_core::host::{
    DeadlineClock, Direction, MapFlags, MappedRegion, MemoryDescriptor, PhysPageAllocator,
    PmRootDomain, PropertyValue,
};
use vtd_core::io::iommu::qi::{stamp_passed, QiEngine, QiRing};
use vtd_core::io::iommu::remap_unit::{regs, RemapUnit, UnitRegs};
use vtd_core::io::iommu::{DeviceMapperOption, IommuController, MapCommand, SourceId};
use vtd_core::io::pci::capability::{express_regs, link_control_bits, slot_status_bits};
use vtd_core::io::pci::traits::ConfigSpaceAccessor;
use vtd_core::io::pci::types::BdfAddress;
use vtd_core::mm::address_space::{AddressSpace, AllocOptions, AllocSpec, PendingFree};
use vtd_core::pcie::bridge::{BridgeDescriptor, BridgeEngine, IntsPending};
use vtd_core::power::{ConfigShadowStore, HpType, ShadowCapabilities, ShadowFlags};

// ============================================================================
// Shared fakes
// ============================================================================

struct FixedClock(AtomicU64);
impl DeadlineClock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct CountingPages(AtomicU64);
impl PhysPageAllocator for CountingPages {
    fn alloc_pages(&self, npages: usize) -> u64 {
        self.0.fetch_add((npages.max(1) as u64) << 12, Ordering::Relaxed)
    }
}

struct FakeUnitRegs {
    global_status: AtomicU32,
    capability: u64,
    extended_capability: u64,
}
unsafe impl Sync for FakeUnitRegs {}

impl UnitRegs for FakeUnitRegs {
    fn read32(&self, offset: usize) -> u32 {
        if offset == regs::GLOBAL_STATUS {
            self.global_status.load(Ordering::SeqCst)
        } else {
            0
        }
    }
    fn write32(&self, offset: usize, value: u32) {
        if offset == regs::GLOBAL_COMMAND {
            self.global_status.store(value, Ordering::SeqCst);
        }
    }
    fn read64(&self, offset: usize) -> u64 {
        match offset {
            regs::CAPABILITY => self.capability,
            regs::EXTENDED_CAPABILITY => self.extended_capability,
            _ => 0,
        }
    }
    fn write64(&self, _offset: usize, _value: u64) {}
    fn iotlb_read64(&self, _offset: usize) -> u64 {
        0
    }
    fn iotlb_write64(&self, _offset: usize, _value: u64) {}
}

/// One translating, QI-capable, page-selective unit (caching=1, rounding
/// order=4, selective bit set) — enough capability for every §4.6/§4.7
/// path these scenarios touch.
fn one_unit_dmar_blob(register_base: u64) -> Vec<u8> {
    let mut blob = vec![0u8; 48]; // DMAR common header
    blob.extend_from_slice(&0u16.to_le_bytes()); // kind 0: HardwareUnit
    blob.extend_from_slice(&16u16.to_le_bytes()); // length
    blob.push(0); // flags
    blob.push(0); // reserved
    blob.extend_from_slice(&0u16.to_le_bytes()); // segment
    blob.extend_from_slice(&register_base.to_le_bytes());
    blob
}

fn rmrr_subtable(base: u64, end: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes()); // kind 1: ReservedMemory
    body.extend_from_slice(&24u16.to_le_bytes()); // length
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u16.to_le_bytes()); // segment
    body.extend_from_slice(&base.to_le_bytes());
    body.extend_from_slice(&end.to_le_bytes());
    body
}

fn install_controller(extra_subtables: &[Vec<u8>]) -> IommuController<FakeUnitRegs> {
    let mut blob = one_unit_dmar_blob(0xFED9_0000);
    for sub in extra_subtables {
        blob.extend_from_slice(sub);
    }
    let pages = CountingPages(AtomicU64::new(0x1000_0000));
    let clock = Box::new(FixedClock(AtomicU64::new(0)));
    // caching=1, rounding order=4 (1<<4=16 page selective), selective bit.
    let capability = 0x1 | (4u64 << 48) | (1 << 7) | 0b010;
    IommuController::install(
        &blob,
        move |_base| FakeUnitRegs {
            global_status: AtomicU32::new(0),
            capability,
            extended_capability: 1 << 1,
        },
        &pages,
        clock,
        CoreConfig::default(),
    )
    .expect("install should succeed with one QI-capable unit")
}

fn translating_qi_unit() -> RemapUnit<FakeUnitRegs> {
    let capability = 0x1 | (4u64 << 48);
    let extended = 1 << 1;
    RemapUnit::init(
        FakeUnitRegs {
            global_status: AtomicU32::new(0),
            capability,
            extended_capability: extended,
        },
        capability,
        extended,
        0,
        0,
        None,
    )
    .unwrap()
}

/// Physically-contiguous-per-segment descriptor over a fixed page list,
/// mirroring the S1 scenario's `md=pages [0x1000,0x2000,0x3000]`.
struct FixedPagesDescriptor {
    pages: Vec<u64>,
}

impl MemoryDescriptor for FixedPagesDescriptor {
    fn walk_segments(&self, offset: u64) -> Option<(u64, u64)> {
        let index = (offset >> 12) as usize;
        self.pages.get(index).map(|&phys| (phys, 0x1000))
    }
    fn prepare(&self, _direction: Direction) -> vtd_core::CoreResult<()> {
        Ok(())
    }
    fn map(&self, _direction: Direction, _flags: MapFlags) -> vtd_core::CoreResult<MappedRegion> {
        Ok(MappedRegion {
            virtual_base: 0,
            physically_contiguous: false,
        })
    }
}

// Backed by whole dwords, like the real ECAM/legacy accessors: every
// read and write rounds to a 4-byte-aligned key first and shifts
// within it, so sub-word accesses at odd offsets (e.g. SLOT_STATUS at
// +0x1a) round-trip correctly instead of landing on a different key
// than the one a narrower read or write touched.
struct FakeAccessor {
    regs: std::sync::Mutex<std::collections::BTreeMap<(u16, u16), u32>>,
    vendor_device: u32,
}

impl FakeAccessor {
    fn new(vendor_device: u32) -> Self {
        Self {
            regs: std::sync::Mutex::new(std::collections::BTreeMap::new()),
            vendor_device,
        }
    }

    fn dword(&self, bdf: BdfAddress, offset: u16) -> u32 {
        use vtd_core::io::pci::bus::config_regs;
        let base = offset & !0x3;
        if base == config_regs::VENDOR_ID {
            return self.vendor_device;
        }
        *self.regs.lock().unwrap().get(&(bdf.to_u16(), base)).unwrap_or(&0)
    }
}

impl ConfigSpaceAccessor for FakeAccessor {
    fn read8(&self, bdf: BdfAddress, offset: u16) -> u8 {
        let shift = (offset & 0x3) * 8;
        (self.dword(bdf, offset) >> shift) as u8
    }
    fn read16(&self, bdf: BdfAddress, offset: u16) -> u16 {
        let shift = (offset & 0x2) * 8;
        (self.dword(bdf, offset) >> shift) as u16
    }
    fn read32(&self, bdf: BdfAddress, offset: u16) -> u32 {
        self.dword(bdf, offset)
    }
    fn write8(&self, bdf: BdfAddress, offset: u16, value: u8) {
        let base = offset & !0x3;
        let shift = (offset & 0x3) * 8;
        let mut regs = self.regs.lock().unwrap();
        let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
        *entry = (*entry & !(0xFFu32 << shift)) | ((value as u32) << shift);
    }
    fn write16(&self, bdf: BdfAddress, offset: u16, value: u16) {
        let base = offset & !0x3;
        let shift = (offset & 0x2) * 8;
        let mut regs = self.regs.lock().unwrap();
        let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
        *entry = (*entry & !(0xFFFFu32 << shift)) | ((value as u32) << shift);
    }
    fn write32(&self, bdf: BdfAddress, offset: u16, value: u32) {
        self.regs.lock().unwrap().insert((bdf.to_u16(), offset & !0x3), value);
    }
}

struct FakePm;
impl PmRootDomain for FakePm {
    fn claim_system_wake_event(&self, _reason: &str) {}
    fn set_property(&self, _key: &str, _value: PropertyValue) {}
    fn create_pm_assertion(&self, _cpu: bool) -> u64 {
        1
    }
    fn release_pm_assertion(&self, _token: u64) {}
}

struct FakeRegistry;
impl vtd_core::host::DeviceRegistry for FakeRegistry {
    fn get_property(&self, _key: &str) -> Option<PropertyValue> {
        None
    }
    fn set_property(&self, _key: &str, _value: PropertyValue) {}
    fn remove_property(&self, _key: &str) {}
}

struct RecordingTimer {
    last_timeout_ms: std::sync::Mutex<Option<u32>>,
}
impl RecordingTimer {
    fn new() -> Self {
        Self {
            last_timeout_ms: std::sync::Mutex::new(None),
        }
    }
}
impl vtd_core::host::EventSource for RecordingTimer {
    fn enable(&self) {}
    fn disable(&self) {}
    fn set_timeout_ms(&self, ms: u32) {
        *self.last_timeout_ms.lock().unwrap() = Some(ms);
    }
}

fn bdf() -> BdfAddress {
    BdfAddress::new(0, 1, 0)
}

// ============================================================================
// S1 - map / unmap round-trip
// ============================================================================

#[test]
fn s1_map_unmap_round_trip() {
    let config = CoreConfig::default();
    let space = AddressSpace::new(1 << 20, 18, 1 << 16, 7, config);

    let md = FixedPagesDescriptor {
        pages: vec![0x1000, 0x2000, 0x3000],
    };

    // map(md, opts={read,write}): walk every segment and fault+set it.
    let npages = 3u64;
    let base = space
        .space_alloc(npages, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
        .unwrap();

    let mut walked = 0u64;
    let mut page = base;
    let mut seg_offset = 0u64;
    while walked < npages * 0x1000 {
        let (phys, seg_len) = md.walk_segments(seg_offset).unwrap();
        space.page_table().lock().fault(page, 1);
        space.page_table().lock().set(page, 1, true, true, &[phys], true);
        page += 1;
        seg_offset += seg_len;
        walked += seg_len;
    }
    let addr = base << 12;
    let len = walked;
    assert_eq!(len, 12288);

    for i in 0..3u64 {
        assert_eq!(space.map_to_physical_address(addr + i * 0x1000), 0x1000 * (i + 1));
    }

    // unmap(addr, len): zero leaf entries, enqueue on the free queue,
    // drive QI to completion (observed_stamp pre-armed, matching how
    // the per-component QI tests simulate a unit that has already
    // caught up), then a later check_free returns the range to the
    // allocator.
    let stamp_word = Arc::new(AtomicU32::new(0));
    let ring = QiRing::new(translating_qi_unit(), 8, stamp_word.clone());
    let qi = QiEngine::new(vec![ring], config);
    let clock = FixedClock(AtomicU64::new(0));

    stamp_word.store(u32::MAX, Ordering::Relaxed);
    qi.space_unmap_memory(&space, base, npages, false, 0x2000, &clock)
        .unwrap();
    assert_eq!(qi.check_free(&space, false), 1);

    // After QI drain the IOVA range is back with the allocator and no
    // longer backed by a present leaf entry, so mapToPhys is identity.
    assert_eq!(space.map_to_physical_address(addr), addr);
}

// ============================================================================
// S2 - reserved-memory carve-out
// ============================================================================

#[test]
fn s2_reserved_memory_carve_out_is_identity_mapped_and_not_reallocatable() {
    let rmrr = rmrr_subtable(0xFEE0_0000, 0xFEF0_0000);
    let controller = install_controller(&[rmrr]);

    assert_eq!(controller.default_space().map_to_physical_address(0xFEE0_0123), 0xFEE0_0123);

    let base_page = 0xFEE0_0000u64 >> 12;
    let npages = (0xFEF0_0000u64 - 0xFEE0_0000u64) >> 12;
    let err = controller
        .default_space()
        .space_alloc(
            npages,
            AllocOptions {
                paging: false,
                fixed_address: Some(base_page),
            },
            AllocSpec { addr_bits: 48 },
            &[],
        )
        .unwrap_err();
    assert_eq!(
        err,
        vtd_core::CoreError::NoResources(vtd_core::error::NoResourcesError::AlreadyOwned)
    );
}

// ============================================================================
// S3 - debounced hot-plug
// ============================================================================

#[test]
fn s3_short_presence_glitch_does_not_reach_timer_probe() {
    let config = CoreConfig::default();
    let engine = BridgeEngine::new(config);
    let shadows = ConfigShadowStore::new();
    let shadow = shadows.publish(bdf(), ShadowFlags::VALID, HpType::None, ShadowCapabilities::default(), true);

    let id = engine.register_bridge(BridgeDescriptor {
        shadow,
        bdf: bdf(),
        express: vtd_core::io::pci::capability::ExpressRegs(0x40),
        pm_offset: None,
        aer: None,
        is_hotplug_capable: true,
        is_aer_root: false,
        link_control_with_pm: false,
    });

    let accessor = FakeAccessor::new(0x8086_1234);
    let pm = FakePm;
    let registry = FakeRegistry;
    let timer = RecordingTimer::new();
    let express = vtd_core::io::pci::capability::ExpressRegs(0x40);

    // t=0ms: presence asserted -> debounce timer armed, no probe yet.
    accessor.write16(bdf(), express.reg(express_regs::SLOT_STATUS), slot_status_bits::PRESENCE_DETECT_STATE);
    engine.raise(id, IntsPending::HOTPLUG);
    engine
        .handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true)
        .unwrap();
    assert_eq!(*timer.last_timeout_ms.lock().unwrap(), Some(config.hotplug_debounce_ms));
    assert!(!engine.is_probing(id));

    // t=500ms: presence drops again before the debounce window elapses.
    accessor.write16(bdf(), express.reg(express_regs::SLOT_STATUS), 0);
    engine.raise(id, IntsPending::HOTPLUG);
    engine
        .handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true)
        .unwrap();

    // t=2100ms: the debounce timer fires; since presence flipped back to
    // absent, the probe was cancelled and `timer_probe` is a no-op.
    engine.timer_probe(id, &shadows, &pm);
    assert!(!engine.is_probing(id));
}

// ============================================================================
// S4 - QI stamp wrap
// ============================================================================

#[test]
fn s4_stamp_passed_is_wrap_tolerant_across_injected_order() {
    // Stamps injected in order a, b, c straddling the 32-bit wrap.
    let a: u32 = 0xFFFF_FFF0;
    let b: u32 = 0xFFFF_FFFA;
    let c: u32 = 0x0000_0010;
    assert!(stamp_passed(c, a));
    assert!(stamp_passed(b, a));
    assert!(stamp_passed(c, b));
}

#[test]
fn s4_context_invalidate_keeps_succeeding_across_many_generations() {
    let stamp_word = Arc::new(AtomicU32::new(u32::MAX));
    let ring = QiRing::new(translating_qi_unit(), 8, stamp_word);
    let engine = QiEngine::new(vec![ring], CoreConfig::default());
    let clock = FixedClock(AtomicU64::new(0));

    // 32 calls, each needing the generation counter to advance past
    // its own fresh stamp; the unit's observed_stamp is pinned at
    // u32::MAX so every call's `stamp_passed` check is satisfied
    // immediately regardless of how far the generator has moved,
    // mirroring the property that stamp comparison tolerates wrap.
    for domain in 1..=32u16 {
        assert!(engine.context_invalidate(Some(domain), 0x3000, &clock).is_ok());
    }
}

// ============================================================================
// S5 - tunnel wake ordering
// ============================================================================

#[test]
fn s5_tunnel_wake_restores_bridges_then_rest_then_tunnels() {
    let store = ConfigShadowStore::new();
    let accessor = FakeAccessor::new(0x8086_1234);

    let root = store.publish(
        BdfAddress::new(0, 0, 0),
        ShadowFlags::VALID | ShadowFlags::BRIDGE,
        HpType::HotPlugTunnelRoot,
        ShadowCapabilities::default(),
        true,
    );
    let endpoint = store.publish(
        BdfAddress::new(1, 0, 0),
        ShadowFlags::VALID,
        HpType::None,
        ShadowCapabilities::default(),
        false,
    );
    // Published without VALID so the save() below actually runs instead
    // of short-circuiting on "already valid".
    let tunnel = store.publish(
        BdfAddress::new(2, 0, 0),
        ShadowFlags::empty(),
        HpType::StaticTunnel,
        ShadowCapabilities::default(),
        false,
    );
    store.set_tunnel_root(tunnel, root);

    // Give the tunnel device a saved register value distinct from what
    // comes after, so reading it back later proves its restore actually
    // ran rather than having been skipped.
    accessor.write32(BdfAddress::new(2, 0, 0), 8, 0xC0FF_EE00);
    store.save(tunnel, &accessor).unwrap();
    accessor.write32(BdfAddress::new(2, 0, 0), 8, 0);

    // `tunnel`'s hp_type (StaticTunnel) excludes it from `global_queue`
    // entirely (spec.md §4.9/§5): only the dependents cascade anchored
    // at `root`, walked in the same bridges/non-tunnels/tunnels order
    // as the main passes, can restore it.
    let failures = store.restore_machine_state(&accessor);
    assert!(failures.is_empty());

    assert_eq!(accessor.read32(BdfAddress::new(2, 0, 0), 8), 0xC0FF_EE00);

    // Every tunnel-typed shadow (root + tunnel) has now restored and
    // decremented `tunnel_wait` to zero, so a thread blocked here
    // returns immediately instead of spinning forever.
    store.tunnels_wait();
    let _ = endpoint;
}

// ============================================================================
// S6 - save with dead device
// ============================================================================

#[test]
fn s6_save_with_dead_hotplug_device_marks_gone_and_terminate() {
    let store = ConfigShadowStore::new();
    let id = store.publish(bdf(), ShadowFlags::HOTPLUG, HpType::None, ShadowCapabilities::default(), false);

    // Device reads all-ones: gone.
    let accessor = FakeAccessor::new(0xFFFF_FFFF);
    let outcome = store.save(id, &accessor).unwrap();

    assert_eq!(outcome, vtd_core::power::SaveOutcome::DeviceGone);
    assert!(!store.flags(id).contains(ShadowFlags::VALID));
    assert_eq!(
        vtd_core::power::device_gone_anomaly(outcome),
        Some(vtd_core::error::HotplugAnomaly::DeviceGoneTerminate)
    );
}

// ============================================================================
// Map command smoke test through the controller, not just AddressSpace
// directly (complements S1 by exercising device-mapper activation too).
// ============================================================================

#[test]
fn map_memory_through_controller_with_a_private_device_mapper() {
    let controller = install_controller(&[]);
    let source = SourceId::new(4, 0);
    controller
        .device_mapper_activate(source, DeviceMapperOption::Activate, false)
        .unwrap();

    let md = FixedPagesDescriptor {
        pages: vec![0x5000, 0x6000],
    };
    let (addr, len) = controller
        .map_memory(
            source,
            &md,
            0,
            8192,
            AllocOptions::default(),
            AllocSpec { addr_bits: 32 },
            MapCommand::ReadWrite,
        )
        .unwrap();
    assert_eq!(len, 8192);
    assert_eq!(controller.map_to_physical_address(source, addr), 0x5000);
    assert_eq!(controller.map_to_physical_address(source, addr + 0x1000), 0x6000);
}
