// ============================================================================
// src/pcie/bridge.rs - Bridge interrupt + AER engine (C10)
// ============================================================================
//!
//! Hot-plug debouncing and Advanced Error Reporting, handled through a
//! ring-buffered bottom-half per spec.md §4.10. Grounded in this
//! crate's own `HotPlugController`/`AerController` (the teacher's
//! generic PCIe-capability module, see `pcie::legacy` re-exports in
//! `pcie::mod`) for the register-level read/write/write-1-to-clear
//! sequences, restructured around the spec's presence-debounce state
//! machine and the per-root AER ring plus multi-subscriber event bus
//! from §9's design notes ("bounded MPSC ring per event-source").

#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, LinkLostError};
use crate::host::{self, EventSource, PmRootDomain, PropertyValue};
use crate::io::pci::capability::{
    aer_regs, express_regs, link_control_bits, pm_regs, pmcsr_bits, root_cmd_bits,
    root_status_bits, slot_status_bits, AerRegs, ExpressRegs,
};
use crate::io::pci::traits::ConfigSpaceAccessor;
use crate::io::pci::types::BdfAddress;
use crate::power::{ConfigShadowStore, DevicePmState, ShadowId};
use crate::sync::IrqMutex;

/// Latched interrupt reasons (spec.md §3 `ints_pending`), snapshotted
/// and cleared atomically at the top of `handle_interrupt`.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntsPending: u8 {
        const HOTPLUG = 1 << 0;
        const AER = 1 << 1;
    }
}

/// Arena index into a [`BridgeEngine`] (spec.md §9 "arena + indices").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(u32);

/// One captured AER source/status pair (spec.md §3 `aer_root`).
#[derive(Debug, Clone, Copy)]
pub struct AerSourceStatus {
    pub source_bdf: BdfAddress,
    pub status: u32,
    pub correctable: bool,
}

/// Delivered to every subscriber whose root filter matches (spec.md
/// §4.10 step 5b).
#[derive(Debug, Clone, Copy)]
pub struct AerEvent {
    pub root: BridgeId,
    pub source: AerSourceStatus,
}

/// Per-bridge state (spec.md §3 "Bridge engine state (C10)").
struct BridgeState {
    shadow: ShadowId,
    bdf: BdfAddress,
    express: ExpressRegs,
    pm_offset: Option<u16>,
    aer: Option<AerRegs>,
    is_hotplug_capable: bool,
    is_aer_root: bool,
    f_presence: bool,
    f_need_probe: bool,
    waiting_link_enable: bool,
    probing: bool,
    ints_pending: IntsPending,
    /// Raw snapshots awaiting the drain pass (spec.md §3 `aer_root`),
    /// captured under the all-bridges lock in the interrupt top half.
    aer_root: Vec<AerSourceStatus>,
    hotplug_count: u32,
    link_control_with_pm: bool,
    tunnel_l1_enable_count: u32,
    pm_assertion: Option<u64>,
}

/// Registration-time description of a bridge (spec.md §4.11 enumerator
/// glue feeds this after capability discovery).
pub struct BridgeDescriptor {
    pub shadow: ShadowId,
    pub bdf: BdfAddress,
    pub express: ExpressRegs,
    pub pm_offset: Option<u16>,
    pub aer: Option<AerRegs>,
    pub is_hotplug_capable: bool,
    pub is_aer_root: bool,
    /// "link-control-with-PM" quirk (spec.md §4.10 step 4c): on some
    /// platforms the slot's power state must be poked through the PM
    /// capability rather than the Express link itself.
    pub link_control_with_pm: bool,
}

/// Bounded, root-filterable AER subscriber (spec.md §9: "bounded MPSC
/// ring per event-source... producers must tolerate drop on full").
struct AerSubscription {
    root_filter: Option<BridgeId>,
    capacity: usize,
    queue: IrqMutex<Vec<AerEvent>>,
    signal: Arc<dyn Fn() + Send + Sync>,
}

/// Global list of AER event subscribers (spec.md §5 "Event-source
/// lock"). Producers (the drain pass) hold this lock only while
/// walking the subscriber list, not while delivering.
pub struct AerEventBus {
    subscriptions: IrqMutex<Vec<Arc<AerSubscription>>>,
}

impl AerEventBus {
    fn new() -> Self {
        Self {
            subscriptions: IrqMutex::new(Vec::new()),
        }
    }

    /// Register a listener. `root_filter = None` receives events from
    /// every AER root (spec.md §4.10 step 5b "or all roots").
    pub fn subscribe(
        &self,
        root_filter: Option<BridgeId>,
        capacity: usize,
        signal: Arc<dyn Fn() + Send + Sync>,
    ) -> usize {
        let mut subs = self.subscriptions.lock();
        subs.push(Arc::new(AerSubscription {
            root_filter,
            capacity,
            queue: IrqMutex::new(Vec::new()),
            signal,
        }));
        subs.len() - 1
    }

    pub fn unsubscribe(&self, index: usize) {
        let mut subs = self.subscriptions.lock();
        if index < subs.len() {
            subs.remove(index);
        }
    }

    /// Pop the next queued event for a subscriber (the listener's own
    /// consumption side; `signal` told it one was available).
    pub fn recv(&self, index: usize) -> Option<AerEvent> {
        let subs = self.subscriptions.lock();
        let sub = subs.get(index)?.clone();
        drop(subs);
        let mut q = sub.queue.lock();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0))
        }
    }

    fn publish(&self, event: AerEvent) {
        let subs = self.subscriptions.lock().clone();
        for sub in subs.iter() {
            if let Some(root) = sub.root_filter {
                if root != event.root {
                    continue;
                }
            }
            let mut q = sub.queue.lock();
            if q.len() >= sub.capacity {
                // Dropped silently on queue-full (spec.md §9).
                continue;
            }
            q.push(event);
            drop(q);
            (sub.signal)();
        }
    }
}

/// Owns every bridge's interrupt/debounce state plus the AER event bus
/// (spec.md §4.10). One instance per host, paired with the
/// [`ConfigShadowStore`] that owns the underlying PM state machine.
pub struct BridgeEngine {
    bridges: IrqMutex<Vec<BridgeState>>,
    aer_bus: AerEventBus,
    config: CoreConfig,
}

impl BridgeEngine {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            bridges: IrqMutex::new(Vec::new()),
            aer_bus: AerEventBus::new(),
            config,
        }
    }

    pub fn aer_bus(&self) -> &AerEventBus {
        &self.aer_bus
    }

    pub fn register_bridge(&self, desc: BridgeDescriptor) -> BridgeId {
        let mut bridges = self.bridges.lock();
        let id = BridgeId(bridges.len() as u32);
        bridges.push(BridgeState {
            shadow: desc.shadow,
            bdf: desc.bdf,
            express: desc.express,
            pm_offset: desc.pm_offset,
            aer: desc.aer,
            is_hotplug_capable: desc.is_hotplug_capable,
            is_aer_root: desc.is_aer_root,
            f_presence: false,
            f_need_probe: false,
            waiting_link_enable: false,
            probing: false,
            ints_pending: IntsPending::empty(),
            aer_root: Vec::new(),
            hotplug_count: 0,
            link_control_with_pm: desc.link_control_with_pm,
            tunnel_l1_enable_count: 0,
            pm_assertion: None,
        });
        id
    }

    /// Raised by the host's interrupt event source; latches the
    /// pending reason(s) for a later `handle_interrupt` bottom half
    /// (spec.md §4.10 "runs in a bottom-half").
    pub fn raise(&self, id: BridgeId, reason: IntsPending) {
        self.bridges.lock()[id.0 as usize].ints_pending.insert(reason);
    }

    fn with_bridge<R>(&self, id: BridgeId, f: impl FnOnce(&mut BridgeState) -> R) -> R {
        let mut bridges = self.bridges.lock();
        f(&mut bridges[id.0 as usize])
    }

    /// `handle_interrupt()` (spec.md §4.10).
    pub fn handle_interrupt(
        &self,
        id: BridgeId,
        accessor: &dyn ConfigSpaceAccessor,
        shadows: &ConfigShadowStore,
        pm: &dyn PmRootDomain,
        registry: &dyn host::DeviceRegistry,
        timer: &dyn EventSource,
        parents_alive: bool,
    ) -> CoreResult<()> {
        let pending = self.with_bridge(id, |b| core::mem::replace(&mut b.ints_pending, IntsPending::empty()));

        let shadow = self.with_bridge(id, |b| b.shadow);
        if shadows.pm_state(shadow) == DevicePmState::Off {
            return Ok(());
        }
        if !parents_alive {
            return Err(CoreError::LinkLost(LinkLostError::NoDevice));
        }

        if pending.contains(IntsPending::HOTPLUG) {
            self.handle_hotplug(id, accessor, pm, registry, timer)?;
        }
        if pending.contains(IntsPending::AER) {
            self.drain_aer(id, accessor, shadows);
        }

        Ok(())
    }

    fn handle_hotplug(
        &self,
        id: BridgeId,
        accessor: &dyn ConfigSpaceAccessor,
        pm: &dyn PmRootDomain,
        registry: &dyn host::DeviceRegistry,
        timer: &dyn EventSource,
    ) -> CoreResult<()> {
        let (bdf, express, hotplug_capable, pm_offset, link_control_with_pm) =
            self.with_bridge(id, |b| (b.bdf, b.express, b.is_hotplug_capable, b.pm_offset, b.link_control_with_pm));
        if !hotplug_capable {
            return Ok(());
        }

        let slot_status = accessor.read16(bdf, express.reg(express_regs::SLOT_STATUS));
        let link_status = accessor.read16(bdf, express.reg(express_regs::LINK_STATUS));

        let to_clear = slot_status
            & (slot_status_bits::POWER_FAULT_DETECTED | slot_status_bits::PRESENCE_DETECT_CHANGED);
        if to_clear != 0 {
            accessor.write16(bdf, express.reg(express_regs::SLOT_STATUS), to_clear);
        }

        let now_present = (slot_status & slot_status_bits::PRESENCE_DETECT_STATE) != 0;

        if link_control_with_pm {
            if let Some(pm_offset) = pm_offset {
                if now_present {
                    let pmcsr = accessor.read16(bdf, pm_offset + pm_regs::PMCSR);
                    if (pmcsr & pmcsr_bits::STATE_MASK) != pmcsr_bits::D0 {
                        accessor.write16(bdf, pm_offset + pm_regs::PMCSR, (pmcsr & !pmcsr_bits::STATE_MASK) | pmcsr_bits::D0);
                    }
                }
            }
        }

        let link_control = accessor.read16(bdf, express.reg(express_regs::LINK_CONTROL));
        if (link_control & link_control_bits::LINK_DISABLE) != 0 && now_present {
            accessor.write16(
                bdf,
                express.reg(express_regs::LINK_CONTROL),
                link_control & !link_control_bits::LINK_DISABLE,
            );
            self.with_bridge(id, |b| b.waiting_link_enable = true);
            // Presence is observed but not latched yet this cycle
            // (spec.md §4.10 step 4d).
            return Ok(());
        }

        // Read for diagnostics only; spec.md §4.10 latches presence off
        // `PRESENCE_DETECT_STATE` alone and does not gate it on the link
        // having retrained yet.
        let _ = link_status;

        let was_present = self.with_bridge(id, |b| b.f_presence);
        self.with_bridge(id, |b| {
            b.f_presence = now_present;
            b.hotplug_count += 1;
        });

        if !was_present && now_present {
            self.with_bridge(id, |b| b.f_need_probe = true);
            timer.set_timeout_ms(self.config.hotplug_debounce_ms);
        } else if was_present && !now_present {
            log::warn!("bridge {id:?}: device presence lost, clearing online/configured state");
            registry.remove_property(host::keys::IOPCI_ONLINE);
            registry.remove_property(host::keys::IOPCI_CONFIGURED);
            self.with_bridge(id, |b| b.f_need_probe = false);
        } else if now_present {
            self.probe_now(id, pm);
        }

        Ok(())
    }

    fn probe_now(&self, id: BridgeId, pm: &dyn PmRootDomain) {
        let need = self.with_bridge(id, |b| core::mem::replace(&mut b.f_need_probe, false));
        if !need {
            return;
        }
        let token = pm.create_pm_assertion(true);
        self.with_bridge(id, |b| {
            b.probing = true;
            b.pm_assertion = Some(token);
        });
    }

    /// Debounce timer fired (spec.md §4.10 "timer_probe").
    pub fn timer_probe(&self, id: BridgeId, shadows: &ConfigShadowStore, pm: &dyn PmRootDomain) {
        let shadow = self.with_bridge(id, |b| b.shadow);
        let still_probing = self.with_bridge(id, |b| b.f_need_probe);
        if !still_probing || shadows.pm_state(shadow) != DevicePmState::On {
            return;
        }
        self.with_bridge(id, |b| b.f_need_probe = false);
        let token = pm.create_pm_assertion(true);
        pm.release_pm_assertion(token);
    }

    /// AER root-status drain (spec.md §4.10 step 5a): snapshot
    /// source+status under the spinlock, write-1-to-clear.
    fn latch_aer_root_status(&self, id: BridgeId, accessor: &dyn ConfigSpaceAccessor) {
        let (bdf, aer, is_root) = self.with_bridge(id, |b| (b.bdf, b.aer, b.is_aer_root));
        let Some(aer) = aer else { return };
        if !is_root {
            return;
        }
        let root_status = accessor.read32(bdf, aer.reg(aer_regs::ROOT_STATUS));
        let has_error = root_status
            & (root_status_bits::CORRECTABLE_ERROR
                | root_status_bits::UNCORRECTABLE_ERROR
                | root_status_bits::FATAL_ERROR
                | root_status_bits::NON_FATAL_ERROR)
            != 0;
        if !has_error {
            return;
        }
        let source_id = accessor.read32(bdf, aer.reg(aer_regs::SOURCE_ID));
        let correctable = root_status & root_status_bits::CORRECTABLE_ERROR != 0;
        let source_bdf = BdfAddress::from_u16((source_id & 0xFFFF) as u16);
        self.with_bridge(id, |b| {
            if b.aer_root.len() < b.aer_root.capacity().max(64) {
                b.aer_root.push(AerSourceStatus {
                    source_bdf,
                    status: root_status,
                    correctable,
                });
            }
        });
        accessor.write32(bdf, aer.reg(aer_regs::ROOT_STATUS), root_status);
    }

    /// `drain_aer` (spec.md §4.10 step 5b): pull every snapshot, clear
    /// the reporting function's own AER status, and publish to
    /// subscribers.
    fn drain_aer(&self, id: BridgeId, accessor: &dyn ConfigSpaceAccessor, shadows: &ConfigShadowStore) {
        self.latch_aer_root_status(id, accessor);

        let drained = self.with_bridge(id, |b| core::mem::take(&mut b.aer_root));
        for entry in drained {
            if entry.correctable {
                log::debug!("aer: correctable error latched from {:?}, status {:#x}", entry.source_bdf, entry.status);
            } else {
                log::error!("aer: uncorrectable error latched from {:?}, status {:#x}", entry.source_bdf, entry.status);
            }
            if let Some(source_id) = shadows.find_by_bdf(entry.source_bdf) {
                if let Some(source_aer) = shadows.caps(source_id).aer {
                    let status_reg = if entry.correctable {
                        aer_regs::CORRECTABLE_STATUS
                    } else {
                        aer_regs::UNCORRECTABLE_STATUS
                    };
                    let status = accessor.read32(entry.source_bdf, source_aer.reg(status_reg));
                    accessor.write32(entry.source_bdf, source_aer.reg(status_reg), status);
                    // Header log is diagnostic-only; read for completeness,
                    // no further action taken by the core (spec.md §4.10).
                    let _header: [u32; 4] = core::array::from_fn(|i| {
                        accessor.read32(entry.source_bdf, source_aer.reg(aer_regs::HEADER_LOG) + (i as u16) * 4)
                    });
                }
            }
            self.aer_bus.publish(AerEvent { root: id, source: entry });
        }
    }

    /// Program AER reporting enables on a root port (spec.md §4.11
    /// "optionally program severity, mask and command").
    pub fn enable_aer_reporting(
        &self,
        id: BridgeId,
        accessor: &dyn ConfigSpaceAccessor,
        correctable: bool,
        non_fatal: bool,
        fatal: bool,
    ) {
        let (bdf, aer) = self.with_bridge(id, |b| (b.bdf, b.aer));
        let Some(aer) = aer else { return };
        let mut cmd = 0u32;
        if correctable {
            cmd |= root_cmd_bits::CORRECTABLE_ERROR_REPORTING_EN;
        }
        if non_fatal {
            cmd |= root_cmd_bits::NON_FATAL_ERROR_REPORTING_EN;
        }
        if fatal {
            cmd |= root_cmd_bits::FATAL_ERROR_REPORTING_EN;
        }
        accessor.write32(bdf, aer.reg(aer_regs::ROOT_CMD), cmd);
    }

    pub fn presence(&self, id: BridgeId) -> bool {
        self.with_bridge(id, |b| b.f_presence)
    }

    pub fn hotplug_count(&self, id: BridgeId) -> u32 {
        self.with_bridge(id, |b| b.hotplug_count)
    }

    pub fn is_probing(&self, id: BridgeId) -> bool {
        self.with_bridge(id, |b| b.probing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PropertyValue;
    use crate::io::pci::capability::express_regs;
    use crate::power::{HpType, ShadowCapabilities, ShadowFlags};
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct FakeAccessor {
        regs: IrqMutex<BTreeMap<(u16, u16), u32>>,
    }

    impl FakeAccessor {
        fn new() -> Self {
            Self { regs: IrqMutex::new(BTreeMap::new()) }
        }
        // Dword-granular, like the real ECAM/legacy backends: rounds to a
        // 4-byte key so a direct poke here round-trips through the masked
        // read16/read32 below even at an odd sub-word offset.
        fn set(&self, bdf: BdfAddress, offset: u16, value: u32) {
            self.regs.lock().insert((bdf.to_u16(), offset & !0x3), value);
        }
    }

    impl ConfigSpaceAccessor for FakeAccessor {
        fn read8(&self, bdf: BdfAddress, offset: u16) -> u8 {
            (self.read32(bdf, offset & !0x3) >> ((offset & 0x3) * 8)) as u8
        }
        fn read16(&self, bdf: BdfAddress, offset: u16) -> u16 {
            (self.read32(bdf, offset & !0x3) >> ((offset & 0x2) * 8)) as u16
        }
        fn read32(&self, bdf: BdfAddress, offset: u16) -> u32 {
            *self.regs.lock().get(&(bdf.to_u16(), offset & !0x3)).unwrap_or(&0)
        }
        fn write8(&self, bdf: BdfAddress, offset: u16, value: u8) {
            let base = offset & !0x3;
            let shift = (offset & 0x3) * 8;
            let mut regs = self.regs.lock();
            let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
            *entry = (*entry & !(0xFFu32 << shift)) | ((value as u32) << shift);
        }
        fn write16(&self, bdf: BdfAddress, offset: u16, value: u16) {
            let base = offset & !0x3;
            let shift = (offset & 0x2) * 8;
            let mut regs = self.regs.lock();
            let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
            *entry = (*entry & !(0xFFFFu32 << shift)) | ((value as u32) << shift);
        }
        fn write32(&self, bdf: BdfAddress, offset: u16, value: u32) {
            self.regs.lock().insert((bdf.to_u16(), offset & !0x3), value);
        }
    }

    struct FakePm;
    impl PmRootDomain for FakePm {
        fn claim_system_wake_event(&self, _reason: &str) {}
        fn set_property(&self, _key: &str, _value: PropertyValue) {}
        fn create_pm_assertion(&self, _cpu: bool) -> u64 {
            42
        }
        fn release_pm_assertion(&self, _token: u64) {}
    }

    struct FakeRegistry {
        removed: RefCell<Vec<alloc::string::String>>,
    }
    impl host::DeviceRegistry for FakeRegistry {
        fn get_property(&self, _key: &str) -> Option<PropertyValue> {
            None
        }
        fn set_property(&self, _key: &str, _value: PropertyValue) {}
        fn remove_property(&self, key: &str) {
            self.removed.borrow_mut().push(key.into());
        }
    }

    struct FakeTimer {
        armed_ms: RefCell<Option<u32>>,
    }
    impl EventSource for FakeTimer {
        fn enable(&self) {}
        fn disable(&self) {}
        fn set_timeout_ms(&self, ms: u32) {
            *self.armed_ms.borrow_mut() = Some(ms);
        }
    }

    fn bdf() -> BdfAddress {
        BdfAddress::new(0, 2, 0)
    }

    fn setup() -> (BridgeEngine, ConfigShadowStore, BridgeId, FakeAccessor) {
        let shadows = ConfigShadowStore::new();
        let shadow = shadows.publish(bdf(), ShadowFlags::VALID | ShadowFlags::BRIDGE, HpType::Root, ShadowCapabilities::default(), true);
        let engine = BridgeEngine::new(CoreConfig::default());
        let id = engine.register_bridge(BridgeDescriptor {
            shadow,
            bdf: bdf(),
            express: ExpressRegs(0x80),
            pm_offset: None,
            aer: None,
            is_hotplug_capable: true,
            is_aer_root: false,
            link_control_with_pm: false,
        });
        (engine, shadows, id, FakeAccessor::new())
    }

    #[test]
    fn presence_0_to_1_arms_debounce_timer_not_probe() {
        let (engine, shadows, id, accessor) = setup();
        accessor.set(bdf(), 0x80 + express_regs::SLOT_STATUS, slot_status_bits::PRESENCE_DETECT_STATE as u32);
        engine.raise(id, IntsPending::HOTPLUG);
        let pm = FakePm;
        let registry = FakeRegistry { removed: RefCell::new(Vec::new()) };
        let timer = FakeTimer { armed_ms: RefCell::new(None) };
        engine.handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true).unwrap();
        assert!(engine.presence(id));
        assert_eq!(*timer.armed_ms.borrow(), Some(2000));
        assert!(!engine.is_probing(id));
    }

    #[test]
    fn presence_1_to_0_clears_online_and_configured_keys() {
        let (engine, shadows, id, accessor) = setup();
        // First latch presence.
        accessor.set(bdf(), 0x80 + express_regs::SLOT_STATUS, slot_status_bits::PRESENCE_DETECT_STATE as u32);
        engine.raise(id, IntsPending::HOTPLUG);
        let pm = FakePm;
        let registry = FakeRegistry { removed: RefCell::new(Vec::new()) };
        let timer = FakeTimer { armed_ms: RefCell::new(None) };
        engine.handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true).unwrap();

        // Now presence drops.
        accessor.set(bdf(), 0x80 + express_regs::SLOT_STATUS, 0);
        engine.raise(id, IntsPending::HOTPLUG);
        engine.handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true).unwrap();
        assert!(!engine.presence(id));
        assert!(registry.removed.borrow().contains(&alloc::string::String::from(host::keys::IOPCI_ONLINE)));
        assert!(registry.removed.borrow().contains(&alloc::string::String::from(host::keys::IOPCI_CONFIGURED)));
    }

    #[test]
    fn off_device_skips_interrupt_handling() {
        let (engine, shadows, id, accessor) = setup();
        let shadow = engine.with_bridge(id, |b| b.shadow);
        shadows.transition_on_to_off(shadow, &accessor).unwrap();
        engine.raise(id, IntsPending::HOTPLUG);
        let pm = FakePm;
        let registry = FakeRegistry { removed: RefCell::new(Vec::new()) };
        let timer = FakeTimer { armed_ms: RefCell::new(None) };
        let result = engine.handle_interrupt(id, &accessor, &shadows, &pm, &registry, &timer, true);
        assert!(result.is_ok());
        assert!(!engine.presence(id));
    }

    #[test]
    fn aer_event_delivered_to_matching_subscriber_and_dropped_on_full_queue() {
        let (engine, shadows, id, accessor) = setup();
        let source = BdfAddress::new(0, 3, 0);
        shadows.publish(source, ShadowFlags::VALID, HpType::None, ShadowCapabilities { aer: Some(AerRegs(0x140)), ..Default::default() }, false);
        engine.with_bridge_for_test(id, |b| {
            b.is_aer_root = true;
            b.aer = Some(AerRegs(0x100));
        });
        accessor.set(bdf(), 0x100 + aer_regs::ROOT_STATUS, root_status_bits::CORRECTABLE_ERROR);
        accessor.set(bdf(), 0x100 + aer_regs::SOURCE_ID, source.to_u16() as u32);

        let delivered = Arc::new(IrqMutex::new(0u32));
        let delivered2 = delivered.clone();
        let idx = engine.aer_bus().subscribe(None, 1, Arc::new(move || {
            *delivered2.lock() += 1;
        }));

        engine.raise(id, IntsPending::AER);
        engine.handle_interrupt(id, &accessor, &shadows, &FakePm, &FakeRegistry { removed: RefCell::new(Vec::new()) }, &FakeTimer { armed_ms: RefCell::new(None) }, true).unwrap();

        assert_eq!(*delivered.lock(), 1);
        let event = engine.aer_bus().recv(idx).expect("event queued");
        assert_eq!(event.source.source_bdf, source);
        assert!(event.source.correctable);
    }
}

#[cfg(test)]
impl BridgeEngine {
    fn with_bridge_for_test(&self, id: BridgeId, f: impl FnOnce(&mut BridgeState)) {
        self.with_bridge(id, f)
    }
}
