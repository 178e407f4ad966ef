// ============================================================================
// src/power/mod.rs - Config-shadow engine + device PM state machine (C9)
// ============================================================================
//!
//! One [`ConfigShadow`] per discovered PCI function, held in an arena
//! (`ConfigShadowStore`) and addressed by [`ShadowId`] rather than a raw
//! pointer — the same index-over-pointer style `mm::address_space`
//! uses for its free-queue entries, chosen here because a shadow's
//! `tunnel_root`/`shared_root`/`dependents` links form a graph that
//! would otherwise need unsafe self-referential pointers.
//!
//! Save/restore and the `Off/Doze/On/Paused` transition table are
//! grounded in `original_source/IOPCIConfigurator.cpp`'s
//! `restoreQEnter`/`restoreMachineState`/state-machine switch; register
//! layouts come from `io::pci::capability`.

#![allow(dead_code)]

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::error::{CoreError, CoreResult, HotplugAnomaly, LinkLostError};
use crate::host::PmRootDomain;
use crate::io::pci::bus::config_regs;
use crate::io::pci::capability::{
    aer_regs, express_regs, fpb_regs, l1pm_regs, link_control_bits, ltr_regs, AerRegs, ExpressRegs,
    FpbRegs, L1pmRegs, LtrRegs,
};
use crate::io::pci::traits::ConfigSpaceAccessor;
use crate::io::pci::types::BdfAddress;
use crate::sync::{IrqMutex, SpinCondvar};

/// Per-function policy and classification bits (spec.md §3
/// Config-shadow).
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShadowFlags: u32 {
        const VALID = 1 << 0;
        const HOST_BRIDGE = 1 << 1;
        const BRIDGE = 1 << 2;
        const BRIDGE_INTERRUPTS = 1 << 3;
        const BRIDGE_DRIVER = 1 << 4;
        const SLEEP_LINK_DISABLE = 1 << 5;
        const SLEEP_RESET = 1 << 6;
        const HOTPLUG = 1 << 7;
        const VOLATILE = 1 << 8;
        const WAKE_L1PM_DISABLE = 1 << 9;
        const PERMANENT = 1 << 10;
    }
}

/// Hot-plug topology role (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpType {
    None,
    Root,
    StaticTunnel,
    StaticShared,
    HotPlugTunnelRoot,
}

impl HpType {
    fn is_tunnel(self) -> bool {
        matches!(self, HpType::StaticTunnel | HpType::HotPlugTunnelRoot)
    }
}

/// Device power-management state (spec.md §3/§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePmState {
    Off,
    Doze,
    On,
    Paused,
}

/// Outcome of [`ConfigShadowStore::save`] (spec.md §4.9 step 5/6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Ok,
    AlreadyValid,
    DeviceGone,
    Offline,
}

/// Arena index into a [`ConfigShadowStore`] (spec.md §9: weak
/// references only, no ownership, so a plain index avoids a reference-
/// counted graph of shadows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowId(u32);

const GENERIC_EP_SLOTS: usize = 16;
const GENERIC_BRIDGE_SLOTS: usize = 24;
const MAX_GENERIC_SLOTS: usize = GENERIC_BRIDGE_SLOTS;

#[derive(Debug, Clone, Copy, Default)]
struct L1pmSaved {
    ctrl0: u32,
    ctrl1: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct AerSaved {
    uncorrectable_mask: u32,
    severity: u32,
    correctable_mask: u32,
    caps_control: u32,
    root_cmd: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExpressSaved {
    device_control: u16,
    link_control: u16,
    slot_control: u16,
    device_control2: u16,
    link_control2: u16,
    slot_control2: u16,
    ltr_enable: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct FpbSaved {
    ctrl1: u32,
    ctrl2: u32,
}

/// Everything [`ConfigShadowStore::save`] reads back in
/// [`ConfigShadowStore::restore`] (spec.md §3/§4.9).
#[derive(Debug, Clone, Copy)]
struct SavedConfig {
    generic: [u32; MAX_GENERIC_SLOTS],
    generic_slots: usize,
    l1pm: Option<L1pmSaved>,
    ltr: Option<u16>,
    acs: Option<u16>,
    aer: Option<AerSaved>,
    express: Option<ExpressSaved>,
    fpb: Option<FpbSaved>,
    messaged_interrupt: Option<u64>,
}

impl Default for SavedConfig {
    fn default() -> Self {
        Self {
            generic: [0; MAX_GENERIC_SLOTS],
            generic_slots: GENERIC_EP_SLOTS,
            l1pm: None,
            ltr: None,
            acs: None,
            aer: None,
            express: None,
            fpb: None,
            messaged_interrupt: None,
        }
    }
}

/// Capability offsets an enumerator (C11) has already discovered for
/// this function; `None` means the function doesn't implement that
/// capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowCapabilities {
    pub l1pm: Option<L1pmRegs>,
    pub ltr: Option<LtrRegs>,
    pub acs_offset: Option<u16>,
    pub aer: Option<AerRegs>,
    pub express: Option<ExpressRegs>,
    pub fpb: Option<FpbRegs>,
}

/// One per discovered PCI function (spec.md §3 Config-shadow).
pub struct ConfigShadow {
    bdf: BdfAddress,
    flags: ShadowFlags,
    hp_type: HpType,
    pm_state: DevicePmState,
    caps: ShadowCapabilities,
    tunnel_root: Option<ShadowId>,
    shared_root: Option<ShadowId>,
    dependents: Vec<ShadowId>,
    restore_count: u64,
    saved: SavedConfig,
    io_polled_interface_active: bool,
}

impl ConfigShadow {
    pub fn bdf(&self) -> BdfAddress {
        self.bdf
    }

    pub fn flags(&self) -> ShadowFlags {
        self.flags
    }

    pub fn hp_type(&self) -> HpType {
        self.hp_type
    }

    pub fn pm_state(&self) -> DevicePmState {
        self.pm_state
    }

    pub fn set_io_polled_interface_active(&mut self, active: bool) {
        self.io_polled_interface_active = active;
    }
}

/// The global arena plus the machine-wide wake epoch and restore
/// queues (spec.md §4.9/§5). One instance per host.
pub struct ConfigShadowStore {
    shadows: IrqMutex<Vec<ConfigShadow>>,
    /// All-bridges lock's protected state: the global (non-tunnel)
    /// restore queue, in discovery order.
    global_queue: IrqMutex<Vec<ShadowId>>,
    wake_count: AtomicU64,
    tunnel_sleep: AtomicU64,
    tunnel_wait: AtomicU64,
    tunnel_wake: SpinCondvar,
}

impl ConfigShadowStore {
    pub fn new() -> Self {
        Self {
            shadows: IrqMutex::new(Vec::new()),
            global_queue: IrqMutex::new(Vec::new()),
            wake_count: AtomicU64::new(1),
            tunnel_sleep: AtomicU64::new(0),
            tunnel_wait: AtomicU64::new(0),
            tunnel_wake: SpinCondvar::new(),
        }
    }

    /// Publish a config-shadow for a freshly discovered function
    /// (spec.md §4.11 "on publication, set up the config-shadow").
    pub fn publish(
        &self,
        bdf: BdfAddress,
        flags: ShadowFlags,
        hp_type: HpType,
        caps: ShadowCapabilities,
        is_bridge: bool,
    ) -> ShadowId {
        let mut saved = SavedConfig::default();
        if is_bridge {
            saved.generic_slots = GENERIC_BRIDGE_SLOTS;
        }
        let shadow = ConfigShadow {
            bdf,
            flags,
            hp_type,
            pm_state: DevicePmState::On,
            caps,
            tunnel_root: None,
            shared_root: None,
            dependents: Vec::new(),
            restore_count: 0,
            saved,
            io_polled_interface_active: false,
        };
        let mut shadows = self.shadows.lock();
        let id = ShadowId(shadows.len() as u32);
        shadows.push(shadow);
        drop(shadows);
        if hp_type.is_tunnel() {
            self.tunnel_wait.fetch_add(1, Ordering::Relaxed);
        } else {
            self.global_queue.lock().push(id);
        }
        id
    }

    /// Terminate a shadow at nub destruction (spec.md §3 lifecycle
    /// rules). Leaves a hole in the arena; `ShadowId`s into the hole
    /// are never reused within a boot.
    pub fn terminate(&self, id: ShadowId) {
        self.shadows.lock()[id.0 as usize].flags.remove(ShadowFlags::VALID);
    }

    fn with_shadow<R>(&self, id: ShadowId, f: impl FnOnce(&mut ConfigShadow) -> R) -> R {
        let mut shadows = self.shadows.lock();
        f(&mut shadows[id.0 as usize])
    }

    pub fn flags(&self, id: ShadowId) -> ShadowFlags {
        self.shadows.lock()[id.0 as usize].flags
    }

    pub fn pm_state(&self, id: ShadowId) -> DevicePmState {
        self.shadows.lock()[id.0 as usize].pm_state
    }

    pub fn caps(&self, id: ShadowId) -> ShadowCapabilities {
        self.shadows.lock()[id.0 as usize].caps
    }

    pub fn bdf(&self, id: ShadowId) -> BdfAddress {
        self.shadows.lock()[id.0 as usize].bdf
    }

    /// Locate a shadow by its BDF (C10's AER ring drain needs to turn a
    /// `source_id` register value back into the shadow it was
    /// published for, spec.md §4.10 step 5b "find the device by
    /// bus:dev:fn").
    pub fn find_by_bdf(&self, bdf: BdfAddress) -> Option<ShadowId> {
        self.shadows
            .lock()
            .iter()
            .position(|s| s.bdf == bdf && s.flags.contains(ShadowFlags::VALID))
            .map(|i| ShadowId(i as u32))
    }

    pub fn set_tunnel_root(&self, id: ShadowId, root: ShadowId) {
        self.with_shadow(id, |s| s.tunnel_root = Some(root));
        self.with_shadow(root, |_| {});
        let mut shadows = self.shadows.lock();
        shadows[root.0 as usize].dependents.push(id);
    }

    /// `save(device, opts)` (spec.md §4.9).
    pub fn save(
        &self,
        id: ShadowId,
        accessor: &dyn ConfigSpaceAccessor,
    ) -> CoreResult<SaveOutcome> {
        let (bdf, already_valid, permanent, caps) = self.with_shadow(id, |s| {
            (
                s.bdf,
                s.flags.contains(ShadowFlags::VALID),
                s.flags.contains(ShadowFlags::PERMANENT),
                s.caps,
            )
        });

        if already_valid && !permanent {
            return Ok(SaveOutcome::AlreadyValid);
        }

        let mut saved = SavedConfig::default();
        let slot_count = self.with_shadow(id, |s| s.saved.generic_slots);
        saved.generic_slots = slot_count;
        for i in 0..slot_count {
            if i == 0 || i == 1 {
                continue; // vendor/device id, never restored (spec.md §4.9 "skipping slots 0-1")
            }
            saved.generic[i] = accessor.read32(bdf, (i as u16) * 4);
        }

        if let Some(l1pm) = caps.l1pm {
            saved.l1pm = Some(L1pmSaved {
                ctrl0: accessor.read32(bdf, l1pm.reg(l1pm_regs::CTRL0)),
                ctrl1: accessor.read32(bdf, l1pm.reg(l1pm_regs::CTRL1)),
            });
        }
        if let Some(ltr) = caps.ltr {
            saved.ltr = Some(accessor.read16(bdf, ltr.reg(ltr_regs::MAX)));
        }
        if let Some(acs_offset) = caps.acs_offset {
            saved.acs = Some(accessor.read16(bdf, acs_offset));
        }
        if let Some(aer) = caps.aer {
            saved.aer = Some(AerSaved {
                uncorrectable_mask: accessor.read32(bdf, aer.reg(aer_regs::UNCORRECTABLE_MASK)),
                severity: accessor.read32(bdf, aer.reg(aer_regs::SEVERITY)),
                correctable_mask: accessor.read32(bdf, aer.reg(aer_regs::CORRECTABLE_MASK)),
                caps_control: accessor.read32(bdf, aer.reg(aer_regs::CAPS_CONTROL)),
                root_cmd: accessor.read32(bdf, aer.reg(aer_regs::ROOT_CMD)),
            });
        }
        if let Some(express) = caps.express {
            let link_control = accessor.read16(bdf, express.reg(express_regs::LINK_CONTROL));
            saved.express = Some(ExpressSaved {
                device_control: accessor.read16(bdf, express.reg(express_regs::DEVICE_CONTROL)),
                link_control,
                slot_control: accessor.read16(bdf, express.reg(express_regs::SLOT_CONTROL)),
                device_control2: accessor.read16(bdf, express.reg(express_regs::DEVICE_CONTROL2)),
                link_control2: accessor.read16(bdf, express.reg(express_regs::LINK_CONTROL2)),
                slot_control2: accessor.read16(bdf, express.reg(express_regs::SLOT_CONTROL2)),
                ltr_enable: saved.ltr.is_some(),
            });
        }
        if let Some(fpb) = caps.fpb {
            saved.fpb = Some(FpbSaved {
                ctrl1: accessor.read32(bdf, fpb.reg(fpb_regs::CTRL1)),
                ctrl2: accessor.read32(bdf, fpb.reg(fpb_regs::CTRL2)),
            });
        }

        let flags = self.with_shadow(id, |s| s.flags);
        if flags.contains(ShadowFlags::SLEEP_LINK_DISABLE) {
            if let Some(express) = caps.express {
                let mut lc = saved.express.map(|e| e.link_control).unwrap_or(0);
                lc |= link_control_bits::LINK_DISABLE;
                accessor.write16(bdf, express.reg(express_regs::LINK_CONTROL), lc);
            }
        }
        if flags.contains(ShadowFlags::SLEEP_RESET) {
            use crate::io::pci::capability::{bridge_control_bits, p2p_bridge_regs};
            let bc = accessor.read16(bdf, p2p_bridge_regs::BRIDGE_CONTROL);
            accessor.write16(
                bdf,
                p2p_bridge_regs::BRIDGE_CONTROL,
                bc | bridge_control_bits::SECONDARY_BUS_RESET,
            );
            accessor.write16(bdf, p2p_bridge_regs::BRIDGE_CONTROL, bc);
        }
        if flags.contains(ShadowFlags::WAKE_L1PM_DISABLE) {
            if let Some(l1pm) = &mut saved.l1pm {
                use crate::io::pci::capability::l1pm_ctrl_bits;
                l1pm.ctrl1 &= !(l1pm_ctrl_bits::L1_1_ENABLE | l1pm_ctrl_bits::L1_2_ENABLE);
            }
            if let Some(express) = &mut saved.express {
                express.link_control &= !(1 << 8);
            }
        }

        let (vendor, device) = accessor.read_vendor_device(bdf);
        let gone = vendor == 0xFFFF && device == 0xFFFF;
        if gone {
            let hotplug = flags.contains(ShadowFlags::HOTPLUG);
            self.with_shadow(id, |s| s.flags.remove(ShadowFlags::VALID));
            let outcome = if hotplug {
                SaveOutcome::DeviceGone
            } else {
                SaveOutcome::Offline
            };
            if let Some(anomaly) = device_gone_anomaly(outcome) {
                crate::error::log_error(&CoreError::HotplugAnomaly(anomaly));
            }
            return Ok(outcome);
        }

        self.with_shadow(id, |s| {
            s.saved = saved;
            s.flags.insert(ShadowFlags::VALID);
        });

        if !permanent {
            if let Some(root) = self.with_shadow(id, |s| s.tunnel_root) {
                self.set_tunnel_root(id, root);
            } else {
                self.global_queue.lock().push(id);
            }
        }

        Ok(SaveOutcome::Ok)
    }

    /// `restore(device, opts)` (spec.md §4.9).
    pub fn restore(&self, id: ShadowId, accessor: &dyn ConfigSpaceAccessor, parents_alive: bool) -> CoreResult<()> {
        let wake_count = self.wake_count.load(Ordering::Acquire);
        let already = self.with_shadow(id, |s| s.restore_count == wake_count);
        if already {
            return Ok(());
        }

        let (bdf, hp_type, saved, caps) = self.with_shadow(id, |s| (s.bdf, s.hp_type, s.saved, s.caps));

        if !parents_alive {
            if hp_type.is_tunnel() {
                return Err(CoreError::LinkLost(LinkLostError::MissingTunnelRoot));
            }
            return Err(CoreError::LinkLost(LinkLostError::NoDevice));
        }

        for i in 2..saved.generic_slots {
            accessor.write32(bdf, (i as u16) * 4, saved.generic[i]);
        }

        if let (Some(l1pm_offset), Some(l1pm)) = (caps.l1pm, saved.l1pm) {
            accessor.write32(bdf, l1pm_offset.reg(l1pm_regs::CTRL0), l1pm.ctrl0);
            accessor.write32(bdf, l1pm_offset.reg(l1pm_regs::CTRL1), l1pm.ctrl1);
        }

        if let Some(express) = saved.express {
            if express.ltr_enable {
                if let (Some(ltr_offset), Some(ltr)) = (caps.ltr, saved.ltr) {
                    accessor.write16(bdf, ltr_offset.reg(ltr_regs::MAX), ltr);
                }
            }
        } else if let (Some(ltr_offset), Some(ltr)) = (caps.ltr, saved.ltr) {
            accessor.write16(bdf, ltr_offset.reg(ltr_regs::MAX), ltr);
        }

        if let (Some(acs_offset), Some(acs)) = (caps.acs_offset, saved.acs) {
            accessor.write16(bdf, acs_offset, acs);
        }

        if let (Some(aer_offset), Some(aer)) = (caps.aer, saved.aer) {
            let is_root = hp_type == HpType::Root;
            if !is_root {
                accessor.write32(bdf, aer_offset.reg(aer_regs::UNCORRECTABLE_MASK), aer.uncorrectable_mask);
                accessor.write32(bdf, aer_offset.reg(aer_regs::SEVERITY), aer.severity);
                accessor.write32(bdf, aer_offset.reg(aer_regs::CORRECTABLE_MASK), aer.correctable_mask);
                accessor.write32(bdf, aer_offset.reg(aer_regs::CAPS_CONTROL), aer.caps_control);
            }
            if is_root {
                accessor.write32(bdf, aer_offset.reg(aer_regs::ROOT_CMD), aer.root_cmd);
            }
        }

        if let Some(express) = saved.express {
            let express_offset = caps.express.unwrap();
            accessor.write16(bdf, express_offset.reg(express_regs::DEVICE_CONTROL), express.device_control);
            accessor.write16(bdf, express_offset.reg(express_regs::LINK_CONTROL), express.link_control);
            accessor.write16(bdf, express_offset.reg(express_regs::SLOT_CONTROL), express.slot_control);
            accessor.write16(bdf, express_offset.reg(express_regs::DEVICE_CONTROL2), express.device_control2);
            accessor.write16(bdf, express_offset.reg(express_regs::LINK_CONTROL2), express.link_control2);
            accessor.write16(bdf, express_offset.reg(express_regs::SLOT_CONTROL2), express.slot_control2);
        }

        if let (Some(fpb_offset), Some(fpb)) = (caps.fpb, saved.fpb) {
            accessor.write32(bdf, fpb_offset.reg(fpb_regs::CTRL1), fpb.ctrl1);
            accessor.write32(bdf, fpb_offset.reg(fpb_regs::CTRL2), fpb.ctrl2);
        }

        if let Some(msi) = saved.messaged_interrupt {
            accessor.write32(bdf, config_regs::INTERRUPT_LINE as u16, msi as u32);
        }

        self.with_shadow(id, |s| s.restore_count = wake_count);

        if hp_type.is_tunnel() {
            let remaining = self.tunnel_wait.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                self.tunnel_sleep.store(0, Ordering::Release);
                self.tunnel_wake.notify_all();
            }
        }

        Ok(())
    }

    /// `Off -> On` (spec.md §4.9): block on the tunnel-wake condition
    /// for a graphics/multimedia device outside any tunnel-root queue,
    /// program the new PM state, then restore unless the device was
    /// merely `Paused`.
    pub fn transition_off_to_on(
        &self,
        id: ShadowId,
        accessor: &dyn ConfigSpaceAccessor,
        is_graphics: bool,
        pm: &dyn PmRootDomain,
    ) -> CoreResult<()> {
        let (prev, in_tunnel_queue) = self.with_shadow(id, |s| (s.pm_state, s.tunnel_root.is_some()));
        if is_graphics && !in_tunnel_queue {
            self.tunnels_wait();
        }
        pm.set_property("IOPCIOnline", crate::host::PropertyValue::Bool(true));
        self.with_shadow(id, |s| s.pm_state = DevicePmState::On);
        if prev == DevicePmState::Paused {
            return Ok(());
        }
        self.restore(id, accessor, true)
    }

    /// `On -> Off` (spec.md §4.9): save unless the kernel's polled
    /// interface is active on this device (panic-dump path keeps the
    /// device powered).
    pub fn transition_on_to_off(&self, id: ShadowId, accessor: &dyn ConfigSpaceAccessor) -> CoreResult<SaveOutcome> {
        let polled_active = self.with_shadow(id, |s| s.io_polled_interface_active);
        let outcome = self.save(id, accessor)?;
        if !polled_active {
            self.with_shadow(id, |s| s.pm_state = DevicePmState::Off);
        }
        Ok(outcome)
    }

    /// `On -> Paused` / `Paused -> On` (spec.md §4.9).
    pub fn transition_on_paused(&self, id: ShadowId, accessor: &dyn ConfigSpaceAccessor, pausing: bool) -> CoreResult<()> {
        if pausing {
            self.save(id, accessor)?;
            self.with_shadow(id, |s| s.pm_state = DevicePmState::Paused);
            Ok(())
        } else {
            self.with_shadow(id, |s| s.pm_state = DevicePmState::On);
            self.restore(id, accessor, true)
        }
    }

    /// `tunnels_wait()` (spec.md §5): sleep until `tunnel_sleep` drops
    /// to zero and every outstanding tunnel restore has decremented
    /// `tunnel_wait` to zero.
    pub fn tunnels_wait(&self) {
        self.tunnel_wake.wait_while(
            || {
                self.tunnel_sleep.load(Ordering::Acquire) != 0
                    || self.tunnel_wait.load(Ordering::Acquire) != 0
            },
            || core::hint::spin_loop(),
        );
    }

    /// `restore_machine_state()` (spec.md §4.9): bridges, then
    /// everything else, then early devices — bumping `wake_count`
    /// first so every shadow's `restore_count` is stale.
    ///
    /// Tunnels have their own dependency queue anchored at the tunnel
    /// root, restored in the same order (bridges, then non-tunnels,
    /// then tunnels; spec.md §4.9/§5). A root's `hp_type` (e.g.
    /// `HotPlugTunnelRoot`) routes it out of `global_queue` at publish
    /// time, so it is restored here explicitly before its own
    /// dependents are walked; `restore` is a per-wake-epoch no-op once
    /// applied, so a shadow that is both in `global_queue` and someone's
    /// `dependents` (e.g. a plain Bridge topologically under a tunnel
    /// root) is simply restored once, by whichever pass reaches it
    /// first.
    pub fn restore_machine_state(&self, accessor: &dyn ConfigSpaceAccessor) -> Vec<(ShadowId, CoreError)> {
        self.wake_count.fetch_add(1, Ordering::AcqRel);
        let queue = self.global_queue.lock().clone();
        let mut failures = Vec::new();

        for pass in [Pass::Bridges, Pass::Rest, Pass::EarlyDevices] {
            for &id in &queue {
                self.restore_if_matching(id, accessor, pass, &mut failures);
            }
        }

        let anchor_count = self.shadows.lock().len() as u32;
        for anchor in (0..anchor_count).map(ShadowId) {
            let dependents = self.with_shadow(anchor, |s| s.dependents.clone());
            if dependents.is_empty() {
                continue;
            }
            let anchor_valid = self.with_shadow(anchor, |s| s.flags.contains(ShadowFlags::VALID));
            if anchor_valid {
                if let Err(e) = self.restore(anchor, accessor, true) {
                    crate::error::log_error(&e);
                    failures.push((anchor, e));
                }
            }
            for pass in [Pass::Bridges, Pass::Rest, Pass::Tunnels] {
                for &id in &dependents {
                    self.restore_if_matching(id, accessor, pass, &mut failures);
                }
            }
        }

        failures
    }

    fn restore_if_matching(
        &self,
        id: ShadowId,
        accessor: &dyn ConfigSpaceAccessor,
        pass: Pass,
        failures: &mut Vec<(ShadowId, CoreError)>,
    ) {
        let (flags, hp_type) = self.with_shadow(id, |s| (s.flags, s.hp_type));
        if !flags.contains(ShadowFlags::VALID) {
            return;
        }
        let matches = match pass {
            Pass::Bridges => flags.contains(ShadowFlags::BRIDGE) || flags.contains(ShadowFlags::HOST_BRIDGE),
            Pass::Rest => {
                !flags.contains(ShadowFlags::BRIDGE)
                    && !flags.contains(ShadowFlags::HOST_BRIDGE)
                    && !is_early_device(flags, hp_type)
                    && !hp_type.is_tunnel()
            }
            Pass::EarlyDevices => is_early_device(flags, hp_type),
            Pass::Tunnels => hp_type.is_tunnel(),
        };
        if !matches {
            return;
        }
        if let Err(e) = self.restore(id, accessor, true) {
            crate::error::log_error(&e);
            failures.push((id, e));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Bridges,
    Rest,
    EarlyDevices,
    Tunnels,
}

fn is_early_device(flags: ShadowFlags, hp_type: HpType) -> bool {
    hp_type == HpType::None && !flags.contains(ShadowFlags::VOLATILE)
}

impl Default for ConfigShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a [`SaveOutcome`] under the "device gone" policy (spec.md
/// §4.9 step 5): `Hotplug` shadows are terminated, `Permanent` ones
/// merely report offline.
pub fn device_gone_anomaly(outcome: SaveOutcome) -> Option<HotplugAnomaly> {
    match outcome {
        SaveOutcome::DeviceGone => Some(HotplugAnomaly::DeviceGoneTerminate),
        SaveOutcome::Offline => Some(HotplugAnomaly::DeviceGoneOffline),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    struct FakeAccessor {
        regs: IrqMutex<BTreeMap<u16, u32>>,
        vendor_device: u32,
    }

    impl FakeAccessor {
        fn new(vendor_device: u32) -> Self {
            Self {
                regs: IrqMutex::new(BTreeMap::new()),
                vendor_device,
            }
        }
    }

    impl ConfigSpaceAccessor for FakeAccessor {
        fn read8(&self, _bdf: BdfAddress, offset: u16) -> u8 {
            self.read32(_bdf, offset & !0x3) as u8
        }
        fn read16(&self, bdf: BdfAddress, offset: u16) -> u16 {
            self.read32(bdf, offset & !0x3) as u16
        }
        fn read32(&self, bdf: BdfAddress, offset: u16) -> u32 {
            if offset == config_regs::VENDOR_ID {
                return self.vendor_device;
            }
            *self.regs.lock().get(&(offset + bdf.to_u16())).unwrap_or(&0)
        }
        fn write8(&self, bdf: BdfAddress, offset: u16, value: u8) {
            self.write32(bdf, offset, value as u32);
        }
        fn write16(&self, bdf: BdfAddress, offset: u16, value: u16) {
            self.write32(bdf, offset, value as u32);
        }
        fn write32(&self, bdf: BdfAddress, offset: u16, value: u32) {
            self.regs.lock().insert(offset + bdf.to_u16(), value);
        }
    }

    fn bdf() -> BdfAddress {
        BdfAddress::new(0, 1, 0)
    }

    #[test]
    fn save_then_restore_round_trips_generic_registers() {
        let store = ConfigShadowStore::new();
        let id = store.publish(bdf(), ShadowFlags::VALID, HpType::None, ShadowCapabilities::default(), false);
        let accessor = FakeAccessor::new(0x8086_1234);
        accessor.write32(bdf(), 8, 0xCAFEBABE);
        store.with_shadow(id, |s| s.flags.remove(ShadowFlags::VALID));
        let outcome = store.save(id, &accessor).unwrap();
        assert_eq!(outcome, SaveOutcome::Ok);
        accessor.write32(bdf(), 8, 0);
        store.restore(id, &accessor, true).unwrap();
        assert_eq!(accessor.read32(bdf(), 8), 0xCAFEBABE);
    }

    #[test]
    fn save_reports_already_valid_when_not_permanent() {
        let store = ConfigShadowStore::new();
        let id = store.publish(bdf(), ShadowFlags::VALID, HpType::None, ShadowCapabilities::default(), false);
        let accessor = FakeAccessor::new(0x8086_1234);
        assert_eq!(store.save(id, &accessor).unwrap(), SaveOutcome::AlreadyValid);
    }

    #[test]
    fn save_detects_device_gone_and_marks_hotplug_terminate() {
        let store = ConfigShadowStore::new();
        let id = store.publish(bdf(), ShadowFlags::HOTPLUG, HpType::None, ShadowCapabilities::default(), false);
        let accessor = FakeAccessor::new(0xFFFF_FFFF);
        let outcome = store.save(id, &accessor).unwrap();
        assert_eq!(outcome, SaveOutcome::DeviceGone);
        assert_eq!(device_gone_anomaly(outcome), Some(HotplugAnomaly::DeviceGoneTerminate));
    }

    #[test]
    fn restore_skipped_once_restore_count_matches_wake_count() {
        let store = ConfigShadowStore::new();
        let id = store.publish(bdf(), ShadowFlags::VALID, HpType::None, ShadowCapabilities::default(), false);
        let accessor = FakeAccessor::new(0x8086_1234);
        store.save(id, &accessor).unwrap();
        store.restore(id, &accessor, true).unwrap();
        accessor.write32(bdf(), 8, 0x1111);
        // second restore in the same wake epoch is a no-op
        store.restore(id, &accessor, true).unwrap();
        assert_eq!(accessor.read32(bdf(), 8), 0x1111);
    }

    #[test]
    fn restore_on_dead_tunnel_parent_returns_missing_tunnel_root() {
        let store = ConfigShadowStore::new();
        let id = store.publish(bdf(), ShadowFlags::VALID, HpType::StaticTunnel, ShadowCapabilities::default(), false);
        let accessor = FakeAccessor::new(0x8086_1234);
        let err = store.restore(id, &accessor, false).unwrap_err();
        assert_eq!(err, CoreError::LinkLost(LinkLostError::MissingTunnelRoot));
    }

    #[test]
    fn restore_machine_state_cascades_into_tunnel_dependents() {
        let store = ConfigShadowStore::new();
        let root = store.publish(
            BdfAddress::new(0, 0, 0),
            ShadowFlags::VALID | ShadowFlags::BRIDGE,
            HpType::HotPlugTunnelRoot,
            ShadowCapabilities::default(),
            true,
        );
        let tunnel = store.publish(
            BdfAddress::new(1, 0, 0),
            ShadowFlags::VALID,
            HpType::StaticTunnel,
            ShadowCapabilities::default(),
            false,
        );
        store.set_tunnel_root(tunnel, root);
        let accessor = FakeAccessor::new(0x8086_1234);

        accessor.write32(BdfAddress::new(1, 0, 0), 8, 0xAAAA_BBBB);
        store.with_shadow(tunnel, |s| s.flags.remove(ShadowFlags::VALID));
        store.save(tunnel, &accessor).unwrap();
        accessor.write32(BdfAddress::new(1, 0, 0), 8, 0);

        // `tunnel` never lands in `global_queue` (its hp_type excludes
        // it) -- only the dependents cascade anchored at `root` can
        // restore it.
        let failures = store.restore_machine_state(&accessor);
        assert!(failures.is_empty());
        assert_eq!(accessor.read32(BdfAddress::new(1, 0, 0), 8), 0xAAAA_BBBB);
        assert_eq!(store.tunnel_wait.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tunnels_wait_returns_once_last_tunnel_restores() {
        let store = ConfigShadowStore::new();
        let root = store.publish(bdf(), ShadowFlags::VALID, HpType::HotPlugTunnelRoot, ShadowCapabilities::default(), false);
        let child = store.publish(
            BdfAddress::new(1, 0, 0),
            ShadowFlags::VALID,
            HpType::StaticTunnel,
            ShadowCapabilities::default(),
            false,
        );
        store.set_tunnel_root(child, root);
        let accessor = FakeAccessor::new(0x8086_1234);
        assert_eq!(store.tunnel_wait.load(Ordering::Relaxed), 2);
        store.restore(root, &accessor, true).unwrap();
        store.restore(child, &accessor, true).unwrap();
        assert_eq!(store.tunnel_wait.load(Ordering::Relaxed), 0);
        store.tunnels_wait();
    }
}
