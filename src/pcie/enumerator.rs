// ============================================================================
// src/pcie/enumerator.rs - Enumerator / configurator glue (C11)
// ============================================================================
//!
//! Drives capability discovery for a freshly-seen function in the fixed
//! order spec.md §4.11 names, then publishes a config-shadow (C9) and
//! registers a bridge (C10) when applicable. Grounded in
//! `io::pci::bus::PciBusScanner`/`io::pci::traits::ConfigSpaceAccessor`
//! for the capability walk itself (legacy `find_capability` and
//! extended `find_extended_capability`), generalized to the fixed
//! Power/MSI/LTR/ACS/L1PM/Express/AER/FPB order and the ASPM/SERR-
//! forward/AER-enable policy the spec requires on top of it.

#![allow(dead_code)]

use crate::host::{self, DeviceRegistry, PropertyValue};
use crate::io::pci::bus::{config_regs, CapabilityId, PciBusScanner};
use crate::io::pci::capability::{
    aer_regs, bridge_control_bits, ext_cap_id, express_regs, l1pm_regs, link_control_bits,
    slot_cap_bits, AerRegs, ExpressRegs, FpbRegs, L1pmRegs, LtrRegs,
};
use crate::io::pci::traits::{ConfigSpaceAccessor, ExtendedConfigSpaceAccessor};
use crate::io::pci::types::BdfAddress;
use crate::pcie::bridge::{BridgeDescriptor, BridgeEngine, BridgeId};
use crate::power::{ConfigShadowStore, HpType, ShadowCapabilities, ShadowFlags, ShadowId};

/// Capability offsets discovered for one function, the nub-local record
/// spec.md §4.11 says to build before publishing (`record the
/// capability offset in the nub`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveredCapabilities {
    pub power_mgmt: Option<u16>,
    pub msi: Option<u16>,
    pub msix: Option<u16>,
    pub ltr: Option<LtrRegs>,
    pub acs: Option<u16>,
    pub l1pm: Option<L1pmRegs>,
    pub express: Option<ExpressRegs>,
    pub aer: Option<AerRegs>,
    pub fpb: Option<FpbRegs>,
}

impl DiscoveredCapabilities {
    /// "MSI (prefer MSI-X when both present)" (spec.md §4.11).
    pub fn preferred_message_signaled_interrupt(&self) -> Option<MessageSignaledKind> {
        if self.msix.is_some() {
            Some(MessageSignaledKind::MsiX)
        } else if self.msi.is_some() {
            Some(MessageSignaledKind::Msi)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSignaledKind {
    Msi,
    MsiX,
}

/// Result of publishing one function (spec.md §4.11 "Publish; ... mark
/// Bridge/Hotplug/etc. flags, and attach").
pub struct PublishedFunction {
    pub shadow: ShadowId,
    pub bridge: Option<BridgeId>,
    pub caps: DiscoveredCapabilities,
}

/// Walks the fixed capability-discovery order for one function and
/// builds the record an enumerator publishes from (spec.md §4.11,
/// first paragraph). Does not touch any device state; callers decide
/// what to do with the offsets (ASPM programming, AER enable, ...).
pub fn discover_capabilities(
    accessor: &dyn ExtendedConfigSpaceAccessor,
    bdf: BdfAddress,
) -> DiscoveredCapabilities {
    let mut caps = DiscoveredCapabilities::default();

    caps.power_mgmt = accessor
        .find_capability(bdf, CapabilityId::PowerManagement)
        .map(|o| o as u16);

    // MSI-X is checked alongside MSI so `preferred_message_signaled_interrupt`
    // can pick between them; both offsets are still recorded.
    caps.msi = accessor.find_capability(bdf, CapabilityId::Msi).map(|o| o as u16);
    caps.msix = accessor.find_capability(bdf, CapabilityId::MsiX).map(|o| o as u16);

    caps.ltr = accessor
        .find_extended_capability(bdf, ext_cap_id::LTR)
        .map(LtrRegs);
    caps.acs = accessor.find_extended_capability(bdf, ext_cap_id::ACS);
    caps.l1pm = accessor
        .find_extended_capability(bdf, ext_cap_id::L1PM)
        .map(L1pmRegs);
    caps.express = accessor
        .find_capability(bdf, CapabilityId::PciExpress)
        .map(|o| ExpressRegs(o as u16));
    caps.aer = accessor.find_aer_capability(bdf).map(AerRegs);
    caps.fpb = accessor
        .find_extended_capability(bdf, ext_cap_id::FPB)
        .map(FpbRegs);

    caps
}

/// ASPM policy for one function (spec.md §4.11: "compute ASPM caps from
/// LinkCap; mask with ClkReq; set current ASPM from saved config or
/// from a device property").
#[derive(Debug, Clone, Copy, Default)]
pub struct AspmPolicy {
    pub supported: u16,
    pub enable: u16,
}

/// `LinkCap` bits 0-1 are the L0s/L1 ASPM-support mask; bit 18 is
/// "Clock Power Management" (ClkReq) support.
const LINK_CAP_ASPM_SUPPORT_MASK: u32 = 0x3;
const LINK_CAP_CLOCK_POWER_MANAGEMENT: u32 = 1 << 18;

fn compute_aspm_policy(
    accessor: &dyn ConfigSpaceAccessor,
    bdf: BdfAddress,
    express: ExpressRegs,
    registry: &dyn DeviceRegistry,
    saved_link_control: Option<u16>,
) -> AspmPolicy {
    let link_cap = accessor.read32(bdf, express.reg(express_regs::LINK_CAP));
    let mut supported = (link_cap & LINK_CAP_ASPM_SUPPORT_MASK) as u16;
    if link_cap & LINK_CAP_CLOCK_POWER_MANAGEMENT == 0 {
        // Without ClkReq, masking out L1 leaves the platform to fall
        // back on L0s only (spec.md §4.11 "mask with ClkReq").
        supported &= !link_control_bits::ASPM_L1;
    }

    let enable = if let Some(saved) = saved_link_control {
        saved & (link_control_bits::ASPM_L0S | link_control_bits::ASPM_L1)
    } else if let Some(PropertyValue::U32(from_property)) =
        registry.get_property(host::keys::IOPLATFORM_DEVICE_ASPM_ENABLE)
    {
        from_property as u16 & supported
    } else {
        0
    };

    AspmPolicy { supported, enable }
}

fn apply_aspm(accessor: &dyn ConfigSpaceAccessor, bdf: BdfAddress, express: ExpressRegs, policy: AspmPolicy) {
    let link_control = accessor.read16(bdf, express.reg(express_regs::LINK_CONTROL));
    let cleared = link_control & !(link_control_bits::ASPM_L0S | link_control_bits::ASPM_L1);
    accessor.write16(bdf, express.reg(express_regs::LINK_CONTROL), cleared | policy.enable);
}

/// "For P2P bridges, set SERR-forward in bridge-control" (spec.md
/// §4.11).
fn set_serr_forward(accessor: &dyn ConfigSpaceAccessor, bdf: BdfAddress) {
    let bridge_control = accessor.read16(bdf, crate::io::pci::capability::p2p_bridge_regs::BRIDGE_CONTROL);
    accessor.write16(
        bdf,
        crate::io::pci::capability::p2p_bridge_regs::BRIDGE_CONTROL,
        bridge_control | bridge_control_bits::SERR_ENABLE,
    );
}

/// AER reporting policy a device-tree property may override (spec.md
/// §4.11 "optionally program severity, mask and command per
/// device-tree properties").
#[derive(Debug, Clone, Copy, Default)]
pub struct AerPolicy {
    pub severity: Option<u32>,
    pub uncorrectable_mask: Option<u32>,
    pub correctable_mask: Option<u32>,
    pub correctable_reporting: bool,
    pub non_fatal_reporting: bool,
    pub fatal_reporting: bool,
}

fn program_aer(accessor: &dyn ConfigSpaceAccessor, bdf: BdfAddress, aer: AerRegs, policy: AerPolicy) {
    if let Some(severity) = policy.severity {
        accessor.write32(bdf, aer.reg(aer_regs::SEVERITY), severity);
    }
    if let Some(mask) = policy.uncorrectable_mask {
        accessor.write32(bdf, aer.reg(aer_regs::UNCORRECTABLE_MASK), mask);
    }
    if let Some(mask) = policy.correctable_mask {
        accessor.write32(bdf, aer.reg(aer_regs::CORRECTABLE_MASK), mask);
    }
}

/// Everything the enumerator needs to know about one function before
/// it walks capabilities, supplied by the host's device-tree glue.
pub struct EnumerationInput<'a> {
    pub bdf: BdfAddress,
    pub is_bridge: bool,
    pub hp_type: HpType,
    pub aspm_enable_override: Option<u32>,
    pub aer_policy: AerPolicy,
    pub registry: &'a dyn DeviceRegistry,
}

/// `enumerate_function()` (spec.md §4.11): discover capabilities in the
/// fixed order, apply the Express/bridge/AER policy steps, then publish
/// a config-shadow and (for bridges) register a bridge-engine entry.
pub fn enumerate_function(
    accessor: &dyn ExtendedConfigSpaceAccessor,
    shadows: &ConfigShadowStore,
    bridges: &BridgeEngine,
    input: &EnumerationInput,
) -> PublishedFunction {
    let bdf = input.bdf;
    let caps = discover_capabilities(accessor, bdf);

    if let Some(express) = caps.express {
        let policy = compute_aspm_policy(accessor, bdf, express, input.registry, None);
        let policy = AspmPolicy {
            enable: input.aspm_enable_override.map(|v| v as u16).unwrap_or(policy.enable),
            ..policy
        };
        apply_aspm(accessor, bdf, express, policy);
    }

    if input.is_bridge {
        set_serr_forward(accessor, bdf);
    }

    if let Some(aer) = caps.aer {
        program_aer(accessor, bdf, aer, input.aer_policy);
    }

    let shadow_caps = ShadowCapabilities {
        l1pm: caps.l1pm,
        ltr: caps.ltr,
        acs_offset: caps.acs,
        aer: caps.aer,
        express: caps.express,
        fpb: caps.fpb,
    };

    let mut flags = ShadowFlags::VALID;
    if input.is_bridge {
        flags |= ShadowFlags::BRIDGE;
    }
    if matches!(
        input.hp_type,
        HpType::HotPlugTunnelRoot | HpType::Root
    ) {
        flags |= ShadowFlags::HOTPLUG;
    }

    let shadow = shadows.publish(bdf, flags, input.hp_type, shadow_caps, input.is_bridge);

    let bridge = if input.is_bridge {
        let is_hotplug_capable = caps
            .express
            .map(|express| {
                let slot_cap = accessor.read32(bdf, express.reg(express_regs::SLOT_CAP));
                slot_cap & slot_cap_bits::HOTPLUG_CAPABLE != 0
            })
            .unwrap_or(false);
        let is_aer_root = matches!(input.hp_type, HpType::Root);
        Some(bridges.register_bridge(BridgeDescriptor {
            shadow,
            bdf,
            express: caps.express.unwrap_or(ExpressRegs(0)),
            pm_offset: caps.power_mgmt,
            aer: caps.aer,
            is_hotplug_capable,
            is_aer_root,
            link_control_with_pm: false,
        }))
    } else {
        None
    };

    // Endpoint-AER (a non-bridge function with its own AER capability)
    // reports through its upstream root's ring, not one of its own; this
    // enumerator only arms reporting on the function it just registered
    // as a bridge.
    if caps.aer.is_some() {
        if let Some(bridge_id) = bridge {
            bridges.enable_aer_reporting(
                bridge_id,
                accessor,
                input.aer_policy.correctable_reporting,
                input.aer_policy.non_fatal_reporting,
                input.aer_policy.fatal_reporting,
            );
        }
    }

    PublishedFunction { shadow, caps, bridge }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct FakeAccessor {
        regs: RefCell<BTreeMap<(u16, u16), u32>>,
    }

    impl FakeAccessor {
        fn new() -> Self {
            Self { regs: RefCell::new(BTreeMap::new()) }
        }
        fn set(&self, bdf: BdfAddress, offset: u16, value: u32) {
            self.regs.borrow_mut().insert((bdf.to_u16(), offset & !0x3), value);
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
            *self.regs.borrow().get(&(bdf.to_u16(), offset & !0x3)).unwrap_or(&0)
        }
        fn write8(&self, bdf: BdfAddress, offset: u16, value: u8) {
            let base = offset & !0x3;
            let shift = (offset & 0x3) * 8;
            let mut regs = self.regs.borrow_mut();
            let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
            *entry = (*entry & !(0xFFu32 << shift)) | ((value as u32) << shift);
        }
        fn write16(&self, bdf: BdfAddress, offset: u16, value: u16) {
            let base = offset & !0x3;
            let shift = (offset & 0x2) * 8;
            let mut regs = self.regs.borrow_mut();
            let entry = regs.entry((bdf.to_u16(), base)).or_insert(0);
            *entry = (*entry & !(0xFFFFu32 << shift)) | ((value as u32) << shift);
        }
        fn write32(&self, bdf: BdfAddress, offset: u16, value: u32) {
            self.regs.borrow_mut().insert((bdf.to_u16(), offset & !0x3), value);
        }
    }

    impl ExtendedConfigSpaceAccessor for FakeAccessor {}

    struct FakeRegistry;
    impl DeviceRegistry for FakeRegistry {
        fn get_property(&self, _key: &str) -> Option<PropertyValue> {
            None
        }
        fn set_property(&self, _key: &str, _value: PropertyValue) {}
        fn remove_property(&self, _key: &str) {}
    }

    fn bdf() -> BdfAddress {
        BdfAddress::new(0, 1, 0)
    }

    #[test]
    fn discovers_no_capabilities_on_bare_device() {
        let accessor = FakeAccessor::new();
        let caps = discover_capabilities(&accessor, bdf());
        assert!(caps.express.is_none());
        assert!(caps.aer.is_none());
        assert_eq!(caps.preferred_message_signaled_interrupt(), None);
    }

    #[test]
    fn aspm_support_masked_without_clkreq() {
        let accessor = FakeAccessor::new();
        let express = ExpressRegs(0x80);
        accessor.set(bdf(), express.reg(express_regs::LINK_CAP), 0x3);
        let registry = FakeRegistry;
        let policy = compute_aspm_policy(&accessor, bdf(), express, &registry, None);
        assert_eq!(policy.supported, link_control_bits::ASPM_L0S);
    }

    #[test]
    fn serr_forward_sets_bridge_control_bit() {
        let accessor = FakeAccessor::new();
        set_serr_forward(&accessor, bdf());
        let bridge_control =
            accessor.read16(bdf(), crate::io::pci::capability::p2p_bridge_regs::BRIDGE_CONTROL);
        assert_eq!(bridge_control & bridge_control_bits::SERR_ENABLE, bridge_control_bits::SERR_ENABLE);
        let _ = CoreConfig::default();
    }

    #[test]
    fn enumerate_non_bridge_function_publishes_shadow_without_bridge() {
        let accessor = FakeAccessor::new();
        let shadows = ConfigShadowStore::new();
        let bridges = BridgeEngine::new(CoreConfig::default());
        let registry = FakeRegistry;
        let input = EnumerationInput {
            bdf: bdf(),
            is_bridge: false,
            hp_type: HpType::None,
            aspm_enable_override: None,
            aer_policy: AerPolicy::default(),
            registry: &registry,
        };
        let published = enumerate_function(&accessor, &shadows, &bridges, &input);
        assert!(published.bridge.is_none());
        assert_eq!(shadows.pm_state(published.shadow), crate::power::DevicePmState::On);
    }
}
