// ============================================================================
// src/io/pci/capability.rs - Extended Capability Register Layouts
// ============================================================================
//!
//! Register offsets for the PCI/PCIe capabilities the config-shadow engine
//! (C9) and the bridge interrupt/AER engine (C10) touch: PCI Express,
//! L1 PM Substates, Latency Tolerance Reporting, Advanced Error Reporting,
//! and Flattening Portal Bridge. Offsets are relative to the capability's
//! own base (as returned by `bus::PciBusScanner`'s capability walk), not
//! to the start of config space. These are bit-exact per the hardware
//! specs and must not be changed.

#![allow(dead_code)]

/// PCI-to-PCI bridge register offsets (absolute, from the start of config
/// space), beyond the common header.
pub mod p2p_bridge_regs {
    pub const PRIMARY_BUS: u16 = 0x18;
    pub const SECONDARY_BUS: u16 = 0x19;
    pub const SUBORDINATE_BUS: u16 = 0x1a;
    pub const MEMORY: u16 = 0x20;
    pub const PREFETCH_RANGE: u16 = 0x24;
    pub const PREFETCH_UPPER_BASE: u16 = 0x28;
    pub const PREFETCH_UPPER_LIMIT: u16 = 0x2c;
    pub const BRIDGE_CONTROL: u16 = 0x3e;
}

/// Bridge-control register bits.
pub mod bridge_control_bits {
    pub const PARITY_ERROR_RESPONSE: u16 = 1 << 0;
    pub const SERR_ENABLE: u16 = 1 << 1;
    pub const SECONDARY_BUS_RESET: u16 = 1 << 6;
}

/// PCI Express capability, relative to its capability offset.
pub mod express_regs {
    pub const CAPABILITIES: u16 = 0x02;
    pub const DEVICE_CAPABILITIES: u16 = 0x04;
    pub const DEVICE_CONTROL: u16 = 0x08;
    pub const DEVICE_STATUS: u16 = 0x0a;
    pub const LINK_CAP: u16 = 0x0c;
    pub const LINK_CONTROL: u16 = 0x10;
    pub const LINK_STATUS: u16 = 0x12;
    pub const SLOT_CAP: u16 = 0x14;
    pub const SLOT_CONTROL: u16 = 0x18;
    pub const SLOT_STATUS: u16 = 0x1a;
    pub const DEVICE_CONTROL2: u16 = 0x28;
    pub const LINK_CONTROL2: u16 = 0x30;
    pub const SLOT_CONTROL2: u16 = 0x38;
}

/// Slot Capabilities bits (C11 hot-plug classification, C10
/// `is_hotplug_capable`).
pub mod slot_cap_bits {
    pub const HOTPLUG_SURPRISE: u32 = 1 << 5;
    pub const HOTPLUG_CAPABLE: u32 = 1 << 6;
}

/// PCI Power Management capability (legacy capability list, not an
/// extended capability), relative to its capability offset. Used by
/// C10's link-control-with-PM quirk (spec.md §4.10 step 4c).
pub mod pm_regs {
    pub const CAPABILITIES: u16 = 0x02;
    pub const PMCSR: u16 = 0x04;
}

pub mod pmcsr_bits {
    pub const STATE_MASK: u16 = 0x03;
    pub const D0: u16 = 0;
    pub const D3_HOT: u16 = 3;
    pub const PME_EN: u16 = 1 << 8;
    pub const PME_STATUS: u16 = 1 << 15;
}

/// Link control bits.
pub mod link_control_bits {
    pub const ASPM_L0S: u16 = 1 << 0;
    pub const ASPM_L1: u16 = 1 << 1;
    pub const LINK_DISABLE: u16 = 1 << 4;
    pub const RETRAIN_LINK: u16 = 1 << 5;
    pub const CLOCK_POWER_MANAGEMENT: u16 = 1 << 8;
}

/// Link/slot status bits relevant to hot-plug (C10).
pub mod slot_status_bits {
    pub const ATTENTION_BUTTON_PRESSED: u16 = 1 << 0;
    pub const POWER_FAULT_DETECTED: u16 = 1 << 1;
    pub const MRL_SENSOR_CHANGED: u16 = 1 << 2;
    pub const PRESENCE_DETECT_CHANGED: u16 = 1 << 3;
    pub const COMMAND_COMPLETED: u16 = 1 << 4;
    pub const PRESENCE_DETECT_STATE: u16 = 1 << 6;
}

pub mod slot_control_bits {
    pub const POWER_FAULT_DETECTED_EN: u16 = 1 << 1;
    pub const PRESENCE_DETECT_CHANGED_EN: u16 = 1 << 3;
    pub const HOTPLUG_INTR_EN: u16 = 1 << 5;
    pub const POWER_CONTROLLER_CONTROL: u16 = 1 << 10;
}

pub mod link_status_bits {
    pub const DATA_LINK_LAYER_ACTIVE: u16 = 1 << 13;
}

/// L1 PM Substates extended capability, relative to its offset.
pub mod l1pm_regs {
    pub const CAPS0: u16 = 0x04;
    pub const CTRL0: u16 = 0x08;
    pub const CTRL1: u16 = 0x0c;
}

pub mod l1pm_ctrl_bits {
    pub const L1_2_ENABLE: u32 = 1 << 0;
    pub const L1_1_ENABLE: u32 = 1 << 1;
}

/// Latency Tolerance Reporting extended capability.
pub mod ltr_regs {
    pub const MAX: u16 = 0x04;
}

/// Advanced Error Reporting extended capability, relative to its offset.
pub mod aer_regs {
    pub const UNCORRECTABLE_STATUS: u16 = 0x04;
    pub const UNCORRECTABLE_MASK: u16 = 0x08;
    pub const SEVERITY: u16 = 0x0c;
    pub const CORRECTABLE_STATUS: u16 = 0x10;
    pub const CORRECTABLE_MASK: u16 = 0x14;
    pub const CAPS_CONTROL: u16 = 0x18;
    pub const HEADER_LOG: u16 = 0x1c; // .. +0x28, four u32 words
    pub const ROOT_CMD: u16 = 0x2c;
    pub const ROOT_STATUS: u16 = 0x30;
    pub const SOURCE_ID: u16 = 0x34;
}

pub mod root_status_bits {
    pub const CORRECTABLE_ERROR: u32 = 1 << 0;
    pub const MULTIPLE_CORRECTABLE: u32 = 1 << 1;
    pub const UNCORRECTABLE_ERROR: u32 = 1 << 2;
    pub const MULTIPLE_UNCORRECTABLE: u32 = 1 << 3;
    pub const FIRST_UNCORRECTABLE_FATAL: u32 = 1 << 4;
    pub const NON_FATAL_ERROR: u32 = 1 << 5;
    pub const FATAL_ERROR: u32 = 1 << 6;
    pub const ADVANCED_ERROR_INTERRUPT_MESSAGE_NUMBER: u32 = 0x1f << 27;
}

pub mod root_cmd_bits {
    pub const CORRECTABLE_ERROR_REPORTING_EN: u32 = 1 << 0;
    pub const NON_FATAL_ERROR_REPORTING_EN: u32 = 1 << 1;
    pub const FATAL_ERROR_REPORTING_EN: u32 = 1 << 2;
}

/// Flattening Portal Bridge extended capability.
pub mod fpb_regs {
    pub const CTRL1: u16 = 0x08;
    pub const CTRL2: u16 = 0x0c;
    pub const VECTOR_PTR: u16 = 0x1c;
    pub const VECTOR0: u16 = 0x20;
}

/// Extended capability IDs (PCIe capability list at offset 0x100+).
pub mod ext_cap_id {
    pub const AER: u16 = 0x0001;
    pub const L1PM: u16 = 0x001e;
    pub const LTR: u16 = 0x0018;
    pub const ACS: u16 = 0x000d;
    pub const FPB: u16 = 0x0024;
}

/// Marker types used to tag a discovered capability's base offset with
/// the register layout it should be read through. Kept as zero-sized
/// newtypes rather than raw `u16` so config-shadow code (C9) cannot
/// accidentally apply the wrong register layout module to an offset.
macro_rules! capability_offset {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u16);

        impl $name {
            #[inline]
            pub const fn reg(self, rel: u16) -> u16 {
                self.0 + rel
            }
        }
    };
}

capability_offset!(ExpressRegs);
capability_offset!(L1pmRegs);
capability_offset!(LtrRegs);
capability_offset!(AerRegs);
capability_offset!(FpbRegs);
