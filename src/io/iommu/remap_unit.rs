// ============================================================================
// src/io/iommu/remap_unit.rs - Remap unit driver (C6)
// ============================================================================
//!
//! One instance per physical VT-d unit. The MMIO register block is
//! accessed through [`UnitRegs`] the way `io::pci::traits::ConfigSpaceAccessor`
//! abstracts config-space access over Legacy-I/O vs. ECAM — here so tests
//! can stand in a plain `Vec<u8>`-backed fake in place of a real `ml_io_map`
//! window. Register offsets and the enable/quiesce sequencing are grounded
//! bit-for-bit in `original_source/vtd.c`'s `vtd_registers_t`, `unit_enable`
//! and `unit_quiesce`.

#![allow(dead_code)]

use bitflags::bitflags;

/// Byte offsets into the 0xc0-byte MMIO register block
/// (`original_source/vtd.c`'s `vtd_registers_t`).
pub mod regs {
    pub const VERSION: usize = 0x00;
    pub const CAPABILITY: usize = 0x08;
    pub const EXTENDED_CAPABILITY: usize = 0x10;
    pub const GLOBAL_COMMAND: usize = 0x18;
    pub const GLOBAL_STATUS: usize = 0x1c;
    pub const ROOT_ENTRY_TABLE: usize = 0x20;
    pub const CONTEXT_COMMAND: usize = 0x28;
    pub const FAULT_STATUS: usize = 0x34;
    pub const FAULT_EVENT_CONTROL: usize = 0x38;
    pub const FAULT_EVENT_DATA: usize = 0x3c;
    pub const FAULT_EVENT_ADDRESS: usize = 0x40;
    pub const FAULT_EVENT_UPPER_ADDRESS: usize = 0x44;
    pub const ADVANCED_FAULT: usize = 0x58;
    pub const INVALIDATION_QUEUE_HEAD: usize = 0x80;
    pub const INVALIDATION_QUEUE_TAIL: usize = 0x88;
    pub const INVALIDATION_QUEUE_ADDRESS: usize = 0x90;
    pub const INVALIDATION_COMPLETION_STATUS: usize = 0x9c;
    pub const INVALIDATION_COMPLETION_EVENT_CONTROL: usize = 0xa0;
    pub const INVALIDATION_COMPLETION_EVENT_DATA: usize = 0xa4;
    pub const INVALIDATION_COMPLETION_EVENT_ADDRESS: usize = 0xa8;
    pub const INVALIDATION_COMPLETION_EVENT_UPPER_ADDRESS: usize = 0xac;
    pub const INTERRUPT_REMAPPING_TABLE: usize = 0xb8;
    /// Per-translating-unit IOTLB shadow registers sit past the common
    /// block at an offset reported by the capability register; tests and
    /// the host both treat them as a second, smaller window.
    pub const IOTLB_ADDRESS: usize = 0x00;
    pub const IOTLB_COMMAND: usize = 0x08;
}

bitflags! {
    /// `global_command`/`global_status` bits (`vtd.c` `unit_enable`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalCommand: u32 {
        const SET_ROOT_TABLE = 1 << 30;
        const ENABLE_IR = 1 << 25;
        const ENABLE_QI = 1 << 26;
        const ENABLE_TRANSLATION = 1 << 31;
        const SET_IR_TABLE = 1 << 24;
        const COMPATIBILITY_FORMAT_INTERRUPT = 1 << 23;
    }
}

bitflags! {
    /// Capability bits the driver cares about (`original_source/vtd.c`
    /// lines ~145-185, and SPEC_FULL.md's grounding note).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitCaps: u32 {
        const TRANSLATING = 1 << 0;
        const QI = 1 << 1;
        const INTR_MAPPER = 1 << 2;
        const X2APIC = 1 << 3;
        const CACHING = 1 << 4;
        const GLOBAL = 1 << 5;
        const SELECTIVE = 1 << 6;
    }
}

/// Context-command bits used by `unit_enable`'s global context
/// invalidation (`1<<63` start, `1<<61` global).
pub mod context_command_bits {
    pub const INVALIDATE: u64 = 1 << 63;
    pub const GLOBAL: u64 = 1 << 61;
}

/// IOTLB command bits (`1<<63` start, `1<<60` global, drain-reads `1<<49`,
/// drain-writes `1<<48`).
pub mod iotlb_command_bits {
    pub const INVALIDATE: u64 = 1 << 63;
    pub const GLOBAL: u64 = 1 << 60;
    pub const DRAIN_READS: u64 = 1 << 49;
    pub const DRAIN_WRITES: u64 = 1 << 48;
}

/// Abstraction over the unit's MMIO window, so the engine is testable off
/// real hardware (spec.md §6 collaborator style).
pub trait UnitRegs: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read64(&self, offset: usize) -> u64;
    fn write64(&self, offset: usize, value: u64);
    fn iotlb_read64(&self, offset: usize) -> u64;
    fn iotlb_write64(&self, offset: usize, value: u64);

    fn mfence(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    fn wait_status_set(&self, mask: u32) {
        while self.read32(regs::GLOBAL_STATUS) & mask != mask {
            core::hint::spin_loop();
        }
    }

    fn wait_status_clear(&self, mask: u32) {
        while self.read32(regs::GLOBAL_STATUS) & mask != 0 {
            core::hint::spin_loop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitInitError {
    /// Unit does not support Queued Invalidation (spec.md §4.6: "units
    /// that lack QI support are rejected").
    NoQiSupport,
}

/// Parsed-down capability summary (spec.md §3 "capability flags").
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitCapSummary {
    pub caps: u32,
    pub rounding: u8,
    pub domains: u16,
}

/// One physical remap unit (spec.md §3 "Remap unit (C6)").
pub struct RemapUnit<R: UnitRegs> {
    regs: R,
    caps: UnitCaps,
    rounding: u8,
    domains: u16,
    agaw_mask: u8,
    root_phys: u64,
    qi_phys: u64,
    ir_phys: Option<u64>,
    x2apic_mode: bool,
}

impl<R: UnitRegs> RemapUnit<R> {
    /// `unit_init(dmar_entry)` (spec.md §4.6): parse capability bits,
    /// reject units without QI support.
    pub fn init(
        regs: R,
        raw_capability: u64,
        raw_extended_capability: u64,
        root_phys: u64,
        qi_phys: u64,
        ir_phys: Option<u64>,
    ) -> Result<Self, UnitInitError> {
        let mut caps = UnitCaps::empty();
        if raw_capability & 0x1 != 0 {
            caps |= UnitCaps::TRANSLATING;
        }
        if raw_extended_capability & (1 << 1) != 0 {
            caps |= UnitCaps::QI;
        }
        if raw_extended_capability & (1 << 3) != 0 {
            caps |= UnitCaps::INTR_MAPPER;
        }
        if raw_extended_capability & (1 << 4) != 0 {
            caps |= UnitCaps::X2APIC;
        }
        if raw_capability & (1 << 7) != 0 {
            caps |= UnitCaps::CACHING;
        }
        if raw_capability & (1 << 8) != 0 {
            caps |= UnitCaps::GLOBAL;
        }
        if raw_capability & (1 << 9) != 0 {
            caps |= UnitCaps::SELECTIVE;
        }

        if !caps.contains(UnitCaps::QI) {
            return Err(UnitInitError::NoQiSupport);
        }

        let rounding = ((raw_capability >> 48) & 0x3f) as u8;
        let domains = 1u16 << (4 + (raw_capability & 0x7) as u16);
        // SAGAW (Supported Adjusted Guest Address Widths), capability
        // bits 8..12: bit N set means the unit can walk an N-level-deep
        // page table beyond the 30-bit 2-level base, i.e. AGAW =
        // 30 + 9*N (spec.md §4.8 "context_width").
        let agaw_mask = ((raw_capability >> 8) & 0x1f) as u8;

        Ok(Self {
            regs,
            caps,
            rounding,
            domains,
            agaw_mask,
            root_phys,
            qi_phys,
            ir_phys,
            x2apic_mode: caps.contains(UnitCaps::X2APIC),
        })
    }

    pub fn caps(&self) -> UnitCaps {
        self.caps
    }

    pub fn cap_summary(&self) -> UnitCapSummary {
        UnitCapSummary {
            caps: self.caps.bits(),
            rounding: self.rounding,
            domains: self.domains,
        }
    }

    pub fn rounding(&self) -> u8 {
        self.rounding
    }

    pub fn domains(&self) -> u16 {
        self.domains
    }

    /// Bitmask of supported guest-address-width levels (spec.md §4.8
    /// "context_width"); bit N set means AGAW = 30 + 9*N is walkable.
    pub fn agaw_mask(&self) -> u8 {
        self.agaw_mask
    }

    /// Whether the unit can do page-selective IOTLB invalidation at all,
    /// vs. only global (spec.md §4.7's "if it fits in one rounding"
    /// branch only applies when this is set).
    pub fn selective(&self) -> bool {
        self.caps.contains(UnitCaps::SELECTIVE)
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// `unit_quiesce()` (spec.md §4.6): disable translation, IR and QI in
    /// one write, spin until all three status bits clear.
    pub fn quiesce(&self) {
        const ALL: u32 =
            GlobalCommand::ENABLE_QI.bits() | GlobalCommand::ENABLE_TRANSLATION.bits() | GlobalCommand::ENABLE_IR.bits();
        self.regs.write32(regs::GLOBAL_COMMAND, 0);
        self.regs.mfence();
        self.regs.wait_status_clear(ALL);
    }

    /// `unit_enable(stamp)` (spec.md §4.6): the five-step bring-up
    /// sequence, grounded in `original_source/vtd.c`'s `unit_enable`.
    pub fn enable(&self, qi_stamp: u32) {
        self.quiesce();

        if self.caps.contains(UnitCaps::TRANSLATING) {
            self.regs.write64(regs::ROOT_ENTRY_TABLE, self.root_phys);
            self.regs.mfence();
            self.regs
                .write32(regs::GLOBAL_COMMAND, GlobalCommand::SET_ROOT_TABLE.bits());
            self.regs.mfence();
            self.regs.wait_status_set(GlobalCommand::SET_ROOT_TABLE.bits());

            self.regs.write64(
                regs::CONTEXT_COMMAND,
                context_command_bits::INVALIDATE | context_command_bits::GLOBAL,
            );
            self.regs.mfence();
            while self.regs.read64(regs::CONTEXT_COMMAND) & context_command_bits::INVALIDATE != 0 {
                core::hint::spin_loop();
            }

            self.regs.iotlb_write64(
                regs::IOTLB_COMMAND,
                iotlb_command_bits::INVALIDATE
                    | iotlb_command_bits::GLOBAL
                    | iotlb_command_bits::DRAIN_READS
                    | iotlb_command_bits::DRAIN_WRITES,
            );
            self.regs.mfence();
            while self.regs.iotlb_read64(regs::IOTLB_COMMAND) & iotlb_command_bits::INVALIDATE != 0 {
                core::hint::spin_loop();
            }
        }

        self.regs.write64(regs::INVALIDATION_QUEUE_TAIL, 0);
        self.regs.write64(regs::INVALIDATION_QUEUE_ADDRESS, self.qi_phys);

        let mut command = GlobalCommand::ENABLE_QI.bits();
        self.regs.write32(regs::GLOBAL_COMMAND, command);
        self.regs.mfence();
        self.regs.wait_status_set(GlobalCommand::ENABLE_QI.bits());
        let _ = qi_stamp; // caller-owned QI engine seeds qi_stamp itself

        if self.caps.contains(UnitCaps::INTR_MAPPER) {
            if let Some(ir_phys) = self.ir_phys {
                let value = if self.x2apic_mode { ir_phys | (1 << 11) } else { ir_phys };
                self.regs.write64(regs::INTERRUPT_REMAPPING_TABLE, value);
                self.regs
                    .write32(regs::GLOBAL_COMMAND, GlobalCommand::SET_IR_TABLE.bits());
                self.regs.mfence();
                self.regs.wait_status_set(GlobalCommand::SET_IR_TABLE.bits());

                command |= GlobalCommand::ENABLE_IR.bits();
                self.regs.write32(regs::GLOBAL_COMMAND, command);
                self.regs.mfence();
                self.regs.wait_status_set(GlobalCommand::ENABLE_IR.bits());
            }
        }

        if self.caps.contains(UnitCaps::TRANSLATING) {
            command |= GlobalCommand::ENABLE_TRANSLATION.bits();
            self.regs.write32(regs::GLOBAL_COMMAND, command);
            self.regs.mfence();
            self.regs.wait_status_set(GlobalCommand::ENABLE_TRANSLATION.bits());
        }
    }

    /// `unit_faults(log?)` (spec.md §4.6): drain fault registers, clear
    /// fault status, optionally log and optionally abort on
    /// `panic_on_fault`.
    pub fn drain_faults(&self, log: bool, panic_on_fault: bool) -> u32 {
        let status = self.regs.read32(regs::FAULT_STATUS);
        if status != 0 {
            if log {
                log::warn!("vt-d unit fault status 0x{status:x}");
            }
            if panic_on_fault {
                panic!("vt-d primary fault (status 0x{status:x})");
            }
            self.regs.write32(regs::FAULT_STATUS, status);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// In-memory fake register window: `global_status` auto-mirrors
    /// whatever bits were last written to `global_command`, modelling
    /// hardware that completes every request instantly — enough to
    /// exercise the enable/quiesce sequencing without real MMIO.
    struct FakeRegs {
        global_command: AtomicU32,
        fault_status: AtomicU32,
        context_command: Cell<u64>,
        iotlb_command: Cell<u64>,
    }
    unsafe impl Sync for FakeRegs {}

    impl FakeRegs {
        fn new() -> Self {
            Self {
                global_command: AtomicU32::new(0),
                fault_status: AtomicU32::new(0),
                context_command: Cell::new(0),
                iotlb_command: Cell::new(0),
            }
        }
    }

    impl UnitRegs for FakeRegs {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                regs::GLOBAL_STATUS => self.global_command.load(Ordering::SeqCst),
                regs::FAULT_STATUS => self.fault_status.load(Ordering::SeqCst),
                _ => 0,
            }
        }
        fn write32(&self, offset: usize, value: u32) {
            match offset {
                regs::GLOBAL_COMMAND => self.global_command.store(value, Ordering::SeqCst),
                regs::FAULT_STATUS => self.fault_status.store(0, Ordering::SeqCst),
                _ => {}
            }
        }
        fn read64(&self, offset: usize) -> u64 {
            match offset {
                regs::CONTEXT_COMMAND => self.context_command.get(),
                _ => 0,
            }
        }
        fn write64(&self, offset: usize, value: u64) {
            if offset == regs::CONTEXT_COMMAND {
                // Instantly "complete": clear the in-progress bit.
                self.context_command
                    .set(value & !context_command_bits::INVALIDATE);
            }
        }
        fn iotlb_read64(&self, _offset: usize) -> u64 {
            self.iotlb_command.get()
        }
        fn iotlb_write64(&self, _offset: usize, value: u64) {
            self.iotlb_command.set(value & !iotlb_command_bits::INVALIDATE);
        }
    }

    fn translating_qi_caps() -> (u64, u64) {
        // capability: bit0 translating, rounding bits 48..53 = 10, domains bits 0..2 = 2,
        // SAGAW bits 8..12 = 0b00110 (levels 1 and 2 supported)
        let capability = 0x1 | (10u64 << 48) | 0b010 | (0b00110 << 8);
        // extended_capability: bit1 QI
        let extended = 1 << 1;
        (capability, extended)
    }

    #[test]
    fn rejects_unit_without_qi() {
        let regs = FakeRegs::new();
        let result = RemapUnit::init(regs, 0x1, 0, 0, 0, None);
        assert_eq!(result.err(), Some(UnitInitError::NoQiSupport));
    }

    #[test]
    fn enable_sets_translation_and_qi_status_bits() {
        let (capability, extended) = translating_qi_caps();
        let regs = FakeRegs::new();
        let unit = RemapUnit::init(regs, capability, extended, 0x1000, 0x2000, None).unwrap();
        unit.enable(0x100);
        let status = unit.regs().read32(regs::GLOBAL_STATUS);
        assert_ne!(status & GlobalCommand::ENABLE_QI.bits(), 0);
        assert_ne!(status & GlobalCommand::ENABLE_TRANSLATION.bits(), 0);
    }

    #[test]
    fn drain_faults_clears_status_and_reports_value() {
        let (capability, extended) = translating_qi_caps();
        let regs = FakeRegs::new();
        regs.fault_status.store(0x4, Ordering::SeqCst);
        let unit = RemapUnit::init(regs, capability, extended, 0, 0, None).unwrap();
        let status = unit.drain_faults(false, false);
        assert_eq!(status, 0x4);
        assert_eq!(unit.regs().read32(regs::FAULT_STATUS), 0);
    }

    #[test]
    fn rounding_and_domains_parsed_from_capability() {
        let (capability, extended) = translating_qi_caps();
        let regs = FakeRegs::new();
        let unit = RemapUnit::init(regs, capability, extended, 0, 0, None).unwrap();
        assert_eq!(unit.rounding(), 10);
        assert_eq!(unit.domains(), 1 << 6);
        assert_eq!(unit.agaw_mask(), 0b00110);
    }
}
