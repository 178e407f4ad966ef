// ============================================================================
// src/io/iommu/controller.rs - Global IOMMU controller (C8)
// ============================================================================
//!
//! Installs remap units from a DMAR blob, owns the global default address
//! space plus any per-device mappers, and is the entry point `map_memory`/
//! `unmap_memory`/`insert`/`map_to_physical_address` calls land on
//! (spec.md §4.8). Root/context table bookkeeping is a `HashMap`-based
//! model rather than a literal 4 KiB-page table walk — this crate has no
//! business allocating or walking physical root/context tables itself
//! (the host's `PhysPageAllocator` stands in for the page the real table
//! would occupy); see DESIGN.md.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::host::{DeadlineClock, MemoryDescriptor, PhysPageAllocator};
use crate::io::iommu::dmar::{self, DmarTable};
use crate::io::iommu::qi::{QiEngine, QiRing};
use crate::io::iommu::remap_unit::{RemapUnit, UnitInitError, UnitRegs};
use crate::io::pci::types::ClassCode;
use crate::mm::address_space::{AddressSpace, AllocOptions, AllocSpec, DomainIdAllocator};
use crate::sync::IrqMutex;

/// Vendor ID the host-integrated-graphics exemption in `adjust_device`
/// checks for (spec.md §4.8, `original_source/vtd.c`'s `0x8086` literal).
const INTEGRATED_GRAPHICS_VENDOR_ID: u16 = 0x8086;

/// Outcome of `adjust_device` (spec.md §4.8): either the device is
/// exempted from mapping entirely, or it was attached to a per-device
/// mapper (freshly created or already present).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAdjustment {
    MapperExempt,
    Attached,
    Unchanged,
}

/// `bus << 8 | devfn` (spec.md §4.8 "encode source-id = bus:dev:fn").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u16);

impl SourceId {
    pub const fn new(bus: u8, devfn: u8) -> Self {
        Self(((bus as u16) << 8) | devfn as u16)
    }

    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn devfn(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// The other seven functions on the same bus:device, used when the
    /// device reports multi-function grouping (spec.md §4.8 "or all
    /// eight functions if the device reports multi-function grouping").
    pub fn sibling_functions(self) -> [SourceId; 8] {
        let base = self.0 & !0x7;
        core::array::from_fn(|f| SourceId(base | f as u16))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMapperOption {
    /// No C8-level action — pausing a device's mapping is handled
    /// entirely by the config-shadow engine's own `Paused` state
    /// (spec.md §4.8 only describes Activate/Unpause/Deactivate).
    Pause,
    Activate,
    Unpause,
    Deactivate,
}

/// Reserved-memory carve-out recorded at install time (spec.md §4.8 "For
/// every reserved-memory entry in the DMAR, alloc_fixed and
/// identity-map").
#[derive(Debug, Clone, Copy)]
pub struct ReservedRange {
    pub base: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapSpec {
    pub cmd: MapCommand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapCommand {
    #[default]
    ReadWrite,
    ReadOnly,
}

pub struct IommuController<R: UnitRegs> {
    qi: QiEngine<R>,
    default_space: Arc<AddressSpace>,
    device_mappers: IrqMutex<HashMap<SourceId, Arc<AddressSpace>>>,
    /// Sources `adjust_device` marked mapper-exempt (spec.md §4.8's
    /// integrated-GPU carve-out); never given a mapper even if
    /// per-device mapping is enabled.
    mapper_exempt: IrqMutex<HashMap<SourceId, ()>>,
    /// Sources `adjust_device` attached an iommu-parent to. The mapper
    /// itself stays inert (no domain, no address space) until a later
    /// `device_mapper_activate(Activate)` call actually provisions one
    /// (spec.md §4.8: "the mapper owns an independent address space
    /// once activated").
    mapper_attached: IrqMutex<HashMap<SourceId, ()>>,
    domains: DomainIdAllocator,
    reserved: Vec<ReservedRange>,
    tree_bits: u32,
    max_round: u8,
    clock: Box<dyn DeadlineClock>,
    config: CoreConfig,
    /// Fixed scratch address the QI fence command's stamp write targets.
    /// In a real host this would be a dedicated physical word; the
    /// controller only needs it to be stable and distinct per call site.
    stamp_scratch: u64,
}

const PAGE_SHIFT: u32 = 12;

impl<R: UnitRegs> IommuController<R> {
    /// `install(workloop, flags, root, dmar_blob)` (spec.md §4.8). The
    /// work-loop/root collaborators are held by the caller (enumerator
    /// glue); this crate only needs the DMAR blob, a way to map each
    /// unit's register window, and a page allocator for its own tables.
    pub fn install(
        dmar_blob: &[u8],
        map_unit_regs: impl Fn(u64) -> R,
        pages: &dyn PhysPageAllocator,
        clock: Box<dyn DeadlineClock>,
        config: CoreConfig,
    ) -> CoreResult<Self> {
        let dmar: DmarTable = dmar::parse(dmar_blob).map_err(|_| {
            CoreError::ProgrammerError("malformed DMAR blob")
        })?;

        if dmar.hardware_units.is_empty() {
            return Err(CoreError::ProgrammerError("DMAR blob has no hardware units"));
        }

        let root_table_phys = pages.alloc_pages(1);
        let context_page_phys = pages.alloc_pages(1);

        let mut rings = Vec::with_capacity(dmar.hardware_units.len());
        let mut min_domains = u16::MAX;
        let mut max_round = 0u8;
        let mut common_agaw_mask = 0x1fu8;

        for hu in &dmar.hardware_units {
            let regs = map_unit_regs(hu.register_base);
            let capability = regs.read64(crate::io::iommu::remap_unit::regs::CAPABILITY);
            let extended = regs.read64(crate::io::iommu::remap_unit::regs::EXTENDED_CAPABILITY);
            let qi_phys = pages.alloc_pages(config.qi_ring_size.div_ceil(256));

            let unit = match RemapUnit::init(regs, capability, extended, root_table_phys, qi_phys, None) {
                Ok(unit) => unit,
                Err(UnitInitError::NoQiSupport) => continue,
            };
            min_domains = min_domains.min(unit.domains());
            max_round = max_round.max(unit.rounding());
            common_agaw_mask &= unit.agaw_mask();
            unit.enable(0);
            rings.push(QiRing::new(
                unit,
                config.qi_ring_size,
                Arc::new(core::sync::atomic::AtomicU32::new(0)),
            ));
        }

        if rings.is_empty() {
            return Err(CoreError::ProgrammerError("no translating unit supports QI"));
        }

        let domain_count = if min_domains == u16::MAX { 1 } else { min_domains };
        let domains = DomainIdAllocator::new(domain_count as usize);
        let default_domain = domains.alloc().unwrap_or(0);

        // spec.md §4.8: default space sized 2^24 pages, with the low
        // 2^18 pages given to the buddy allocator and the rest to the
        // interval allocator.
        let vsize = 1u64 << 24;
        let buddy_bits = 18;
        let rsize = 1u64 << buddy_bits;
        let default_space = AddressSpace::new(vsize, buddy_bits, rsize, default_domain, config);

        let mut reserved = Vec::new();
        for rmrr in &dmar.reserved_memory {
            let base_page = rmrr.base >> PAGE_SHIFT;
            let npages = (rmrr.end - rmrr.base) >> PAGE_SHIFT;
            if default_space
                .space_alloc(
                    npages,
                    AllocOptions {
                        paging: false,
                        fixed_address: Some(base_page),
                    },
                    AllocSpec { addr_bits: 64 },
                    &[],
                )
                .is_ok()
            {
                default_space.page_table().lock().fault(base_page, npages);
                default_space
                    .page_table()
                    .lock()
                    .set(base_page, npages, true, true, &[rmrr.base], true);
                reserved.push(ReservedRange { base: rmrr.base, end: rmrr.end });
            }
        }

        let _ = context_page_phys; // recorded for parity with the source layout; not walked directly

        // spec.md §4.8: context_width is the smallest AGAW level every
        // translating unit supports in common; tree_bits = 30 + 9 *
        // context_width. A common mask of zero means the units share no
        // level at all, which install() treats as a fatal config error
        // rather than silently guessing a width.
        let context_width = common_agaw_mask.trailing_zeros();
        if context_width >= 5 {
            return Err(CoreError::ProgrammerError(
                "translating units share no common supported address width",
            ));
        }
        let tree_bits = 30 + 9 * context_width;

        let qi = QiEngine::new(rings, config);

        Ok(Self {
            qi,
            default_space,
            device_mappers: IrqMutex::new(HashMap::new()),
            mapper_exempt: IrqMutex::new(HashMap::new()),
            mapper_attached: IrqMutex::new(HashMap::new()),
            domains,
            reserved,
            tree_bits,
            max_round,
            clock,
            config,
            stamp_scratch: 0,
        })
    }

    pub fn default_space(&self) -> &Arc<AddressSpace> {
        &self.default_space
    }

    pub fn reserved_ranges(&self) -> &[ReservedRange] {
        &self.reserved
    }

    pub fn tree_bits(&self) -> u32 {
        self.tree_bits
    }

    fn space_for(&self, source: SourceId) -> Arc<AddressSpace> {
        self.device_mappers
            .lock()
            .get(&source)
            .cloned()
            .unwrap_or_else(|| self.default_space.clone())
    }

    /// `adjust_device(pci_dev)` (spec.md §4.8): called once per
    /// discovered device, before it is allowed to DMA. A host-integrated
    /// GPU on bus 0 is exempted from mapping unless the platform opted
    /// in via `map_igpu`; otherwise, if per-device mapping is enabled,
    /// find or create its mapper so a later `device_mapper_activate`
    /// call has somewhere to attach. Devices already exempted or already
    /// attached are left untouched.
    pub fn adjust_device(&self, source: SourceId, vendor_id: u16, class: ClassCode, multi_function: bool) -> DeviceAdjustment {
        if class.is_display() && source.bus() == 0 && vendor_id == INTEGRATED_GRAPHICS_VENDOR_ID && !self.config.map_igpu {
            self.mapper_exempt.lock().insert(source, ());
            return DeviceAdjustment::MapperExempt;
        }

        if self.mapper_exempt.lock().contains_key(&source) {
            return DeviceAdjustment::MapperExempt;
        }

        if !self.config.per_device_mapping {
            return DeviceAdjustment::Unchanged;
        }

        let mut attached = self.mapper_attached.lock();
        if attached.contains_key(&source) {
            return DeviceAdjustment::Unchanged;
        }
        let targets: Vec<SourceId> = if multi_function {
            source.sibling_functions().to_vec()
        } else {
            alloc::vec![source]
        };
        for target in targets {
            attached.insert(target, ());
        }
        DeviceAdjustment::Attached
    }

    pub fn is_mapper_exempt(&self, source: SourceId) -> bool {
        self.mapper_exempt.lock().contains_key(&source)
    }

    pub fn has_mapper_attached(&self, source: SourceId) -> bool {
        self.mapper_attached.lock().contains_key(&source)
    }

    /// `device_mapper_activate(mapper, options)` (spec.md §4.8).
    pub fn device_mapper_activate(
        &self,
        source: SourceId,
        option: DeviceMapperOption,
        multi_function: bool,
    ) -> CoreResult<()> {
        match option {
            DeviceMapperOption::Pause => Ok(()),
            DeviceMapperOption::Activate | DeviceMapperOption::Unpause => {
                let already_mapped = self.device_mappers.lock().contains_key(&source);
                if !already_mapped {
                    let domain_id = self.domains.alloc()?;
                    // Private 32-bit IOVA space (spec.md §4.8 "allocate a
                    // private 32-bit IOVA space if none").
                    let vsize = 1u64 << 20;
                    let buddy_bits = 14;
                    let rsize = 1u64 << buddy_bits;
                    let space = AddressSpace::new(vsize, buddy_bits, rsize, domain_id, self.config);
                    let targets: Vec<SourceId> = if multi_function {
                        source.sibling_functions().to_vec()
                    } else {
                        alloc::vec![source]
                    };
                    let mut mappers = self.device_mappers.lock();
                    for target in targets {
                        mappers.insert(target, space.clone());
                    }
                }
                let domain_id = self.space_for(source).domain_id();
                self.qi
                    .context_invalidate(Some(domain_id), self.stamp_scratch, self.clock.as_ref())
            }
            DeviceMapperOption::Deactivate => {
                let removed = self.device_mappers.lock().remove(&source);
                if let Some(space) = removed {
                    self.domains.free(space.domain_id());
                }
                self.qi
                    .context_invalidate(Some(self.default_space.domain_id()), self.stamp_scratch, self.clock.as_ref())
            }
        }
    }

    /// `map_memory(md, off, len, opts, spec, cmd, pages, *addr, *len)`
    /// (spec.md §4.8). Returns `(base<<12)+firstoff` and the effective
    /// length actually mapped.
    pub fn map_memory(
        &self,
        source: SourceId,
        md: &dyn MemoryDescriptor,
        offset: u64,
        len: u64,
        opts: AllocOptions,
        spec: AllocSpec,
        _cmd: MapCommand,
    ) -> CoreResult<(u64, u64)> {
        let first_page_offset = offset & 0xfff;
        let npages = (len + first_page_offset).div_ceil(1 << PAGE_SHIFT);
        let space = self.space_for(source);

        let base = space.space_alloc(npages, opts, spec, &[])?;

        let mut walked = 0u64;
        let mut page = base;
        let mut seg_offset = offset;
        while walked < len {
            match md.walk_segments(seg_offset) {
                Some((phys, seg_len)) => {
                    let seg_pages = seg_len.div_ceil(1 << PAGE_SHIFT).max(1);
                    space
                        .page_table()
                        .lock()
                        .fault(page, seg_pages);
                    space
                        .page_table()
                        .lock()
                        .set(page, seg_pages, true, true, &[phys], true);
                    page += seg_pages;
                    seg_offset += seg_len;
                    walked += seg_len;
                }
                None => break,
            }
        }

        Ok(((base << PAGE_SHIFT) + first_page_offset, walked))
    }

    /// `unmap_memory(md, cmd, addr, len)` (spec.md §4.7/§4.8).
    pub fn unmap_memory(&self, source: SourceId, addr: u64, len: u64) -> CoreResult<()> {
        let space = self.space_for(source);
        let page = addr >> PAGE_SHIFT;
        let npages = len.div_ceil(1 << PAGE_SHIFT);
        let is_large = npages >= 128;
        self.qi
            .space_unmap_memory(&space, page, npages, is_large, self.stamp_scratch, self.clock.as_ref())
    }

    /// `insert(opts, base, off, phys, len)` (spec.md §4.8): overwrite
    /// existing entries for an already-allocated range.
    pub fn insert(&self, source: SourceId, base: u64, phys: u64, len: u64) {
        let space = self.space_for(source);
        let page = base >> PAGE_SHIFT;
        let npages = len.div_ceil(1 << PAGE_SHIFT);
        space.page_table().lock().set(page, npages, true, true, &[phys], true);
    }

    /// `map_to_physical_address(iova)` (spec.md §4.8).
    pub fn map_to_physical_address(&self, source: SourceId, iova: u64) -> u64 {
        self.space_for(source).map_to_physical_address(iova)
    }

    pub fn check_free(&self, is_large: bool) -> usize {
        self.qi.check_free(&self.default_space, is_large)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::iommu::remap_unit::regs;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    struct FakeRegs {
        global_status: AtomicU32,
        capability: u64,
        extended_capability: u64,
    }
    unsafe impl Sync for FakeRegs {}

    impl UnitRegs for FakeRegs {
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

    struct FakeClock(AtomicU64);
    impl DeadlineClock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
    }

    struct FakePages(AtomicU64);
    impl PhysPageAllocator for FakePages {
        fn alloc_pages(&self, npages: usize) -> u64 {
            self.0.fetch_add((npages.max(1) as u64) << PAGE_SHIFT, Ordering::Relaxed)
        }
    }

    fn dmar_blob_with_one_unit() -> Vec<u8> {
        let mut blob = alloc::vec![0u8; 48];
        blob.extend_from_slice(&0u16.to_le_bytes());
        blob.extend_from_slice(&16u16.to_le_bytes());
        blob.push(0);
        blob.push(0);
        blob.extend_from_slice(&0u16.to_le_bytes());
        blob.extend_from_slice(&0xFED9_0000u64.to_le_bytes());
        blob
    }

    fn install() -> IommuController<FakeRegs> {
        let blob = dmar_blob_with_one_unit();
        let pages = FakePages(AtomicU64::new(0x1000_0000));
        let clock = alloc::boxed::Box::new(FakeClock(AtomicU64::new(0)));
        IommuController::install(
            &blob,
            |_base| FakeRegs {
                global_status: AtomicU32::new(0),
                capability: 0x1 | (4u64 << 48) | 0b010 | (1 << (8 + 3)),
                extended_capability: 1 << 1,
            },
            &pages,
            clock,
            CoreConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn install_enables_translation_on_every_unit() {
        let controller = install();
        assert_eq!(controller.default_space().domain_id(), 1);
    }

    #[test]
    fn install_computes_tree_bits_from_common_agaw_mask() {
        let controller = install();
        assert_eq!(controller.tree_bits(), 30 + 9 * 3);
    }

    #[test]
    fn device_mapper_activate_allocates_private_space() {
        let controller = install();
        let source = SourceId::new(5, 0);
        controller
            .device_mapper_activate(source, DeviceMapperOption::Activate, false)
            .unwrap();
        assert_ne!(controller.space_for(source).domain_id(), controller.default_space().domain_id());
    }

    #[test]
    fn deactivate_falls_back_to_default_space() {
        let controller = install();
        let source = SourceId::new(5, 0);
        controller
            .device_mapper_activate(source, DeviceMapperOption::Activate, false)
            .unwrap();
        controller
            .device_mapper_activate(source, DeviceMapperOption::Deactivate, false)
            .unwrap();
        assert_eq!(controller.space_for(source).domain_id(), controller.default_space().domain_id());
    }

    #[test]
    fn adjust_device_exempts_unmapped_bus0_igpu() {
        let controller = install();
        let source = SourceId::new(0, 0);
        let outcome = controller.adjust_device(source, INTEGRATED_GRAPHICS_VENDOR_ID, ClassCode::new(0x03, 0, 0), false);
        assert_eq!(outcome, DeviceAdjustment::MapperExempt);
        assert!(controller.is_mapper_exempt(source));
        assert!(!controller.has_mapper_attached(source));
    }

    #[test]
    fn adjust_device_attaches_mapper_to_ordinary_device() {
        let controller = install();
        let source = SourceId::new(5, 0);
        let outcome = controller.adjust_device(source, 0x10de, ClassCode::new(0x02, 0, 0), false);
        assert_eq!(outcome, DeviceAdjustment::Attached);
        assert!(controller.has_mapper_attached(source));
        assert!(!controller.is_mapper_exempt(source));
    }

    #[test]
    fn adjust_device_leaves_igpu_alone_when_map_igpu_is_set() {
        let blob = dmar_blob_with_one_unit();
        let pages = FakePages(AtomicU64::new(0x1000_0000));
        let clock = alloc::boxed::Box::new(FakeClock(AtomicU64::new(0)));
        let mut config = CoreConfig::default();
        config.map_igpu = true;
        let controller = IommuController::install(
            &blob,
            |_base| FakeRegs {
                global_status: AtomicU32::new(0),
                capability: 0x1 | (4u64 << 48) | 0b010 | (1 << (8 + 3)),
                extended_capability: 1 << 1,
            },
            &pages,
            clock,
            config,
        )
        .unwrap();
        let source = SourceId::new(0, 0);
        let outcome = controller.adjust_device(source, INTEGRATED_GRAPHICS_VENDOR_ID, ClassCode::new(0x03, 0, 0), false);
        assert_eq!(outcome, DeviceAdjustment::Attached);
        assert!(!controller.is_mapper_exempt(source));
    }

    #[test]
    fn source_id_sibling_functions_cover_same_bus_device() {
        let source = SourceId::new(3, 2);
        let siblings = source.sibling_functions();
        assert!(siblings.iter().all(|s| s.bus() == 3));
        assert_eq!(siblings[0].devfn() & !0x7, 0);
    }
}
