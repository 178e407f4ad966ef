// ============================================================================
// src/mm/address_space.rs - IOVA address space (C5)
// ============================================================================
//!
//! Combines the buddy allocator (C2), the interval allocator (C3), the
//! lazily-faulted page table (C4) and per-size free queues behind one
//! `domain_id`-tagged object, per spec.md §3/§4.5.
//!
//! Locking follows spec.md §5: the buddy path is guarded by a private
//! spinlock (`sync::IrqMutex`, "no operation may suspend"); the
//! interval path is guarded by a sleepable mutex (`spin::Mutex`, stood
//! in for here since the crate has no OS mutex of its own — see
//! DESIGN.md) paired with `waiting_space` (`sync::SpinCondvar`).

#![allow(dead_code)]

use alloc::sync::Arc;
use spin::Mutex as SleepableMutex;

use crate::config::CoreConfig;
use crate::error::{CoreError, NoResourcesError};
use crate::mm::bitmap::Bitmap;
use crate::mm::buddy_allocator::BuddyAllocator;
use crate::mm::interval_allocator::IntervalAllocator;
use crate::mm::page_table::PageTable;
use crate::sync::{IrqMutex, SpinCondvar};

/// Capacity of each small/large free queue ring (spec.md §3
/// `free_queue[2][N]`). Fixed at compile time because the backing ring
/// (`sync::lockfree::SpscRingBuffer`) is const-generic; see
/// `CoreConfig::free_queue_depth` for the intended tunable and
/// DESIGN.md for why it is not threaded through here.
pub const FREE_QUEUE_CAPACITY: usize = 257;

/// `(iova_page, npages, stamp)` awaiting invalidation before its range
/// can be returned to the allocator (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFree {
    pub iova_page: u64,
    pub npages: u64,
    pub stamp: u32,
}

pub type FreeQueue = crate::sync::lockfree::SpscRingBuffer<PendingFree, FREE_QUEUE_CAPACITY>;

/// Options accepted by `space_alloc` (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// The allocation is for page-table (paging) traffic — steers
    /// selection toward the buddy allocator even above the large
    /// threshold.
    pub paging: bool,
    /// Caller supplies the exact IOVA; failure is immediate (no
    /// blocking even on the interval path), per spec.md §7 "Caller
    /// retries ... unless FixedAddress is set, in which case it
    /// returns immediately."
    pub fixed_address: Option<u64>,
}

/// `addr_bits` a given allocation request must fit inside (spec.md
/// §4.5's `spec.addr_bits covers vsize` test).
#[derive(Debug, Clone, Copy)]
pub struct AllocSpec {
    pub addr_bits: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddressSpaceStats {
    pub buddy_allocations: u64,
    pub interval_allocations: u64,
    pub frees: u64,
}

/// One IOVA address space: `[0, rsize)` owned by the buddy allocator,
/// `[rsize, vsize)` by the interval allocator (spec.md §3 invariant).
pub struct AddressSpace {
    vsize: u64,
    rsize: u64,
    domain_id: u16,
    page_table: IrqMutex<PageTable>,
    buddy: IrqMutex<BuddyAllocator>,
    interval: SleepableMutex<IntervalAllocator>,
    waiting_space: SpinCondvar,
    free_queue_small: FreeQueue,
    free_queue_large: FreeQueue,
    stats: IrqMutex<AddressSpaceStats>,
    config: CoreConfig,
}

impl AddressSpace {
    /// Create a space managing `vsize` IOVA pages, with the buddy
    /// region `[0, rsize)` sized `2^buddy_bits` pages.
    pub fn new(vsize: u64, buddy_bits: u32, rsize: u64, domain_id: u16, config: CoreConfig) -> Arc<Self> {
        assert!(rsize <= vsize, "buddy/rb split exceeds vsize");
        let buddy_size = 1u64 << buddy_bits;
        assert_eq!(buddy_size, rsize, "buddy region size must equal rsize");
        let levels = 4;
        let hw_snoops = true;
        Arc::new(Self {
            vsize,
            rsize,
            domain_id,
            page_table: IrqMutex::new(PageTable::new(vsize, levels, hw_snoops)),
            buddy: IrqMutex::new(BuddyAllocator::new(rsize as usize)),
            interval: SleepableMutex::new(IntervalAllocator::new(vsize - rsize)),
            waiting_space: SpinCondvar::new(),
            free_queue_small: FreeQueue::new(),
            free_queue_large: FreeQueue::new(),
            stats: IrqMutex::new(AddressSpaceStats::default()),
            config,
        })
    }

    #[inline]
    pub fn domain_id(&self) -> u16 {
        self.domain_id
    }

    #[inline]
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    #[inline]
    pub fn rsize(&self) -> u64 {
        self.rsize
    }

    /// Tightening large-allocation threshold as the buddy region's free
    /// space shrinks (spec.md §4.5): plenty of free pages (`>=bsafe`,
    /// 128) still reserves the interval allocator for truly large
    /// requests; once free space drops below `bsafe` the threshold
    /// tightens to `breserve` (32) pages, and below `breserve` it
    /// tightens further to 1 — everything but the smallest requests
    /// gets pushed onto the interval allocator (C3) to preserve what
    /// buddy space remains. `free` is buddy pages not yet allocated.
    fn large_threshold(&self, free: u64) -> u64 {
        if free >= self.config.bsafe_threshold_pages {
            128
        } else if free >= self.config.breserve_threshold_pages {
            32
        } else {
            1
        }
    }

    fn buddy_free(&self) -> u64 {
        let buddy = self.buddy.lock();
        buddy.stats().free_pages
    }

    /// Choose buddy (C2) vs interval (C3) per spec.md §4.5's selection
    /// rule.
    fn use_interval(&self, npages: u64, opts: &AllocOptions, spec: AllocSpec) -> bool {
        if opts.paging {
            return false;
        }
        let covers_vsize = (1u64 << spec.addr_bits.min(63)) >= self.vsize || spec.addr_bits >= 64;
        npages >= self.large_threshold(self.buddy_free()) && covers_vsize
    }

    /// `space_alloc(size, opts, spec, pages) -> iova | NONE` (spec.md
    /// §4.5). `pages`, if non-empty, is written into the range via
    /// `PageTable::set` once allocated (contiguous physical run).
    pub fn space_alloc(
        &self,
        npages: u64,
        opts: AllocOptions,
        spec: AllocSpec,
        pages: &[u64],
    ) -> Result<u64, CoreError> {
        if let Some(fixed) = opts.fixed_address {
            return self.space_alloc_fixed(fixed, npages, pages);
        }

        if self.use_interval(npages, &opts, spec) {
            loop {
                let mut interval = self.interval.lock();
                match interval.rballoc(npages, 1) {
                    Some(start) => {
                        let iova = self.rsize + start;
                        drop(interval);
                        self.page_table.lock().fault(iova, npages);
                        if !pages.is_empty() {
                            self.page_table
                                .lock()
                                .set(iova, npages, true, true, pages, pages.len() == 1);
                        }
                        self.stats.lock().interval_allocations += 1;
                        return Ok(iova);
                    }
                    None => {
                        drop(interval);
                        // spec.md §4.5: "mark waiting_space = true and
                        // sleep until a free wakes the space."
                        self.waiting_space.wait_while(
                            || self.interval.lock().rballoc(npages, 1).is_none(),
                            || core::hint::spin_loop(),
                        );
                        // Loop back around: another waiter may have
                        // raced us to the freed range.
                    }
                }
            }
        } else {
            let mut buddy = self.buddy.lock();
            match buddy.balloc(npages as usize) {
                Some(iova) => {
                    drop(buddy);
                    if !pages.is_empty() {
                        self.page_table
                            .lock()
                            .set(iova, npages, true, true, pages, pages.len() == 1);
                    }
                    self.stats.lock().buddy_allocations += 1;
                    Ok(iova)
                }
                None => Err(CoreError::NoResources(NoResourcesError::AddressSpaceExhausted)),
            }
        }
    }

    fn space_alloc_fixed(&self, iova: u64, npages: u64, pages: &[u64]) -> Result<u64, CoreError> {
        if iova >= self.rsize {
            let mut interval = self.interval.lock();
            if !interval.rballoc_fixed(iova - self.rsize, npages) {
                return Err(CoreError::NoResources(NoResourcesError::AlreadyOwned));
            }
            drop(interval);
            self.page_table.lock().fault(iova, npages);
        } else {
            let mut buddy = self.buddy.lock();
            if !buddy.balloc_fixed(iova, npages as usize) {
                return Err(CoreError::NoResources(NoResourcesError::AlreadyOwned));
            }
        }
        if !pages.is_empty() {
            self.page_table
                .lock()
                .set(iova, npages, true, true, pages, pages.len() == 1);
        }
        Ok(iova)
    }

    /// `space_free(iova, size)` (spec.md §4.5): routes by region,
    /// updates stats, broadcasts `waiting_space`. Never blocks.
    pub fn space_free(&self, iova: u64, npages: u64) {
        if iova >= self.rsize {
            self.interval.lock().rbfree(iova - self.rsize, npages);
        } else {
            self.buddy.lock().bfree(iova, npages as usize);
        }
        self.stats.lock().frees += 1;
        self.waiting_space.notify_all();
    }

    pub fn page_table(&self) -> &IrqMutex<PageTable> {
        &self.page_table
    }

    pub fn free_queue(&self, is_large: bool) -> &FreeQueue {
        if is_large {
            &self.free_queue_large
        } else {
            &self.free_queue_small
        }
    }

    pub fn stats(&self) -> AddressSpaceStats {
        *self.stats.lock()
    }

    /// `map_to_physical_address(iova)`: walk the table; return the
    /// physical frame if present, else return the input unchanged
    /// (spec.md §4.8 — "used by non-VT-d code paths that assume
    /// identity mapping").
    pub fn map_to_physical_address(&self, iova: u64) -> u64 {
        const PAGE_SHIFT: u32 = 12;
        let page = iova >> PAGE_SHIFT;
        let offset = iova & 0xfff;
        let entry = self.page_table.lock().entry(page);
        if entry.is_present() {
            entry.phys_frame() | offset
        } else {
            iova
        }
    }

    /// `space_destroy`: drain both free queues, clear the domain-id
    /// bit (done by the caller, which owns the global bitmap), unwire
    /// all materialised leaf pages, release the table backing. The
    /// page table and allocators are dropped with `self`; this method
    /// asserts the free queues were already drained by `check_free`
    /// (spec.md §4.5 "must drain both free queues").
    pub fn space_destroy(&self) -> Result<(), CoreError> {
        if !self.free_queue_small.is_empty() || !self.free_queue_large.is_empty() {
            return Err(CoreError::Transient(crate::error::TransientError::NotReady));
        }
        Ok(())
    }
}

/// Global domain-id allocator (spec.md §3: "Domain 0 is reserved").
pub struct DomainIdAllocator {
    bitmap: IrqMutex<Bitmap>,
}

impl DomainIdAllocator {
    pub fn new(domain_count: usize) -> Self {
        let mut bitmap = Bitmap::bitmap_alloc(domain_count);
        bitmap.bitmap_set(0, true); // domain 0 reserved
        Self {
            bitmap: IrqMutex::new(bitmap),
        }
    }

    pub fn alloc(&self) -> Result<u16, CoreError> {
        let mut bitmap = self.bitmap.lock();
        for i in 1..bitmap.len() {
            if !bitmap.bitmap_test(i) {
                bitmap.bitmap_set(i, true);
                return Ok(i as u16);
            }
        }
        Err(CoreError::NoResources(NoResourcesError::DomainIdsExhausted))
    }

    pub fn free(&self, id: u16) {
        if id != 0 {
            self.bitmap.lock().bitmap_set(id as usize, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Arc<AddressSpace> {
        AddressSpace::new(1 << 20, 18, 1 << 18, 1, CoreConfig::default())
    }

    #[test]
    fn small_alloc_uses_buddy_region() {
        let space = space();
        let iova = space
            .space_alloc(4, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
            .unwrap();
        assert!(iova < space.rsize());
    }

    #[test]
    fn large_alloc_uses_interval_region() {
        let space = space();
        let iova = space
            .space_alloc(256, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
            .unwrap();
        assert!(iova >= space.rsize());
    }

    #[test]
    fn free_routes_by_region_and_never_blocks() {
        let space = space();
        let small = space
            .space_alloc(2, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
            .unwrap();
        let large = space
            .space_alloc(256, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
            .unwrap();
        space.space_free(small, 2);
        space.space_free(large, 256);
    }

    #[test]
    fn fixed_alloc_fails_on_overlap() {
        let space = space();
        assert!(space
            .space_alloc(
                8,
                AllocOptions {
                    paging: false,
                    fixed_address: Some(0),
                },
                AllocSpec { addr_bits: 48 },
                &[]
            )
            .is_ok());
        assert!(space
            .space_alloc(
                8,
                AllocOptions {
                    paging: false,
                    fixed_address: Some(0),
                },
                AllocSpec { addr_bits: 48 },
                &[]
            )
            .is_err());
    }

    #[test]
    fn domain_zero_is_reserved() {
        let domains = DomainIdAllocator::new(8);
        for _ in 1..8 {
            assert_ne!(domains.alloc().unwrap(), 0);
        }
    }

    /// Property test (spec §8 property 1): allocations never overlap,
    /// across the buddy/interval split.
    #[test]
    fn allocations_are_disjoint_across_both_regions() {
        let space = space();
        let mut live = alloc::vec::Vec::new();
        for size in [2u64, 4, 200, 8, 300, 16] {
            let iova = space
                .space_alloc(size, AllocOptions::default(), AllocSpec { addr_bits: 48 }, &[])
                .unwrap();
            for &(os, oe) in &live {
                assert!(iova + size <= os || iova >= oe);
            }
            live.push((iova, iova + size));
        }
    }
}
