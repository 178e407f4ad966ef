// ============================================================================
// src/io/iommu/qi.rs - Queued-invalidation engine (C7)
// ============================================================================
//!
//! One ring per translating unit, fed through the unit's MMIO tail
//! register; `QiEngine` fans a logical invalidation out to every unit's
//! ring and waits for all of them to pass a shared stamp. Ring mutation
//! (descriptor write + tail publish) happens entirely under the hardware
//! lock (spec.md §5), which matches the teacher's "lock-free-ish"
//! framing: never blocking, but not actually lock-free since the whole
//! critical section is bounded and irq-disabled.
//!
//! Command opcodes and the `stampPassed` comparison are grounded in
//! `original_source/vtd.c` (`stampPassed(a,b) = (int32_t)(a-b) >= 0`,
//! `kQIIndexStoreMask` driving the mid-batch stamping policy).

#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::CoreConfig;
use crate::error::{CoreError, DeadlineKind};
use crate::host::DeadlineClock;
use crate::io::iommu::remap_unit::{regs, RemapUnit, UnitRegs};
use crate::mm::address_space::{AddressSpace, PendingFree};
use crate::sync::{Backoff, IrqMutex};

/// QI command opcodes (spec.md §4.7).
pub mod qi_commands {
    pub const CONTEXT_CACHE_INVALIDATE: u64 = 0x1;
    pub const IOTLB_INVALIDATE: u64 = 0x2;
    pub const INTERRUPT_ENTRY_INVALIDATE: u64 = 0x4;
    pub const FENCE: u64 = 0x5;
}

/// `stampPassed(a, b) = (int32_t)(a - b) >= 0` (`original_source/vtd.c`),
/// tolerant of 32-bit wraparound (spec §8 property 4).
#[inline]
pub fn stamp_passed(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// A 128-bit QI descriptor: `(low, high)`.
pub type Descriptor = (u64, u64);

fn context_invalidate_descriptor(global: bool, domain: u16) -> Descriptor {
    let mut low = qi_commands::CONTEXT_CACHE_INVALIDATE;
    if global {
        low |= 1 << 4;
    } else {
        low |= (domain as u64) << 16;
    }
    (low, 0)
}

fn iotlb_invalidate_descriptor(global: bool, domain: u16, addr: u64, am: u8, drain_reads: bool, drain_writes: bool) -> Descriptor {
    let mut low = qi_commands::IOTLB_INVALIDATE;
    if global {
        low |= 1 << 4;
    } else {
        low |= (domain as u64) << 16;
    }
    if drain_reads {
        low |= 1 << 6;
    }
    if drain_writes {
        low |= 1 << 7;
    }
    let high = (addr & !0xfff) | am as u64;
    (low, high)
}

fn interrupt_entry_invalidate_descriptor(index: u16, order: u8) -> Descriptor {
    let low = qi_commands::INTERRUPT_ENTRY_INVALIDATE | ((index as u64) << 32) | ((order as u64) << 27);
    (low, 0)
}

fn fence_descriptor(stamp_address: u64, stamp: u32) -> Descriptor {
    let low = qi_commands::FENCE | ((stamp as u64) << 32);
    (low, stamp_address)
}

struct RingState {
    ring: Vec<Descriptor>,
    slot_stamps: Vec<u32>,
    tail: usize,
}

impl RingState {
    fn new(capacity: usize) -> Self {
        Self {
            ring: alloc::vec![(0u64, 0u64); capacity],
            slot_stamps: alloc::vec![0u32; capacity],
            tail: 0,
        }
    }
}

/// One remap unit plus its QI ring (spec.md §3 `qi_ring`/`qi_stamps`).
pub struct QiRing<R: UnitRegs> {
    unit: RemapUnit<R>,
    state: IrqMutex<RingState>,
    /// The memory word the device's fence command writes into; polled
    /// directly rather than through MMIO (`original_source`'s
    /// `qi_stamp`).
    observed_stamp: Arc<AtomicU32>,
}

impl<R: UnitRegs> QiRing<R> {
    pub fn new(unit: RemapUnit<R>, capacity: usize, observed_stamp: Arc<AtomicU32>) -> Self {
        Self {
            unit,
            state: IrqMutex::new(RingState::new(capacity)),
            observed_stamp,
        }
    }

    pub fn unit(&self) -> &RemapUnit<R> {
        &self.unit
    }

    pub fn observed_stamp(&self) -> u32 {
        self.observed_stamp.load(Ordering::Acquire)
    }

    /// Test/host hook simulating the device completing a batch: in real
    /// hardware this word is written by the unit itself when its fence
    /// descriptor drains.
    pub fn simulate_stamp_write(&self, stamp: u32) {
        self.observed_stamp.store(stamp, Ordering::Release);
    }

    /// Push every descriptor in `batch`, tagging each slot with
    /// `batch_stamp` (the stamp the terminating fence will carry), then
    /// publish `qi_tail` with a release fence and an MMIO write
    /// (spec.md §4.7 "After pushing, publish qi_tail with a release
    /// fence, then a store to the MMIO tail register").
    fn push_batch(&self, batch: &[Descriptor], batch_stamp: u32) {
        let mut state = self.state.lock();
        let mask = state.ring.len();
        for desc in batch {
            let mut backoff = Backoff::new();
            loop {
                let idx = state.tail % mask;
                let existing = state.slot_stamps[idx];
                if stamp_passed(self.observed_stamp.load(Ordering::Acquire), existing) {
                    state.ring[idx] = *desc;
                    state.slot_stamps[idx] = batch_stamp;
                    state.tail += 1;
                    break;
                }
                backoff.spin();
            }
        }
        core::sync::atomic::fence(Ordering::Release);
        self.unit
            .regs()
            .write64(regs::INVALIDATION_QUEUE_TAIL, (state.tail as u64) << 4);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QiStats {
    pub max_check_free_burst: usize,
}

/// Drives every translating unit's ring together, per spec.md §4.7.
pub struct QiEngine<R: UnitRegs> {
    rings: Vec<QiRing<R>>,
    stamp_gen: AtomicU32,
    config: CoreConfig,
    stats: IrqMutex<QiStats>,
}

impl<R: UnitRegs> QiEngine<R> {
    pub fn new(rings: Vec<QiRing<R>>, config: CoreConfig) -> Self {
        Self {
            rings,
            stamp_gen: AtomicU32::new(1),
            config,
            stats: IrqMutex::new(QiStats { max_check_free_burst: 0 }),
        }
    }

    fn next_stamp(&self) -> u32 {
        self.stamp_gen.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn wait_all_passed(&self, stamp: u32, clock: &dyn DeadlineClock) -> Result<(), CoreError> {
        let deadline = clock.now_ms() + self.config.qi_deadline_ms as u64;
        let mut backoff = Backoff::new();
        loop {
            if self
                .rings
                .iter()
                .all(|ring| stamp_passed(ring.observed_stamp(), stamp))
            {
                return Ok(());
            }
            if clock.now_ms() >= deadline {
                return Err(DeadlineKind::QiStampWait.into());
            }
            backoff.spin();
        }
    }

    /// `context_invalidate(domain_id)` (spec.md §4.7): fence, context-
    /// cache invalidate, fence, IOTLB invalidate with drain bits, stamp;
    /// waits up to `qi_deadline_ms` for every unit, else returns
    /// `DeadlineExceeded` (the controller decides whether that is
    /// policy-fatal, per SPEC_FULL.md §0).
    pub fn context_invalidate(
        &self,
        domain_id: Option<u16>,
        stamp_address: u64,
        clock: &dyn DeadlineClock,
    ) -> Result<(), CoreError> {
        let stamp = self.next_stamp();
        let global = domain_id.is_none();
        let domain = domain_id.unwrap_or(0);
        let batch = [
            context_invalidate_descriptor(global, domain),
            iotlb_invalidate_descriptor(global, domain, 0, 0, true, true),
            fence_descriptor(stamp_address, stamp),
        ];
        for ring in &self.rings {
            ring.push_batch(&batch, stamp);
        }
        self.wait_all_passed(stamp, clock)
    }

    /// `interrupt_invalidate(index, count)` (spec.md §4.7): IR-cache
    /// invalidate with `count` rounded up to the next power of two, plus
    /// a stamp; same wait/timeout policy as `context_invalidate`.
    pub fn interrupt_invalidate(
        &self,
        index: u16,
        count: u32,
        stamp_address: u64,
        clock: &dyn DeadlineClock,
    ) -> Result<(), CoreError> {
        let stamp = self.next_stamp();
        let order = 32 - count.max(1).next_power_of_two().leading_zeros() as u8 - 1;
        let batch = [
            interrupt_entry_invalidate_descriptor(index, order),
            fence_descriptor(stamp_address, stamp),
        ];
        for ring in &self.rings {
            ring.push_batch(&batch, stamp);
        }
        self.wait_all_passed(stamp, clock)
    }

    /// `space_unmap_memory(space, iova, length)` (spec.md §4.7 steps
    /// 1-6). `is_large` selects which free queue the pending range goes
    /// on; `page_table_pages` is the page count covered.
    pub fn space_unmap_memory(
        &self,
        space: &AddressSpace,
        iova: u64,
        npages: u64,
        is_large: bool,
        stamp_address: u64,
        clock: &dyn DeadlineClock,
    ) -> Result<(), CoreError> {
        // Step 1: zero leaf entries and fence.
        space.page_table().lock().clear(iova, npages);

        // Step 3: if the target free queue is full, spin on check_free
        // up to the QI deadline.
        let deadline = clock.now_ms() + self.config.qi_deadline_ms as u64;
        let queue = space.free_queue(is_large);
        while queue.is_full() {
            self.check_free(space, is_large);
            if clock.now_ms() >= deadline {
                return Err(DeadlineKind::FreeQueueDrain.into());
            }
            core::hint::spin_loop();
        }

        let stamp = self.next_stamp();

        // Step 4: push the pending-free entry.
        let _ = queue.push(PendingFree {
            iova_page: iova,
            npages,
            stamp,
        });

        // Step 5: page-selective (if it fits in one rounding) or global
        // IOTLB invalidation per translating unit, chunked by rounding.
        // A unit without selective support has no rounding to chunk by at
        // all, so it always gets one global descriptor. A unit that does
        // support it but whose range overruns one rounding gets one
        // page-selective descriptor per `1 << rounding` pages, with a
        // fence inserted every `qi_stamp_every` descriptors so the batch
        // never outgrows the ring before the unit starts draining it
        // (`original_source/vtd.c`'s `kQIIndexStoreMask`).
        for ring in &self.rings {
            let rounding = ring.unit().rounding();
            let max_pages = 1u64 << rounding;
            let mut batch = Vec::new();
            if !ring.unit().selective() {
                batch.push(iotlb_invalidate_descriptor(true, 0, 0, 0, true, true));
            } else if npages <= max_pages {
                let am = 64 - npages.max(1).next_power_of_two().leading_zeros() as u8 - 1;
                batch.push(iotlb_invalidate_descriptor(false, 0, iova << 12, am, true, true));
            } else {
                let mut remaining = npages;
                let mut page = iova;
                let mut since_fence = 0u32;
                while remaining > 0 {
                    let chunk = remaining.min(max_pages);
                    batch.push(iotlb_invalidate_descriptor(false, 0, page << 12, rounding, true, true));
                    page += chunk;
                    remaining -= chunk;
                    since_fence += 1;
                    if remaining > 0 && since_fence >= self.config.qi_stamp_every {
                        batch.push(fence_descriptor(stamp_address, stamp));
                        since_fence = 0;
                    }
                }
            }
            batch.push(fence_descriptor(stamp_address, stamp));
            ring.push_batch(&batch, stamp);
        }

        Ok(())
    }

    /// `check_free(space, isLarge)` (spec.md §4.7): pop entries from the
    /// head of the free queue whose stamp has passed every translating
    /// unit, up to `check_free_burst` per call, tracking the largest
    /// burst as a stat.
    pub fn check_free(&self, space: &AddressSpace, is_large: bool) -> usize {
        let queue = space.free_queue(is_large);
        let mut drained = 0usize;
        while drained < self.config.check_free_burst {
            let Some(head) = queue.pop() else { break };
            let passed = self
                .rings
                .iter()
                .all(|ring| stamp_passed(ring.observed_stamp(), head.stamp));
            if !passed {
                // Not yet safe to drop; there is no peek API on the
                // ring so re-push it at the tail. Since this is the
                // only consumer (single check_free caller per space)
                // this preserves FIFO order for the next call.
                let _ = queue.push(head);
                break;
            }
            space.space_free(head.iova_page, head.npages);
            drained += 1;
        }
        if drained > 0 {
            let mut stats = self.stats.lock();
            if drained > stats.max_check_free_burst {
                stats.max_check_free_burst = drained;
            }
        }
        drained
    }

    pub fn stats(&self) -> QiStats {
        *self.stats.lock()
    }
}
