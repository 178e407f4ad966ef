// ============================================================================
// src/mm/interval_allocator.rs - Interval (red-black) allocator (C3)
// ============================================================================
//!
//! Large, fixed, alignment-constrained IOVA allocation. The spec calls
//! for "two RB trees over `vtd_rblock { start, end }`, keyed by address
//! and by size" — the data-structure-level equivalent built here from
//! two ordered maps (`alloc::collections::BTreeMap`) over one set of
//! free intervals: one keyed by start address (for adjacency coalescing
//! and fixed-range overlap checks), one keyed by `(size, start)` (for
//! best-fit-by-size, first-fit-by-address selection). `BTreeMap`'s
//! ordered iteration gives the same selection behaviour a pair of RB
//! trees would, without pulling in a third-party intrusive-tree crate
//! the rest of the example pack never reaches for.
//!
//! This type holds no lock of its own: the address space (C5) wraps it
//! in a sleepable mutex plus a `waiting_space` condition, per the
//! contract in spec.md §4.3 ("operations hold a sleepable mutex...").

#![allow(dead_code)]

use alloc::collections::BTreeMap;

/// Half-open page range `[start, end)`, in IOVA pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: u64,
    end: u64,
}

impl Block {
    #[inline]
    fn size(self) -> u64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalStats {
    pub free_pages: u64,
    pub free_block_count: usize,
}

pub struct IntervalAllocator {
    /// start -> end, one entry per free interval.
    by_addr: BTreeMap<u64, u64>,
    /// (size, start) -> (), mirrors `by_addr` for best-fit-by-size scans.
    by_size: BTreeMap<(u64, u64), ()>,
    total_pages: u64,
}

impl IntervalAllocator {
    /// Create an allocator managing `[0, total_pages)`, entirely free.
    pub fn new(total_pages: u64) -> Self {
        let mut alloc = Self {
            by_addr: BTreeMap::new(),
            by_size: BTreeMap::new(),
            total_pages,
        };
        if total_pages > 0 {
            alloc.insert_free(Block {
                start: 0,
                end: total_pages,
            });
        }
        alloc
    }

    fn insert_free(&mut self, block: Block) {
        self.by_addr.insert(block.start, block.end);
        self.by_size.insert((block.size(), block.start), ());
    }

    fn remove_free(&mut self, block: Block) {
        self.by_addr.remove(&block.start);
        self.by_size.remove(&(block.size(), block.start));
    }

    /// Split the leftover space around `[aligned_start, aligned_start +
    /// size)` inside `block` back into free intervals.
    fn carve(&mut self, block: Block, aligned_start: u64, size: u64) {
        self.remove_free(block);
        if block.start < aligned_start {
            self.insert_free(Block {
                start: block.start,
                end: aligned_start,
            });
        }
        let alloc_end = aligned_start + size;
        if alloc_end < block.end {
            self.insert_free(Block {
                start: alloc_end,
                end: block.end,
            });
        }
    }

    /// Best-fit-by-size, first-fit-by-address allocation of `size` pages
    /// aligned to `align` pages (`align` must be a power of two).
    pub fn rballoc(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        let candidate = self.by_size.keys().copied().find_map(|(block_size, start)| {
            let end = start + block_size;
            let aligned_start = start.div_ceil(align) * align;
            if aligned_start + size <= end {
                Some((Block { start, end }, aligned_start))
            } else {
                None
            }
        });

        let (block, aligned_start) = candidate?;
        self.carve(block, aligned_start, size);
        Some(aligned_start)
    }

    /// Allocate the exact range `[start, start+size)`. Fails if it is
    /// not fully contained within one free interval (i.e. it overlaps
    /// an already-allocated range, or runs off the managed region).
    pub fn rballoc_fixed(&mut self, start: u64, size: u64) -> bool {
        if size == 0 || start + size > self.total_pages {
            return false;
        }
        let Some((&block_start, &block_end)) = self.by_addr.range(..=start).next_back() else {
            return false;
        };
        if block_start > start || start + size > block_end {
            return false;
        }
        self.carve(
            Block {
                start: block_start,
                end: block_end,
            },
            start,
            size,
        );
        true
    }

    /// Free `[iova, iova+size)`, coalescing with adjacent free blocks.
    pub fn rbfree(&mut self, iova: u64, size: u64) {
        let mut start = iova;
        let mut end = iova + size;

        // Merge with the free block immediately to the left, if any.
        if let Some((&ls, &le)) = self.by_addr.range(..start).next_back() {
            if le == start {
                self.remove_free(Block { start: ls, end: le });
                start = ls;
            }
        }
        // Merge with the free block immediately to the right, if any.
        if let Some(&re) = self.by_addr.get(&end) {
            self.remove_free(Block { start: end, end: re });
            end = re;
        }

        self.insert_free(Block { start, end });
    }

    pub fn stats(&self) -> IntervalStats {
        IntervalStats {
            free_pages: self.by_addr.values().zip(self.by_addr.keys()).map(|(e, s)| e - s).sum(),
            free_block_count: self.by_addr.len(),
        }
    }
}
