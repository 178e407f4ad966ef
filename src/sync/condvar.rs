// ============================================================================
// src/sync/condvar.rs - Spin-friendly condition variable
// ============================================================================
//!
//! The crate has no OS scheduler to block on — see DESIGN.md's resolution
//! of the "suspension points" open question in SPEC_FULL.md §5. `waiting_space`
//! (C5's `space_alloc` RB path), `tunnel_sleep`/`tunnel_wait` (C9) and the
//! per-tunnel-root `dependents` wait are all expressed against this type: a
//! monotonic generation counter bumped by every `notify_*`, paired with a
//! host-supplied park callback so a real kernel can put the calling thread
//! to sleep instead of spinning the whole wait out.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::lockfree::Backoff;

/// A condition signalled by bumping a generation counter. Carries no
/// payload and no mutex of its own — callers pair it with whatever lock
/// already guards the condition they're testing (the space's RB mutex
/// for `waiting_space`, the wake-reason mutex for `tunnel_wait`).
pub struct SpinCondvar {
    generation: AtomicU64,
}

impl SpinCondvar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Wake every waiter blocked on this condition.
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Block until `predicate` returns `false`, re-evaluating it every
    /// time `notify_all` observably runs. `park` is called once per
    /// generation the predicate remains true for; a host with a real
    /// scheduler passes a closure that parks the calling thread (e.g.
    /// via its work-loop's sleep primitive), a bare-metal caller (or a
    /// test) can pass `Backoff::spin` wrapped in a closure to busy-wait.
    ///
    /// Returns the number of generations waited through, for callers
    /// (the 600ms QI deadline checks) that want to bound the wait
    /// themselves rather than loop forever.
    pub fn wait_while<P, Park>(&self, mut predicate: P, mut park: Park) -> u64
    where
        P: FnMut() -> bool,
        Park: FnMut(),
    {
        let mut waited = 0u64;
        while predicate() {
            let before = self.generation.load(Ordering::Acquire);
            park();
            waited += 1;
            // If nothing signalled while we were parked, keep spinning
            // with a small backoff instead of parking in a tight loop —
            // guards against a host `park` that returns immediately.
            if self.generation.load(Ordering::Acquire) == before {
                let mut backoff = Backoff::new();
                backoff.spin();
            }
        }
        waited
    }
}

impl Default for SpinCondvar {
    fn default() -> Self {
        Self::new()
    }
}
