// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// カーネル用の割り込み安全なロック機構とロックフリーデータ構造
// ============================================================================

pub mod irq_mutex;
pub mod lockfree;

#[allow(unused_imports)]
pub use irq_mutex::{IrqMutex, IrqMutexGuard};

#[allow(unused_imports)]
pub use lockfree::{
    // Bounded spin-backoff, used by the QI ring's stamp-wait and the
    // 600ms QI deadline waits (C7).
    Backoff,
    // Cache-line optimization
    CacheLinePadded,
    // SPSC Ring Buffer, backs the address space's per-size free queues
    // (C5/C7).
    SpscRingBuffer,
};

pub mod condvar;
pub use condvar::SpinCondvar;
