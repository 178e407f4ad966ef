// ============================================================================
// src/sync/lockfree.rs - Lock-Free SPSC Ring Buffer + Spin Backoff
// 単一プロデューサー・単一コンシューマーのロックフリーリングバッファと、
// 有界busy-waitのための指数バックオフ
// ============================================================================
#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// ロックフリーSPSC (Single-Producer Single-Consumer) リングバッファ
///
/// アドレス空間の解放キュー (`mm::address_space`) と QI リング
/// (`io::iommu::qi`) を支える固定容量キュー。
///
/// # 特徴
/// - 単一プロデューサー・単一コンシューマー
/// - ロックフリー（CASベース）
/// - キャッシュライン最適化
/// - ゼロコピー（可能な場合）
#[repr(C)]
pub struct SpscRingBuffer<T, const N: usize> {
    /// バッファ（キャッシュライン境界にアラインメント）
    buffer: UnsafeCell<[MaybeUninit<T>; N]>,
    /// 書き込みインデックス（プロデューサー所有）
    head: CacheLinePadded<AtomicUsize>,
    /// 読み取りインデックス（コンシューマー所有）
    tail: CacheLinePadded<AtomicUsize>,
}

/// キャッシュラインパディング（False Sharing防止）
/// x86_64のキャッシュラインは通常64バイト
#[repr(align(64))]
pub struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> core::ops::Deref for CacheLinePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

// SAFETY: SpscRingBufferはSend/Sync安全
// - headはプロデューサーのみが書き込み
// - tailはコンシューマーのみが書き込み
// - バッファはatomicインデックスで保護
unsafe impl<T: Send, const N: usize> Send for SpscRingBuffer<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for SpscRingBuffer<T, N> {}

impl<T, const N: usize> SpscRingBuffer<T, N> {
    /// 新しいリングバッファを作成
    /// 
    /// # Panics
    /// Nが2以上でない場合パニック
    pub const fn new() -> Self {
        assert!(N >= 2, "Ring buffer must have at least 2 slots");
        
        Self {
            buffer: UnsafeCell::new(unsafe { MaybeUninit::uninit().assume_init() }),
            head: CacheLinePadded::new(AtomicUsize::new(0)),
            tail: CacheLinePadded::new(AtomicUsize::new(0)),
        }
    }
    
    /// キャパシティを取得（実際に使用可能なスロット数はN-1）
    #[inline]
    pub const fn capacity(&self) -> usize {
        N - 1
    }
    
    /// 現在の要素数を取得
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) % N
    }
    
    /// バッファが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }
    
    /// バッファが満杯かどうか
    #[inline]
    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head.wrapping_add(1)) % N == tail
    }
    
    /// 要素をプッシュ（プロデューサー側）
    /// 
    /// # Returns
    /// - `Ok(())` - 成功
    /// - `Err(value)` - バッファが満杯で失敗（値を返却）
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let next_head = (head + 1) % N;
        
        // 満杯チェック
        if next_head == self.tail.load(Ordering::Acquire) {
            return Err(value);
        }
        
        // バッファに書き込み
        unsafe {
            let slot = &mut (*self.buffer.get())[head];
            slot.write(value);
        }
        
        // headを更新（Releaseでコンシューマーに可視化）
        self.head.store(next_head, Ordering::Release);
        
        Ok(())
    }
    
    /// 要素をポップ（コンシューマー側）
    /// 
    /// # Returns
    /// - `Some(value)` - 成功
    /// - `None` - バッファが空
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        
        // 空チェック（Acquireでプロデューサーの書き込みを可視化）
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        
        // バッファから読み取り
        let value = unsafe {
            let slot = &(*self.buffer.get())[tail];
            slot.assume_init_read()
        };
        
        // tailを更新
        let next_tail = (tail + 1) % N;
        self.tail.store(next_tail, Ordering::Release);
        
        Some(value)
    }
    
    /// 要素を覗き見（コンシューマー側、削除しない）
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        let tail = self.tail.load(Ordering::Relaxed);
        
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        
        unsafe {
            let slot = &(*self.buffer.get())[tail];
            Some(slot.assume_init_ref())
        }
    }
}

impl<T, const N: usize> Default for SpscRingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for SpscRingBuffer<T, N> {
    fn drop(&mut self) {
        // 残っている要素をドロップ
        while self.pop().is_some() {}
    }
}

// ============================================================================
// Backoff — bounded exponential spin helper
//
// Used wherever the spec calls for a bounded busy-wait instead of a
// scheduler-visible sleep: the QI ring's "spin on qi_stamp until the
// slot is reusable" rule (C7) and the 600 ms QI deadline waits
// (context/interrupt invalidate, space_unmap_memory). Spins tightly at
// first, then backs off to `core::hint::spin_loop` bursts so a long
// wait doesn't pin the issuing core at full throttle.
// ============================================================================

/// Exponential spin backoff with a cap, plus a cheap elapsed-iteration
/// counter a caller can turn into a "have we blown the deadline" check
/// without depending on a wall-clock source (the crate has none; hosts
/// translate a `Backoff` iteration budget into their own timeout in
/// `host::WorkLoop`/`EventSource` terms).
pub struct Backoff {
    step: u32,
}

const BACKOFF_SPIN_LIMIT: u32 = 6;

impl Backoff {
    #[inline]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Spin once, doubling the pause length up to `2^BACKOFF_SPIN_LIMIT`
    /// iterations of `core::hint::spin_loop`.
    #[inline]
    pub fn spin(&mut self) {
        let iters = 1u32 << self.step.min(BACKOFF_SPIN_LIMIT);
        for _ in 0..iters {
            core::hint::spin_loop();
        }
        if self.step < BACKOFF_SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// `true` once backoff has reached its maximum spin length — a
    /// natural point for a caller to switch from "definitely still
    /// fast" to "start checking a deadline".
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.step >= BACKOFF_SPIN_LIMIT
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spsc_basic() {
        let rb: SpscRingBuffer<u32, 8> = SpscRingBuffer::new();
        
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        
        // Push some values
        for i in 0..7 {
            assert!(rb.push(i).is_ok());
        }
        
        // Buffer should be full now
        assert!(rb.is_full());
        assert!(rb.push(100).is_err());
        
        // Pop values
        for i in 0..7 {
            assert_eq!(rb.pop(), Some(i));
        }
        
        assert!(rb.is_empty());
        assert_eq!(rb.pop(), None);
    }
    
    #[test]
    fn test_backoff_saturates() {
        let mut b = Backoff::new();
        assert!(!b.is_saturated());
        for _ in 0..BACKOFF_SPIN_LIMIT {
            b.spin();
        }
        assert!(b.is_saturated());
    }
}
