//! Device and pinned memory pools.
//!
//! Device memory is modeled as word-addressable storage: buffers of 64-bit
//! words holding scalar bit patterns. Pools keep a free list keyed by buffer
//! length so per-launch scratch allocation amortizes to a pop/push, and the
//! zero-initialized flavor re-zeroes buffers on hand-out (completion
//! counters and atomic accumulators rely on starting at zero).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GridFoldError, Result};
use crate::scalar::{ReduceOp, ReduceScalar};

type WordBuf = Box<[AtomicU64]>;

fn fresh_words(len: usize) -> WordBuf {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

/// Pool of device word buffers.
#[derive(Debug)]
pub struct DevicePool {
    name: String,
    zeroed: bool,
    /// Optional cap on outstanding bytes; exceeding it fails the allocation.
    capacity: Option<usize>,
    free_list: Mutex<HashMap<usize, Vec<WordBuf>>>,
    outstanding: AtomicUsize,
    total_allocations: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl DevicePool {
    /// Create a pool. `zeroed` pools hand out zero-filled buffers.
    pub fn new(name: impl Into<String>, zeroed: bool, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            zeroed,
            capacity,
            free_list: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently handed out.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Fraction of allocations served from the free list.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_allocations.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn take_words(&self, len: usize) -> Result<WordBuf> {
        let bytes = len * std::mem::size_of::<u64>();
        if let Some(cap) = self.capacity {
            if self.outstanding.load(Ordering::Relaxed) + bytes > cap {
                return Err(GridFoldError::AllocationFailed {
                    size: bytes,
                    reason: format!("pool '{}' capacity {} exhausted", self.name, cap),
                });
            }
        }

        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        let reused = {
            let mut free = self.free_list.lock();
            free.get_mut(&len).and_then(Vec::pop)
        };

        let words = match reused {
            Some(buf) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                if self.zeroed {
                    for w in buf.iter() {
                        w.store(0, Ordering::Relaxed);
                    }
                }
                buf
            }
            None => fresh_words(len),
        };

        self.outstanding.fetch_add(bytes, Ordering::Relaxed);
        Ok(words)
    }

    fn give_back(&self, words: WordBuf) {
        let bytes = words.len() * std::mem::size_of::<u64>();
        self.outstanding.fetch_sub(bytes, Ordering::Relaxed);
        let mut free = self.free_list.lock();
        free.entry(words.len()).or_default().push(words);
    }

    /// Allocate a per-block scratch array of `len` elements.
    pub fn alloc_array<T: ReduceScalar>(self: &Arc<Self>, len: usize) -> Result<DeviceArray<T>> {
        Ok(DeviceArray {
            words: Some(self.take_words(len.max(1))?),
            len,
            pool: Arc::clone(self),
            _marker: PhantomData,
        })
    }

    /// Allocate a single-element accumulator cell.
    pub fn alloc_scalar<T: ReduceScalar>(self: &Arc<Self>) -> Result<DeviceScalar<T>> {
        Ok(DeviceScalar {
            inner: self.alloc_array(1)?,
        })
    }

    /// Allocate a 32-bit completion counter.
    pub fn alloc_counter(self: &Arc<Self>) -> Result<DeviceCounter> {
        Ok(DeviceCounter {
            words: Some(self.take_words(1)?),
            pool: Arc::clone(self),
        })
    }
}

/// Device-resident array of scalars, returned to its pool on drop.
///
/// Stores use relaxed ordering; the grid protocols order them with explicit
/// device fences around the completion-counter atomics.
#[derive(Debug)]
pub struct DeviceArray<T: ReduceScalar> {
    words: Option<WordBuf>,
    len: usize,
    pool: Arc<DevicePool>,
    _marker: PhantomData<T>,
}

impl<T: ReduceScalar> DeviceArray<T> {
    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.len.max(1));
        &self.words.as_ref().expect("device array words present")[index]
    }

    /// Store `value` at `index`.
    #[inline]
    pub fn write(&self, index: usize, value: T) {
        self.word(index).store(value.to_device_bits(), Ordering::Relaxed);
    }

    /// Load the element at `index`.
    #[inline]
    pub fn read(&self, index: usize) -> T {
        T::from_device_bits(self.word(index).load(Ordering::Relaxed))
    }
}

impl<T: ReduceScalar> Drop for DeviceArray<T> {
    fn drop(&mut self) {
        if let Some(words) = self.words.take() {
            self.pool.give_back(words);
        }
    }
}

/// Single-element device accumulator with hardware-atomic style combines.
pub struct DeviceScalar<T: ReduceScalar> {
    inner: DeviceArray<T>,
}

impl<T: ReduceScalar> DeviceScalar<T> {
    /// Plain store.
    #[inline]
    pub fn write(&self, value: T) {
        self.inner.write(0, value);
    }

    /// Plain load.
    #[inline]
    pub fn read(&self) -> T {
        self.inner.read(0)
    }

    /// Atomically fold `value` into the cell under `op`.
    ///
    /// Compare-and-swap loop over the word representation, covering the
    /// float variants that have no native fetch-op.
    #[inline]
    pub fn atomic_combine(&self, op: ReduceOp, value: T) {
        let word = self.inner.word(0);
        let mut cur = word.load(Ordering::Acquire);
        loop {
            let next = T::combine(T::from_device_bits(cur), value, op).to_device_bits();
            match word.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

/// Zero-initialized 32-bit completion counter with wrap-around increment.
pub struct DeviceCounter {
    words: Option<WordBuf>,
    pool: Arc<DevicePool>,
}

impl DeviceCounter {
    #[inline]
    fn word(&self) -> &AtomicU64 {
        &self.words.as_ref().expect("device counter word present")[0]
    }

    /// Increment modulo `wrap + 1`: the stored value becomes `0` when the
    /// previous value was `>= wrap`, otherwise `previous + 1`. Returns the
    /// previous value.
    pub fn inc_wrap(&self, wrap: u32) -> u32 {
        let result = self.word().fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let cur = cur as u32;
            Some(u64::from(if cur >= wrap { 0 } else { cur + 1 }))
        });
        match result {
            Ok(prev) | Err(prev) => prev as u32,
        }
    }

    /// Compare-and-swap; returns the previous value.
    pub fn cas(&self, current: u32, new: u32) -> u32 {
        match self.word().compare_exchange(
            u64::from(current),
            u64::from(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) | Err(prev) => prev as u32,
        }
    }

    /// Unconditional add; returns the previous value.
    pub fn add(&self, value: u32) -> u32 {
        self.word().fetch_add(u64::from(value), Ordering::AcqRel) as u32
    }

    /// Current value.
    pub fn load(&self) -> u32 {
        self.word().load(Ordering::Acquire) as u32
    }
}

impl Drop for DeviceCounter {
    fn drop(&mut self) {
        if let Some(words) = self.words.take() {
            self.pool.give_back(words);
        }
    }
}

/// A pinned host result cell: value word plus index word.
///
/// Written once per kernel launch by the terminal device thread, read on the
/// host after stream synchronization.
#[derive(Default)]
pub struct PinnedSlot {
    value_bits: AtomicU64,
    index_bits: AtomicU64,
}

impl PinnedSlot {
    /// Publish a value-only aggregate.
    #[inline]
    pub fn publish<T: ReduceScalar>(&self, value: T) {
        self.value_bits.store(value.to_device_bits(), Ordering::Release);
    }

    /// Publish a located aggregate.
    #[inline]
    pub fn publish_loc<T: ReduceScalar>(&self, value: T, index: i64) {
        self.index_bits.store(index as u64, Ordering::Release);
        self.value_bits.store(value.to_device_bits(), Ordering::Release);
    }

    /// Read the aggregate value.
    #[inline]
    pub fn value<T: ReduceScalar>(&self) -> T {
        T::from_device_bits(self.value_bits.load(Ordering::Acquire))
    }

    /// Read the aggregate index.
    #[inline]
    pub fn index(&self) -> i64 {
        self.index_bits.load(Ordering::Acquire) as i64
    }

    fn reset(&self) {
        self.value_bits.store(0, Ordering::Relaxed);
        self.index_bits.store(0, Ordering::Relaxed);
    }
}

/// Pool of pinned result slots.
pub struct PinnedPool {
    /// Optional cap on outstanding slots.
    capacity: Option<usize>,
    free_list: Mutex<Vec<Arc<PinnedSlot>>>,
    outstanding: AtomicUsize,
    total_allocations: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl PinnedPool {
    /// Create a pool with an optional outstanding-slot cap.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            free_list: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        }
    }

    /// Slots currently handed out.
    pub fn outstanding_slots(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Fraction of allocations served from the free list.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_allocations.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Allocate a slot, reusing a released one when available.
    pub fn alloc_slot(&self) -> Result<Arc<PinnedSlot>> {
        if let Some(cap) = self.capacity {
            if self.outstanding.load(Ordering::Relaxed) >= cap {
                return Err(GridFoldError::AllocationFailed {
                    size: std::mem::size_of::<PinnedSlot>(),
                    reason: format!("pinned pool capacity {cap} exhausted"),
                });
            }
        }

        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut free = self.free_list.lock();
            free.pop()
        };

        let slot = match slot {
            Some(slot) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                slot.reset();
                slot
            }
            None => Arc::new(PinnedSlot::default()),
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Return a slot to the pool.
    ///
    /// Slots still referenced elsewhere (a kernel in flight) are dropped
    /// from pooling rather than recycled.
    pub fn release(&self, slot: Arc<PinnedSlot>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if Arc::strong_count(&slot) == 1 {
            self.free_list.lock().push(slot);
        }
    }
}

/// The pool triple an execution engine exposes to reducer setup.
#[derive(Clone)]
pub struct DevicePools {
    /// Uninitialized device scratch (tree-path partial arrays).
    pub device: Arc<DevicePool>,
    /// Zero-initialized device scratch (counters, atomic accumulators).
    pub device_zeroed: Arc<DevicePool>,
    /// Pinned host slots for kernel results.
    pub pinned: Arc<PinnedPool>,
}

impl DevicePools {
    /// Create the standard triple with optional byte/slot caps.
    pub fn new(device_capacity: Option<usize>, pinned_capacity: Option<usize>) -> Self {
        Self {
            device: Arc::new(DevicePool::new("device", false, device_capacity)),
            device_zeroed: Arc::new(DevicePool::new("device-zeroed", true, device_capacity)),
            pinned: Arc::new(PinnedPool::new(pinned_capacity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_array_round_trip() {
        let pool = Arc::new(DevicePool::new("test", false, None));
        let arr = pool.alloc_array::<f64>(8).unwrap();
        arr.write(3, -12.25);
        assert_eq!(arr.read(3), -12.25);
        assert_eq!(arr.len(), 8);
    }

    #[test]
    fn test_pool_reuse() {
        let pool = Arc::new(DevicePool::new("test", false, None));
        drop(pool.alloc_array::<i32>(16).unwrap());
        let _second = pool.alloc_array::<i32>(16).unwrap();
        assert_eq!(pool.hit_rate(), 0.5); // one hit out of two allocations
    }

    #[test]
    fn test_zeroed_pool_rezeroes() {
        let pool = Arc::new(DevicePool::new("zeroed", true, None));
        let arr = pool.alloc_array::<i64>(4).unwrap();
        arr.write(0, -1);
        arr.write(3, 99);
        drop(arr);
        let arr = pool.alloc_array::<i64>(4).unwrap();
        for i in 0..4 {
            assert_eq!(arr.read(i), 0);
        }
    }

    #[test]
    fn test_pool_capacity_exhaustion() {
        let pool = Arc::new(DevicePool::new("tiny", false, Some(16)));
        let held = pool.alloc_array::<i64>(2).unwrap();
        let err = pool.alloc_array::<i64>(2).unwrap_err();
        assert!(matches!(err, GridFoldError::AllocationFailed { .. }));
        drop(held);
        assert!(pool.alloc_array::<i64>(2).is_ok());
    }

    #[test]
    fn test_counter_inc_wrap() {
        let pool = Arc::new(DevicePool::new("zeroed", true, None));
        let count = pool.alloc_counter().unwrap();
        // wrap = 3: previous values cycle 0, 1, 2, 3 -> 0.
        assert_eq!(count.inc_wrap(3), 0);
        assert_eq!(count.inc_wrap(3), 1);
        assert_eq!(count.inc_wrap(3), 2);
        assert_eq!(count.inc_wrap(3), 3);
        assert_eq!(count.load(), 0);
    }

    #[test]
    fn test_counter_cas_add() {
        let pool = Arc::new(DevicePool::new("zeroed", true, None));
        let count = pool.alloc_counter().unwrap();
        assert_eq!(count.cas(0, 1), 0);
        assert_eq!(count.cas(0, 1), 1); // fails, reports current
        assert_eq!(count.add(1), 1);
        assert_eq!(count.load(), 2);
    }

    #[test]
    fn test_atomic_combine() {
        let pool = Arc::new(DevicePool::new("zeroed", true, None));
        let acc = pool.alloc_scalar::<f64>().unwrap();
        acc.write(f64::INFINITY);
        acc.atomic_combine(ReduceOp::Min, 4.0);
        acc.atomic_combine(ReduceOp::Min, 7.0);
        assert_eq!(acc.read(), 4.0);
    }

    #[test]
    fn test_pinned_slot_and_pool() {
        let pool = PinnedPool::new(Some(2));
        let slot = pool.alloc_slot().unwrap();
        slot.publish_loc(2.5f64, 41);
        assert_eq!(slot.value::<f64>(), 2.5);
        assert_eq!(slot.index(), 41);
        let _second = pool.alloc_slot().unwrap();
        assert!(pool.alloc_slot().is_err());
        pool.release(slot);
        let reused = pool.alloc_slot().unwrap();
        assert_eq!(reused.value::<f64>(), 0.0); // reset on reuse
    }
}
