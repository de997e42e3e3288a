//! Per-thread view of the executing kernel: the intrinsics facade.
//!
//! Execution engines hand every simulated GPU thread a [`ThreadScope`]
//! implementation. The reduction algorithms in [`crate::block`] and
//! [`crate::grid`] are written against this trait only, so they run
//! unmodified on any backend that honors the contracts below.

use crate::types::{lane_of, warp_of, WARP_SIZE};

/// GPU intrinsics available to a single thread of a running kernel.
///
/// All collective methods (`shuffle_word`, `barrier`, `barrier_or`) must be
/// entered by every participating thread: the whole warp for shuffles, the
/// whole block for barriers. Diverging on a collective call is undefined
/// behavior in the execution model (on a real device it hangs; the CPU
/// engine deadlocks).
pub trait ThreadScope {
    /// Linear thread index within the block, in `0..block_threads()`.
    fn thread_id(&self) -> u32;

    /// Linear block index within the grid, in `0..grid_blocks()`.
    fn block_id(&self) -> u32;

    /// Number of threads in the block.
    fn block_threads(&self) -> u32;

    /// Number of blocks in the grid.
    fn grid_blocks(&self) -> u32;

    /// Warp-synchronous 32-bit lane exchange.
    ///
    /// Every active lane of the warp publishes `word` and receives the word
    /// published by `src_lane % WARP_SIZE`. If the source lane does not
    /// exist the result is unspecified but the call does not trap; callers
    /// guard with an explicit lane comparison.
    fn shuffle_word(&self, word: u32, src_lane: u32) -> u32;

    /// Block-wide barrier.
    fn barrier(&self);

    /// Block-wide barrier returning the OR of `pred` over all threads.
    fn barrier_or(&self, pred: bool) -> bool;

    /// Write a 32-bit word to block shared memory.
    fn shared_write_word(&self, index: usize, word: u32);

    /// Read a 32-bit word from block shared memory.
    fn shared_read_word(&self, index: usize) -> u32;

    /// Device-scope memory fence: orders this thread's prior writes before
    /// its subsequent atomics for all observers in the grid.
    fn fence_device(&self);

    /// Lane index within the warp.
    #[inline]
    fn lane_id(&self) -> u32 {
        lane_of(self.thread_id())
    }

    /// Warp index within the block.
    #[inline]
    fn warp_id(&self) -> u32 {
        warp_of(self.thread_id())
    }

    /// Number of lanes actually present in this thread's warp.
    #[inline]
    fn warp_lanes(&self) -> u32 {
        let base = self.warp_id() * WARP_SIZE;
        (self.block_threads() - base).min(WARP_SIZE)
    }
}
