//! Block-level reduction: fold every thread's value into thread 0.

use bytemuck::Pod;

use crate::scalar::{combine_loc, LocOp, ReduceOp, ReduceScalar, NO_LOC};
use crate::scope::ThreadScope;
use crate::types::{SHARED_SLOT_WORDS, WARP_SIZE};
use crate::warp::{shuffle_indexed, shuffle_xor};

// Shared-memory layout: one 16-byte value slot per warp, then one 16-byte
// index slot per warp (located reductions only).
const IDX_SLOT_BASE: usize = crate::types::MAX_WARPS as usize;

#[inline]
fn shared_store<T: Pod>(scope: &(dyn ThreadScope + '_), slot: usize, value: T) {
    let bytes = bytemuck::bytes_of(&value);
    let base = slot * SHARED_SLOT_WORDS;
    for (w, chunk) in bytes.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        scope.shared_write_word(base + w, u32::from_ne_bytes(word));
    }
}

#[inline]
fn shared_load<T: Pod>(scope: &(dyn ThreadScope + '_), slot: usize) -> T {
    let size = std::mem::size_of::<T>();
    let base = slot * SHARED_SLOT_WORDS;
    let mut bytes = [0u8; SHARED_SLOT_WORDS * 4];
    for w in 0..size.div_ceil(4) {
        bytes[w * 4..w * 4 + 4].copy_from_slice(&scope.shared_read_word(base + w).to_ne_bytes());
    }
    bytemuck::pod_read_unaligned(&bytes[..size])
}

/// Reduce `val` across the block; thread 0 receives the block aggregate,
/// every other thread an unspecified value.
///
/// Collective: every thread of the block must call this with the same `op`.
/// Shared memory may be reused by the caller once this returns.
pub fn block_reduce<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: ReduceOp,
    val: T,
) -> T {
    let num_threads = scope.block_threads();
    let thread_id = scope.thread_id();
    let lane = scope.lane_id();
    let warp = scope.warp_id();

    let mut temp = val;

    if num_threads % WARP_SIZE == 0 {
        // Full warps: the XOR butterfly needs no existence check.
        let mut i = 1;
        while i < WARP_SIZE {
            let rhs = shuffle_xor(scope, temp, i);
            temp = T::combine(temp, rhs, op);
            i *= 2;
        }
    } else {
        // Only fold from lanes that exist (don't double count own value).
        let mut i = 1;
        while i < WARP_SIZE {
            let src = thread_id ^ i;
            let rhs = shuffle_indexed(scope, temp, src);
            if src < num_threads {
                temp = T::combine(temp, rhs, op);
            }
            i *= 2;
        }
    }

    if num_threads > WARP_SIZE {
        if lane == 0 {
            shared_store(scope, warp as usize, temp);
        }

        scope.barrier();

        if warp == 0 {
            temp = if lane * WARP_SIZE < num_threads {
                shared_load(scope, lane as usize)
            } else {
                T::identity(op)
            };

            let mut i = 1;
            while i < WARP_SIZE {
                let rhs = shuffle_xor(scope, temp, i);
                temp = T::combine(temp, rhs, op);
                i *= 2;
            }
        }

        scope.barrier();
    }

    temp
}

/// Located form of [`block_reduce`]: value and index travel in parallel.
pub fn block_reduce_loc<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: LocOp,
    val: T,
    idx: i64,
) -> (T, i64) {
    let num_threads = scope.block_threads();
    let thread_id = scope.thread_id();
    let lane = scope.lane_id();
    let warp = scope.warp_id();

    let (mut temp, mut temp_idx) = (val, idx);

    if num_threads % WARP_SIZE == 0 {
        let mut i = 1;
        while i < WARP_SIZE {
            let rhs = shuffle_xor(scope, temp, i);
            let rhs_idx = shuffle_xor(scope, temp_idx, i);
            (temp, temp_idx) = combine_loc(op, temp, temp_idx, rhs, rhs_idx);
            i *= 2;
        }
    } else {
        let mut i = 1;
        while i < WARP_SIZE {
            let src = thread_id ^ i;
            let rhs = shuffle_indexed(scope, temp, src);
            let rhs_idx = shuffle_indexed(scope, temp_idx, src);
            if src < num_threads {
                (temp, temp_idx) = combine_loc(op, temp, temp_idx, rhs, rhs_idx);
            }
            i *= 2;
        }
    }

    if num_threads > WARP_SIZE {
        if lane == 0 {
            shared_store(scope, warp as usize, temp);
            shared_store(scope, IDX_SLOT_BASE + warp as usize, temp_idx);
        }

        scope.barrier();

        if warp == 0 {
            if lane * WARP_SIZE < num_threads {
                temp = shared_load(scope, lane as usize);
                temp_idx = shared_load(scope, IDX_SLOT_BASE + lane as usize);
            } else {
                temp = T::identity(op.value_op());
                temp_idx = NO_LOC;
            }

            let mut i = 1;
            while i < WARP_SIZE {
                let rhs = shuffle_xor(scope, temp, i);
                let rhs_idx = shuffle_xor(scope, temp_idx, i);
                (temp, temp_idx) = combine_loc(op, temp, temp_idx, rhs, rhs_idx);
                i *= 2;
            }
        }

        scope.barrier();
    }

    (temp, temp_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_scope::SoloScope;

    #[test]
    fn test_single_thread_block() {
        let scope = SoloScope::default();
        assert_eq!(block_reduce(&scope, ReduceOp::Sum, 41i32), 41);
        assert_eq!(block_reduce(&scope, ReduceOp::Min, 2.5f64), 2.5);
    }

    #[test]
    fn test_single_thread_block_loc() {
        let scope = SoloScope::default();
        assert_eq!(block_reduce_loc(&scope, LocOp::Min, 9.0f64, 3), (9.0, 3));
    }

    #[test]
    fn test_shared_slot_round_trip() {
        let scope = SoloScope::default();
        shared_store(&scope, 5, -1234.5f64);
        shared_store(&scope, IDX_SLOT_BASE + 5, -1i64);
        assert_eq!(shared_load::<f64>(&scope, 5), -1234.5);
        assert_eq!(shared_load::<i64>(&scope, IDX_SLOT_BASE + 5), -1);
    }
}
