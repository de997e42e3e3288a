//! Grid-level reduction: combine per-block aggregates into one value.
//!
//! Two protocols. The tree path writes each block's aggregate to a
//! per-block scratch array and lets the last-arriving block fold the array.
//! The atomic path folds each block's aggregate into a single accumulator
//! cell with an atomic combine. Both select exactly one terminal thread
//! (thread 0 of the last block) to publish the grid aggregate; the counter
//! wrap constants differ between the two and must not be mixed up: the tree
//! path wraps at `grid_blocks - 1`, the atomic path at `grid_blocks + 1`
//! because its initialization handshake consumes the first two counts.

use crate::block::{block_reduce, block_reduce_loc};
use crate::memory::{DeviceArray, DeviceCounter, DeviceScalar};
use crate::scalar::{combine_loc, LocOp, ReduceOp, ReduceScalar, NO_LOC};
use crate::scope::ThreadScope;
use crate::warp::is_bitwise_zero;

/// Tree-path grid reduction.
///
/// Returns `Some(aggregate)` on exactly one thread of the grid (thread 0 of
/// the last block to arrive); `None` everywhere else. Collective over the
/// whole grid.
pub fn grid_reduce<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: ReduceOp,
    val: T,
    partials: &DeviceArray<T>,
    count: &DeviceCounter,
) -> Option<T> {
    let num_blocks = scope.grid_blocks();
    let num_threads = scope.block_threads();
    let wrap_around = num_blocks - 1;
    let block_id = scope.block_id();
    let thread_id = scope.thread_id();

    let mut temp = block_reduce(scope, op, val);

    if num_blocks == 1 {
        return (thread_id == 0).then_some(temp);
    }

    let mut last_block = false;

    // One thread per block publishes the block aggregate.
    if thread_id == 0 {
        partials.write(block_id as usize, temp);
        // Make the write visible to every block before releasing the count.
        scope.fence_device();
        last_block = count.inc_wrap(wrap_around) == wrap_around;
    }

    let last_block = scope.barrier_or(last_block);

    if last_block {
        temp = T::identity(op);

        let mut i = thread_id;
        while i < num_blocks {
            temp = T::combine(temp, partials.read(i as usize), op);
            i += num_threads;
        }

        temp = block_reduce(scope, op, temp);

        if thread_id == 0 {
            return Some(temp);
        }
    }

    None
}

/// Located tree-path grid reduction; value and index scratch run in parallel.
pub fn grid_reduce_loc<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: LocOp,
    val: T,
    idx: i64,
    partials: &DeviceArray<T>,
    partial_locs: &DeviceArray<i64>,
    count: &DeviceCounter,
) -> Option<(T, i64)> {
    let num_blocks = scope.grid_blocks();
    let num_threads = scope.block_threads();
    let wrap_around = num_blocks - 1;
    let block_id = scope.block_id();
    let thread_id = scope.thread_id();

    let (mut temp, mut temp_idx) = block_reduce_loc(scope, op, val, idx);

    if num_blocks == 1 {
        return (thread_id == 0).then_some((temp, temp_idx));
    }

    let mut last_block = false;

    if thread_id == 0 {
        partials.write(block_id as usize, temp);
        partial_locs.write(block_id as usize, temp_idx);
        scope.fence_device();
        last_block = count.inc_wrap(wrap_around) == wrap_around;
    }

    let last_block = scope.barrier_or(last_block);

    if last_block {
        temp = T::identity(op.value_op());
        temp_idx = NO_LOC;

        let mut i = thread_id;
        while i < num_blocks {
            (temp, temp_idx) = combine_loc(
                op,
                temp,
                temp_idx,
                partials.read(i as usize),
                partial_locs.read(i as usize),
            );
            i += num_threads;
        }

        (temp, temp_idx) = block_reduce_loc(scope, op, temp, temp_idx);

        if thread_id == 0 {
            return Some((temp, temp_idx));
        }
    }

    None
}

/// Atomic-path initialization handshake, run once per thread at worker
/// setup.
///
/// Exactly one block's thread 0 wins the 0 -> 1 CAS, stores the identity
/// when the zero-initialized accumulator does not already hold it, and
/// bumps the counter to 2. The two counts consumed here are what the
/// `grid_blocks + 1` wrap in [`grid_reduce_atomic`] accounts for, so the
/// handshake runs even when the identity store is elided.
pub fn setup_grid_atomic<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: ReduceOp,
    accumulator: &DeviceScalar<T>,
    count: &DeviceCounter,
) {
    if scope.grid_blocks() == 1 || scope.thread_id() != 0 {
        return;
    }

    if count.cas(0, 1) == 0 {
        if !is_bitwise_zero(&T::identity(op)) {
            accumulator.write(T::identity(op));
        }
        scope.fence_device();
        count.add(1);
    }
}

/// Atomic-path grid reduction.
///
/// Returns `Some(aggregate)` on exactly one thread of the grid; `None`
/// everywhere else. Requires [`setup_grid_atomic`] to have run in every
/// block. Collective over the whole grid.
pub fn grid_reduce_atomic<T: ReduceScalar>(
    scope: &(dyn ThreadScope + '_),
    op: ReduceOp,
    val: T,
    accumulator: &DeviceScalar<T>,
    count: &DeviceCounter,
) -> Option<T> {
    let num_blocks = scope.grid_blocks();
    let wrap_around = num_blocks + 1;
    let thread_id = scope.thread_id();

    let temp = block_reduce(scope, op, val);

    if num_blocks == 1 {
        return (thread_id == 0).then_some(temp);
    }

    if thread_id == 0 {
        if !is_bitwise_zero(&T::identity(op)) {
            // Wait for the winning block to install the identity.
            while count.load() < 2 {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
            scope.fence_device();
        }

        accumulator.atomic_combine(op, temp);
        scope.fence_device();

        if count.inc_wrap(wrap_around) == wrap_around {
            return Some(accumulator.read());
        }
    }

    None
}
