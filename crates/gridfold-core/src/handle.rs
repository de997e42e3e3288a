//! User-facing reduction handles and their lifecycle roles.
//!
//! A handle passes through three roles:
//!
//! * **root** — the user-constructed object ([`ReduceSum`] and friends). It
//!   owns the seed and the per-stream tally of pinned result slots, and
//!   folds everything together on [`get`](ReduceSum::get).
//! * **launcher** — the binding produced once per launch by
//!   [`ReduceArg::bind`]. It owns the device scratch (per-block partials or
//!   the atomic accumulator, plus the completion counter) and the launch's
//!   pinned slot; dropping it after the kernel returns frees the scratch.
//! * **worker** — the per-thread guard created by the engine inside the
//!   kernel. It accumulates contributions in an interior-mutable cell and,
//!   when dropped, runs the grid reduction; thread 0 of the last block
//!   publishes the aggregate to the pinned slot.
//!
//! Reading a handle that was never launched returns the seed unchanged.
//! Reading while a launch has not yet been submitted to a stream is
//! undefined; the read only synchronizes streams already in the tally.

use std::cell::Cell;
use std::ops::AddAssign;

use parking_lot::Mutex;

use crate::error::Result;
use crate::grid::{grid_reduce, grid_reduce_atomic, grid_reduce_loc, setup_grid_atomic};
use crate::launch::{LaunchContext, ReduceArg, ReduceBinding};
use crate::memory::{DeviceArray, DeviceCounter, DeviceScalar, PinnedSlot};
use crate::scalar::{combine_loc, LocOp, ReduceOp, ReduceScalar, NO_LOC};
use crate::scope::ThreadScope;
use crate::tally::Tally;

use std::sync::Arc;

/// Grid-combination strategy for value reducers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridMode {
    /// Per-block partials folded by the last block (shared-memory tree).
    Tree,
    /// Per-block partials folded into one accumulator with atomics.
    Atomic,
}

// ---------------------------------------------------------------------------
// Value reducers
// ---------------------------------------------------------------------------

struct Reduce<T: ReduceScalar> {
    op: ReduceOp,
    mode: GridMode,
    value: Mutex<T>,
    tally: Tally,
}

impl<T: ReduceScalar> Reduce<T> {
    fn new(op: ReduceOp, mode: GridMode, seed: T) -> Self {
        Self {
            op,
            mode,
            value: Mutex::new(seed),
            tally: Tally::new(),
        }
    }

    fn combine(&self, v: T) {
        let mut value = self.value.lock();
        *value = T::combine(*value, v, self.op);
    }

    fn get(&self) -> Result<T> {
        let mut value = self.value.lock();
        if !self.tally.is_empty() {
            for stream in self.tally.streams() {
                stream.synchronize()?;
            }
            for slot in self.tally.slots() {
                *value = T::combine(*value, slot.value::<T>(), self.op);
            }
            self.tally.clear();
        }
        Ok(*value)
    }

    fn bind(&self, ctx: &LaunchContext) -> Result<ValueBinding<T>> {
        if !ctx.setup_reducers() {
            return Ok(ValueBinding {
                op: self.op,
                storage: GridStorage::Inactive,
                slot: None,
            });
        }

        let pools = ctx.pools();
        let num_blocks = ctx.current_grid_dim().linear() as usize;

        let storage = match self.mode {
            GridMode::Tree => GridStorage::Tree {
                partials: pools.device.alloc_array(num_blocks)?,
                count: pools.device_zeroed.alloc_counter()?,
            },
            GridMode::Atomic => GridStorage::Atomic {
                accumulator: pools.device_zeroed.alloc_scalar()?,
                count: pools.device_zeroed.alloc_counter()?,
            },
        };

        // Claim the slot last so a failed scratch allocation leaves no
        // unwritten slot behind in the tally.
        let slot = self
            .tally
            .new_slot(Arc::clone(ctx.current_stream()), &pools.pinned)?;

        Ok(ValueBinding {
            op: self.op,
            storage,
            slot: Some(slot),
        })
    }
}

enum GridStorage<T: ReduceScalar> {
    Tree {
        partials: DeviceArray<T>,
        count: DeviceCounter,
    },
    Atomic {
        accumulator: DeviceScalar<T>,
        count: DeviceCounter,
    },
    Inactive,
}

struct ValueBinding<T: ReduceScalar> {
    op: ReduceOp,
    storage: GridStorage<T>,
    slot: Option<Arc<PinnedSlot>>,
}

impl<T: ReduceScalar> ValueBinding<T> {
    fn worker<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> ValueWorker<'a, T> {
        if let GridStorage::Atomic { accumulator, count } = &self.storage {
            setup_grid_atomic(scope, self.op, accumulator, count);
        }
        ValueWorker {
            op: self.op,
            local: Cell::new(T::identity(self.op)),
            link: WorkerLink::Device {
                binding: self,
                scope,
            },
        }
    }
}

enum WorkerLink<'a, T: ReduceScalar> {
    /// Top-of-device copy: finalizes by grid reduction.
    Device {
        binding: &'a ValueBinding<T>,
        scope: &'a (dyn ThreadScope + 'a),
    },
    /// Nested device copy: finalizes into its parent's accumulator.
    Nested { parent: &'a ValueWorker<'a, T> },
}

struct ValueWorker<'a, T: ReduceScalar> {
    op: ReduceOp,
    local: Cell<T>,
    link: WorkerLink<'a, T>,
}

impl<'a, T: ReduceScalar> ValueWorker<'a, T> {
    #[inline]
    fn combine(&self, v: T) {
        self.local.set(T::combine(self.local.get(), v, self.op));
    }

    fn fork(&self) -> ValueWorker<'_, T> {
        ValueWorker {
            op: self.op,
            local: Cell::new(T::identity(self.op)),
            link: WorkerLink::Nested { parent: self },
        }
    }
}

impl<'a, T: ReduceScalar> Drop for ValueWorker<'a, T> {
    fn drop(&mut self) {
        match &self.link {
            WorkerLink::Nested { parent } => parent.combine(self.local.get()),
            WorkerLink::Device { binding, scope } => {
                let scope = *scope;
                let aggregate = match &binding.storage {
                    GridStorage::Tree { partials, count } => {
                        grid_reduce(scope, self.op, self.local.get(), partials, count)
                    }
                    GridStorage::Atomic { accumulator, count } => {
                        grid_reduce_atomic(scope, self.op, self.local.get(), accumulator, count)
                    }
                    GridStorage::Inactive => None,
                };
                if let (Some(v), Some(slot)) = (aggregate, &binding.slot) {
                    slot.publish(v);
                }
            }
        }
    }
}

macro_rules! value_reduce_handle {
    (
        $(#[$root_doc:meta])* $root:ident,
        $binding:ident, $worker:ident,
        $op:expr, $alias:ident
    ) => {
        $(#[$root_doc])*
        pub struct $root<T: ReduceScalar> {
            inner: Reduce<T>,
        }

        impl<T: ReduceScalar> $root<T> {
            /// Create a handle seeded with `seed`, using the tree grid path.
            pub fn new(seed: T) -> Self {
                Self {
                    inner: Reduce::new($op, GridMode::Tree, seed),
                }
            }

            /// Create a handle seeded with `seed`, choosing the grid path.
            pub fn with_mode(seed: T, mode: GridMode) -> Self {
                Self {
                    inner: Reduce::new($op, mode, seed),
                }
            }

            /// Fold `v` into the host-side value.
            pub fn $alias(&self, v: T) {
                self.inner.combine(v);
            }

            /// Synchronize every stream this handle launched on, fold all
            /// outstanding kernel results into the seed, and return the
            /// aggregate. Subsequent reads return the cached value without
            /// synchronizing.
            pub fn get(&self) -> Result<T> {
                self.inner.get()
            }

            /// Kernel results recorded but not yet folded by a read.
            pub fn pending_results(&self) -> usize {
                self.inner.tally.slot_count()
            }
        }

        impl<T: ReduceScalar> ReduceArg for $root<T> {
            type Binding = $binding<T>;

            fn bind(&self, ctx: &LaunchContext) -> Result<Self::Binding> {
                Ok($binding {
                    inner: self.inner.bind(ctx)?,
                })
            }
        }

        #[doc = concat!(
            "Launcher-role state for [`", stringify!($root),
            "`]; owned by the engine for the duration of one launch."
        )]
        pub struct $binding<T: ReduceScalar> {
            inner: ValueBinding<T>,
        }

        impl<T: ReduceScalar> ReduceBinding for $binding<T> {
            type Workers<'a> = $worker<'a, T> where Self: 'a;

            fn workers<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> Self::Workers<'a> {
                $worker {
                    inner: self.inner.worker(scope),
                }
            }
        }

        #[doc = concat!(
            "Per-thread accumulator for [`", stringify!($root),
            "`]. Dropping it (the engine does this after the kernel body) ",
            "finalizes the thread's contribution."
        )]
        pub struct $worker<'a, T: ReduceScalar> {
            inner: ValueWorker<'a, T>,
        }

        impl<'a, T: ReduceScalar> $worker<'a, T> {
            /// Fold `v` into this thread's accumulator.
            #[inline]
            pub fn combine(&self, v: T) {
                self.inner.combine(v);
            }

            /// Operation-named alias for [`combine`](Self::combine).
            #[inline]
            pub fn $alias(&self, v: T) {
                self.inner.combine(v);
            }

            /// Create a nested copy that folds into this worker on drop.
            pub fn fork(&self) -> $worker<'_, T> {
                $worker {
                    inner: self.inner.fork(),
                }
            }
        }
    };
}

value_reduce_handle!(
    /// Sum reduction handle: combines with `+`, identity `0`.
    ReduceSum,
    SumBinding,
    SumWorker,
    ReduceOp::Sum,
    add
);

value_reduce_handle!(
    /// Minimum reduction handle.
    ReduceMin,
    MinBinding,
    MinWorker,
    ReduceOp::Min,
    min
);

value_reduce_handle!(
    /// Maximum reduction handle.
    ReduceMax,
    MaxBinding,
    MaxWorker,
    ReduceOp::Max,
    max
);

impl<'a, T: ReduceScalar> AddAssign<T> for SumWorker<'a, T> {
    #[inline]
    fn add_assign(&mut self, v: T) {
        self.inner.combine(v);
    }
}

// ---------------------------------------------------------------------------
// Located reducers (tree path only: value/index pairs have no hardware atomic)
// ---------------------------------------------------------------------------

struct LocReduce<T: ReduceScalar> {
    op: LocOp,
    state: Mutex<(T, i64)>,
    tally: Tally,
}

impl<T: ReduceScalar> LocReduce<T> {
    fn new(op: LocOp, seed: T, seed_idx: i64) -> Self {
        Self {
            op,
            state: Mutex::new((seed, seed_idx)),
            tally: Tally::new(),
        }
    }

    fn combine(&self, v: T, i: i64) {
        let mut state = self.state.lock();
        *state = combine_loc(self.op, state.0, state.1, v, i);
    }

    fn get_pair(&self) -> Result<(T, i64)> {
        let mut state = self.state.lock();
        if !self.tally.is_empty() {
            for stream in self.tally.streams() {
                stream.synchronize()?;
            }
            for slot in self.tally.slots() {
                *state = combine_loc(self.op, state.0, state.1, slot.value::<T>(), slot.index());
            }
            self.tally.clear();
        }
        Ok(*state)
    }

    fn bind(&self, ctx: &LaunchContext) -> Result<LocBinding<T>> {
        if !ctx.setup_reducers() {
            return Ok(LocBinding {
                op: self.op,
                storage: LocStorage::Inactive,
                slot: None,
            });
        }

        let pools = ctx.pools();
        let num_blocks = ctx.current_grid_dim().linear() as usize;

        let storage = LocStorage::Tree {
            partials: pools.device.alloc_array(num_blocks)?,
            partial_locs: pools.device.alloc_array(num_blocks)?,
            count: pools.device_zeroed.alloc_counter()?,
        };

        let slot = self
            .tally
            .new_slot(Arc::clone(ctx.current_stream()), &pools.pinned)?;

        Ok(LocBinding {
            op: self.op,
            storage,
            slot: Some(slot),
        })
    }
}

enum LocStorage<T: ReduceScalar> {
    Tree {
        partials: DeviceArray<T>,
        partial_locs: DeviceArray<i64>,
        count: DeviceCounter,
    },
    Inactive,
}

struct LocBinding<T: ReduceScalar> {
    op: LocOp,
    storage: LocStorage<T>,
    slot: Option<Arc<PinnedSlot>>,
}

impl<T: ReduceScalar> LocBinding<T> {
    fn worker<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> LocWorker<'a, T> {
        LocWorker {
            op: self.op,
            val: Cell::new(T::identity(self.op.value_op())),
            idx: Cell::new(NO_LOC),
            link: LocLink::Device {
                binding: self,
                scope,
            },
        }
    }
}

enum LocLink<'a, T: ReduceScalar> {
    Device {
        binding: &'a LocBinding<T>,
        scope: &'a (dyn ThreadScope + 'a),
    },
    Nested { parent: &'a LocWorker<'a, T> },
}

struct LocWorker<'a, T: ReduceScalar> {
    op: LocOp,
    val: Cell<T>,
    idx: Cell<i64>,
    link: LocLink<'a, T>,
}

impl<'a, T: ReduceScalar> LocWorker<'a, T> {
    #[inline]
    fn combine(&self, v: T, i: i64) {
        let (val, idx) = combine_loc(self.op, self.val.get(), self.idx.get(), v, i);
        self.val.set(val);
        self.idx.set(idx);
    }

    fn fork(&self) -> LocWorker<'_, T> {
        LocWorker {
            op: self.op,
            val: Cell::new(T::identity(self.op.value_op())),
            idx: Cell::new(NO_LOC),
            link: LocLink::Nested { parent: self },
        }
    }
}

impl<'a, T: ReduceScalar> Drop for LocWorker<'a, T> {
    fn drop(&mut self) {
        match &self.link {
            LocLink::Nested { parent } => parent.combine(self.val.get(), self.idx.get()),
            LocLink::Device { binding, scope } => {
                let scope = *scope;
                let aggregate = match &binding.storage {
                    LocStorage::Tree {
                        partials,
                        partial_locs,
                        count,
                    } => grid_reduce_loc(
                        scope,
                        self.op,
                        self.val.get(),
                        self.idx.get(),
                        partials,
                        partial_locs,
                        count,
                    ),
                    LocStorage::Inactive => None,
                };
                if let (Some((v, i)), Some(slot)) = (aggregate, &binding.slot) {
                    slot.publish_loc(v, i);
                }
            }
        }
    }
}

macro_rules! loc_reduce_handle {
    (
        $(#[$root_doc:meta])* $root:ident,
        $binding:ident, $worker:ident,
        $op:expr, $alias:ident
    ) => {
        $(#[$root_doc])*
        pub struct $root<T: ReduceScalar> {
            inner: LocReduce<T>,
        }

        impl<T: ReduceScalar> $root<T> {
            /// Create a handle seeded with `seed` at `seed_idx` (`-1` means
            /// no location known).
            pub fn new(seed: T, seed_idx: i64) -> Self {
                Self {
                    inner: LocReduce::new($op, seed, seed_idx),
                }
            }

            /// Fold `(v, i)` into the host-side state.
            pub fn $alias(&self, v: T, i: i64) {
                self.inner.combine(v, i);
            }

            /// Synchronize and return the aggregate value.
            pub fn get(&self) -> Result<T> {
                Ok(self.inner.get_pair()?.0)
            }

            /// Synchronize and return the aggregate location.
            pub fn get_loc(&self) -> Result<i64> {
                Ok(self.inner.get_pair()?.1)
            }

            /// Kernel results recorded but not yet folded by a read.
            pub fn pending_results(&self) -> usize {
                self.inner.tally.slot_count()
            }
        }

        impl<T: ReduceScalar> ReduceArg for $root<T> {
            type Binding = $binding<T>;

            fn bind(&self, ctx: &LaunchContext) -> Result<Self::Binding> {
                Ok($binding {
                    inner: self.inner.bind(ctx)?,
                })
            }
        }

        #[doc = concat!("Launcher-role state for [`", stringify!($root), "`].")]
        pub struct $binding<T: ReduceScalar> {
            inner: LocBinding<T>,
        }

        impl<T: ReduceScalar> ReduceBinding for $binding<T> {
            type Workers<'a> = $worker<'a, T> where Self: 'a;

            fn workers<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> Self::Workers<'a> {
                $worker {
                    inner: self.inner.worker(scope),
                }
            }
        }

        #[doc = concat!("Per-thread accumulator for [`", stringify!($root), "`].")]
        pub struct $worker<'a, T: ReduceScalar> {
            inner: LocWorker<'a, T>,
        }

        impl<'a, T: ReduceScalar> $worker<'a, T> {
            /// Fold `(v, i)` into this thread's accumulator.
            #[inline]
            pub fn combine(&self, v: T, i: i64) {
                self.inner.combine(v, i);
            }

            /// Operation-named alias for [`combine`](Self::combine).
            #[inline]
            pub fn $alias(&self, v: T, i: i64) {
                self.inner.combine(v, i);
            }

            /// Create a nested copy that folds into this worker on drop.
            pub fn fork(&self) -> $worker<'_, T> {
                $worker {
                    inner: self.inner.fork(),
                }
            }
        }
    };
}

loc_reduce_handle!(
    /// Minimum-with-location reduction handle. Ties resolve to the lowest
    /// index.
    ReduceMinLoc,
    MinLocBinding,
    MinLocWorker,
    LocOp::Min,
    minloc
);

loc_reduce_handle!(
    /// Maximum-with-location reduction handle. Ties resolve to the lowest
    /// index.
    ReduceMaxLoc,
    MaxLocBinding,
    MaxLocWorker,
    LocOp::Max,
    maxloc
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{LaunchConfig, StreamHandle};
    use crate::memory::DevicePools;
    use crate::test_scope::SoloScope;
    use crate::types::Dim3;

    struct NullStream;

    impl StreamHandle for NullStream {
        fn id(&self) -> u64 {
            0
        }

        fn synchronize(&self) -> Result<()> {
            Ok(())
        }
    }

    fn solo_context(active: bool) -> LaunchContext {
        LaunchContext::new(
            Arc::new(NullStream),
            Dim3::new_1d(1),
            Dim3::new_1d(1),
            DevicePools::new(None, None),
            active,
        )
    }

    #[test]
    fn test_unlaunched_handle_returns_seed() {
        let sum = ReduceSum::new(7i32);
        assert_eq!(sum.get().unwrap(), 7);
        assert_eq!(sum.get().unwrap(), 7);

        let minloc = ReduceMinLoc::new(f64::INFINITY, NO_LOC);
        assert_eq!(minloc.get().unwrap(), f64::INFINITY);
        assert_eq!(minloc.get_loc().unwrap(), NO_LOC);
    }

    #[test]
    fn test_inactive_bind_allocates_nothing() {
        let sum = ReduceSum::new(0i64);
        let binding = sum.bind(&solo_context(false)).unwrap();
        assert!(binding.inner.slot.is_none());
        assert_eq!(sum.pending_results(), 0);
    }

    #[test]
    fn test_solo_launch_lifecycle() {
        let sum = ReduceSum::new(10i32);
        let binding = sum.bind(&solo_context(true)).unwrap();
        assert_eq!(sum.pending_results(), 1);

        {
            let scope = SoloScope::default();
            let worker = binding.workers(&scope);
            worker.add(5);
            worker.combine(7);
        }

        drop(binding);
        assert_eq!(sum.get().unwrap(), 22);
        // Second read folds nothing further.
        assert_eq!(sum.pending_results(), 0);
        assert_eq!(sum.get().unwrap(), 22);
    }

    #[test]
    fn test_solo_launch_atomic_mode() {
        let min = ReduceMin::with_mode(i32::MAX, GridMode::Atomic);
        let binding = min.bind(&solo_context(true)).unwrap();

        {
            let scope = SoloScope::default();
            let worker = binding.workers(&scope);
            worker.min(42);
            worker.min(17);
        }

        drop(binding);
        assert_eq!(min.get().unwrap(), 17);
    }

    #[test]
    fn test_fork_folds_into_parent() {
        let sum = ReduceSum::new(0i32);
        let binding = sum.bind(&solo_context(true)).unwrap();

        {
            let scope = SoloScope::default();
            let worker = binding.workers(&scope);
            worker.add(1);
            {
                let child = worker.fork();
                child.add(2);
                let grandchild = child.fork();
                grandchild.add(3);
            }
            worker.add(4);
        }

        drop(binding);
        assert_eq!(sum.get().unwrap(), 10);
    }

    #[test]
    fn test_solo_minloc_lifecycle() {
        let minloc = ReduceMinLoc::new(f64::INFINITY, NO_LOC);
        let binding = minloc.bind(&solo_context(true)).unwrap();

        {
            let scope = SoloScope::default();
            let worker = binding.workers(&scope);
            worker.minloc(4.0, 0);
            worker.minloc(2.0, 3);
            worker.minloc(2.0, 1);
            worker.minloc(5.0, 2);
        }

        drop(binding);
        assert_eq!(minloc.get().unwrap(), 2.0);
        assert_eq!(minloc.get_loc().unwrap(), 1);
    }

    #[test]
    fn test_host_side_combine() {
        let max = ReduceMax::new(0.0f32);
        max.max(3.5);
        max.max(-1.0);
        assert_eq!(max.get().unwrap(), 3.5);
    }

    #[test]
    fn test_launch_config_reexport_sanity() {
        // Bindings come from the same config the engine validates.
        assert!(LaunchConfig::new(1, 1).validate().is_ok());
    }
}
