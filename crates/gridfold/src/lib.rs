//! # GridFold
//!
//! GPU-model parallel reductions. A reduction handle is constructed on the
//! host with a seed, folds per-thread contributions inside kernels, and
//! yields the aggregate after the launch's stream has been synchronized:
//!
//! ```
//! use gridfold::prelude::*;
//!
//! # fn main() -> gridfold::Result<()> {
//! let engine = CpuEngine::new();
//! let sum = ReduceSum::new(0i64);
//! let max = ReduceMax::new(f64::NEG_INFINITY);
//!
//! let data: Vec<f64> = (0..1024).map(|i| f64::from(i) * 0.25).collect();
//! engine.launch(&LaunchConfig::new(4, 256), (&sum, &max), move |ctx, (s, m)| {
//!     let i = ctx.global_thread_id();
//!     if i < data.len() {
//!         *s += data[i] as i64;
//!         m.max(data[i]);
//!     }
//! })?;
//!
//! assert_eq!(max.get()?, 1023.0 * 0.25);
//! # Ok(())
//! # }
//! ```
//!
//! Value reducers ([`ReduceSum`], [`ReduceMin`], [`ReduceMax`]) choose
//! between a shared-memory tree grid path and a hardware-atomic grid path
//! via [`GridMode`]; located reducers ([`ReduceMinLoc`], [`ReduceMaxLoc`])
//! always use the tree path and resolve value ties to the lowest index.

pub use gridfold_core::{
    Dim3, GridFoldError, GridMode, KernelCtx, LaunchConfig, LocOp, ReduceMax, ReduceMaxLoc,
    ReduceMin, ReduceMinLoc, ReduceOp, ReduceScalar, ReduceSum, Result, MAX_BLOCK_THREADS,
    MAX_WARPS, NO_LOC, WARP_SIZE,
};

pub use gridfold_cpu::{CpuEngine, CpuStream, EngineConfig};

/// Convenient glob imports.
pub mod prelude {
    pub use gridfold_core::prelude::*;
    pub use gridfold_cpu::{CpuEngine, CpuStream, EngineConfig};
}
