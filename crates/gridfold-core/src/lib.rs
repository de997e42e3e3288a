//! # GridFold Core
//!
//! Backend-agnostic model of GPU-parallel reductions.
//!
//! User code constructs a reduction handle on the host, launches kernels
//! that fold per-thread contributions into it, and reads the aggregate back
//! after the launch's stream has been synchronized:
//!
//! ```ignore
//! use gridfold_core::prelude::*;
//!
//! let sum = ReduceSum::new(0i64);
//! engine.launch(&LaunchConfig::new(4, 256), &sum, move |ctx, acc| {
//!     let i = ctx.global_thread_id();
//!     if i < data.len() {
//!         *acc += data[i];
//!     }
//! })?;
//! assert_eq!(sum.get()?, expected);
//! ```
//!
//! The reduction algorithms (warp shuffles, block tree, grid completion
//! protocols) are written against the [`ThreadScope`](scope::ThreadScope)
//! intrinsics facade; an execution engine supplies the facade along with
//! streams, memory pools, and the launch plumbing. `gridfold-cpu` provides
//! the reference engine.

pub mod block;
pub mod error;
pub mod grid;
pub mod handle;
pub mod launch;
pub mod memory;
pub mod scalar;
pub mod scope;
pub mod tally;
pub mod types;
pub mod warp;

#[cfg(test)]
pub(crate) mod test_scope;

pub use error::{GridFoldError, Result};
pub use handle::{
    GridMode, ReduceMax, ReduceMaxLoc, ReduceMin, ReduceMinLoc, ReduceSum,
};
pub use launch::{KernelCtx, LaunchConfig, LaunchContext, ReduceArg, ReduceBinding, StreamHandle};
pub use scalar::{LocOp, ReduceOp, ReduceScalar, NO_LOC};
pub use types::{Dim3, MAX_BLOCK_THREADS, MAX_WARPS, WARP_SIZE};

/// Convenient glob imports.
pub mod prelude {
    pub use crate::error::{GridFoldError, Result};
    pub use crate::handle::{
        GridMode, MaxLocWorker, MaxWorker, MinLocWorker, MinWorker, ReduceMax, ReduceMaxLoc,
        ReduceMin, ReduceMinLoc, ReduceSum, SumWorker,
    };
    pub use crate::launch::{KernelCtx, LaunchConfig, StreamHandle};
    pub use crate::scalar::{ReduceOp, ReduceScalar, NO_LOC};
    pub use crate::types::Dim3;
}
