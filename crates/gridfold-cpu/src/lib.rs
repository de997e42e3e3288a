//! # GridFold CPU Backend
//!
//! Executes GridFold kernels on host threads with full GPU-model semantics:
//! warps of 32 lanes exchanging registers in lockstep, blocks with barriers
//! and shared memory, all blocks of a grid running concurrently, and
//! ordered streams backed by worker threads.
//!
//! This is the reference engine: the reduction algorithms in
//! `gridfold-core` run against it unmodified, so the grid completion
//! handshakes (last-block selection, atomic-path initialization) are
//! exercised with real concurrency.
//!
//! ```no_run
//! use gridfold_core::prelude::*;
//! use gridfold_cpu::CpuEngine;
//!
//! # fn main() -> Result<()> {
//! let engine = CpuEngine::new();
//! let sum = ReduceSum::new(0i64);
//!
//! engine.launch(&LaunchConfig::new(4, 256), &sum, |ctx, acc| {
//!     *acc += ctx.global_thread_id() as i64;
//! })?;
//!
//! assert_eq!(sum.get()?, (0..1024).sum::<i64>());
//! # Ok(())
//! # }
//! ```

mod engine;
mod exec;
mod stream;

pub use engine::{CpuEngine, EngineConfig};
pub use exec::CpuScope;
pub use stream::CpuStream;
