//! Launch-boundary interfaces between execution engines and reducers.
//!
//! The engine supplies a [`LaunchContext`] when a launch is submitted;
//! reducer handles consume it to allocate device scratch and claim a pinned
//! result slot ([`ReduceArg::bind`]). Inside the kernel the engine turns
//! bindings back into per-thread workers ([`ReduceBinding::workers`]).

use std::sync::Arc;

use crate::error::{GridFoldError, Result};
use crate::memory::DevicePools;
use crate::scope::ThreadScope;
use crate::types::{Dim3, MAX_BLOCK_THREADS};

/// Handle to an ordered queue of kernel work.
pub trait StreamHandle: Send + Sync {
    /// Engine-unique stream identifier.
    fn id(&self) -> u64;

    /// Block the host until all work submitted to this stream so far has
    /// completed.
    fn synchronize(&self) -> Result<()>;
}

/// Grid and block extents of a launch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Blocks per grid.
    pub grid_dim: Dim3,
    /// Threads per block.
    pub block_dim: Dim3,
}

impl LaunchConfig {
    /// 1-D convenience constructor.
    pub fn new(grid_blocks: u32, block_threads: u32) -> Self {
        Self {
            grid_dim: Dim3::new_1d(grid_blocks),
            block_dim: Dim3::new_1d(block_threads),
        }
    }

    /// Total block count.
    pub fn grid_blocks(&self) -> u32 {
        self.grid_dim.linear()
    }

    /// Threads per block.
    pub fn block_threads(&self) -> u32 {
        self.block_dim.linear()
    }

    /// True when the launch covers no threads at all.
    pub fn is_empty(&self) -> bool {
        self.grid_blocks() == 0 || self.block_threads() == 0
    }

    /// Reject configurations the execution model cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.block_threads() > MAX_BLOCK_THREADS {
            return Err(GridFoldError::InvalidConfig(format!(
                "block of {} threads exceeds the maximum of {}",
                self.block_threads(),
                MAX_BLOCK_THREADS
            )));
        }
        Ok(())
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(1, 256)
    }
}

/// Everything a reducer needs to know about the pending launch.
pub struct LaunchContext {
    stream: Arc<dyn StreamHandle>,
    grid_dim: Dim3,
    block_dim: Dim3,
    pools: DevicePools,
    active: bool,
}

impl LaunchContext {
    /// Assemble a context for a pending launch. `active` is false when the
    /// launch covers no threads and reducers must not allocate.
    pub fn new(
        stream: Arc<dyn StreamHandle>,
        grid_dim: Dim3,
        block_dim: Dim3,
        pools: DevicePools,
        active: bool,
    ) -> Self {
        Self {
            stream,
            grid_dim,
            block_dim,
            pools,
            active,
        }
    }

    /// The stream the pending kernel will run on.
    pub fn current_stream(&self) -> &Arc<dyn StreamHandle> {
        &self.stream
    }

    /// Grid extents of the pending launch.
    pub fn current_grid_dim(&self) -> Dim3 {
        self.grid_dim
    }

    /// Block extents of the pending launch.
    pub fn current_block_dim(&self) -> Dim3 {
        self.block_dim
    }

    /// True when a launch is actually pending; false means "do not
    /// allocate, this is a no-op".
    pub fn setup_reducers(&self) -> bool {
        self.active
    }

    /// Memory pools for scratch and result slots.
    pub fn pools(&self) -> &DevicePools {
        &self.pools
    }
}

/// Per-thread kernel context handed to the user body.
pub struct KernelCtx<'a> {
    scope: &'a (dyn ThreadScope + 'a),
}

impl<'a> KernelCtx<'a> {
    /// Wrap a thread scope.
    pub fn new(scope: &'a (dyn ThreadScope + 'a)) -> Self {
        Self { scope }
    }

    /// Linear thread index within the block.
    pub fn thread_id(&self) -> u32 {
        self.scope.thread_id()
    }

    /// Linear block index within the grid.
    pub fn block_id(&self) -> u32 {
        self.scope.block_id()
    }

    /// Threads per block.
    pub fn block_threads(&self) -> u32 {
        self.scope.block_threads()
    }

    /// Blocks in the grid.
    pub fn grid_blocks(&self) -> u32 {
        self.scope.grid_blocks()
    }

    /// Linear thread index across the whole grid.
    pub fn global_thread_id(&self) -> usize {
        self.block_id() as usize * self.block_threads() as usize + self.thread_id() as usize
    }

    /// Total thread count of the grid.
    pub fn grid_threads(&self) -> usize {
        self.grid_blocks() as usize * self.block_threads() as usize
    }

    /// The underlying intrinsics facade.
    pub fn scope(&self) -> &'a (dyn ThreadScope + 'a) {
        self.scope
    }
}

/// A handle (or tuple of handles) that can be bound into a launch.
pub trait ReduceArg {
    /// Launcher-role state produced by binding.
    type Binding: ReduceBinding;

    /// Allocate per-launch device resources and claim a result slot.
    /// Called once on the host at launch submission.
    fn bind(&self, ctx: &LaunchContext) -> Result<Self::Binding>;
}

impl<R: ReduceArg> ReduceArg for &R {
    type Binding = R::Binding;

    fn bind(&self, ctx: &LaunchContext) -> Result<Self::Binding> {
        (*self).bind(ctx)
    }
}

/// Launcher-role state: owns device scratch for one launch and produces the
/// per-thread workers.
pub trait ReduceBinding: Send + Sync + 'static {
    /// Worker-role guard(s) for one thread.
    type Workers<'a>
    where
        Self: 'a;

    /// Create this thread's worker. Called by the engine in every thread
    /// before the kernel body; dropping the worker finalizes the thread's
    /// contribution.
    fn workers<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> Self::Workers<'a>;
}

macro_rules! impl_reduce_pack {
    ($($arg:ident . $idx:tt),+) => {
        impl<$($arg: ReduceArg),+> ReduceArg for ($($arg,)+) {
            type Binding = ($($arg::Binding,)+);

            fn bind(&self, ctx: &LaunchContext) -> Result<Self::Binding> {
                Ok(($(self.$idx.bind(ctx)?,)+))
            }
        }

        impl<$($arg: ReduceBinding),+> ReduceBinding for ($($arg,)+) {
            type Workers<'a> = ($($arg::Workers<'a>,)+) where Self: 'a;

            fn workers<'a>(&'a self, scope: &'a (dyn ThreadScope + 'a)) -> Self::Workers<'a> {
                ($(self.$idx.workers(scope),)+)
            }
        }
    };
}

impl_reduce_pack!(A.0);
impl_reduce_pack!(A.0, B.1);
impl_reduce_pack!(A.0, B.1, C.2);
impl_reduce_pack!(A.0, B.1, C.2, D.3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_defaults() {
        let cfg = LaunchConfig::default();
        assert_eq!(cfg.grid_blocks(), 1);
        assert_eq!(cfg.block_threads(), 256);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_launch_config_limits() {
        assert!(LaunchConfig::new(4, 1024).validate().is_ok());
        assert!(LaunchConfig::new(4, 1025).validate().is_err());
        assert!(LaunchConfig::new(0, 128).is_empty());
        assert!(LaunchConfig::new(4, 0).is_empty());
    }
}
