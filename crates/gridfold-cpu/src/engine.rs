//! The CPU execution engine: pools, streams, and kernel launches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info};

use gridfold_core::error::Result;
use gridfold_core::launch::{KernelCtx, LaunchConfig, LaunchContext, ReduceArg, ReduceBinding, StreamHandle};
use gridfold_core::memory::DevicePools;

use crate::exec::execute_grid;
use crate::stream::CpuStream;

/// Engine construction parameters.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Cap on outstanding device-scratch bytes; `None` is unbounded.
    pub device_pool_capacity: Option<usize>,
    /// Cap on outstanding pinned result slots; `None` is unbounded.
    pub pinned_pool_capacity: Option<usize>,
}

struct StreamEntry {
    stream: CpuStream,
    worker: Option<JoinHandle<()>>,
}

/// CPU realization of the GPU execution model.
///
/// Owns the device/pinned memory pools and a set of ordered streams. Every
/// launch binds its reducer handles on the calling thread (allocating their
/// per-launch scratch immediately), then queues the kernel onto a stream.
pub struct CpuEngine {
    pools: DevicePools,
    default_stream: CpuStream,
    streams: Mutex<Vec<StreamEntry>>,
    next_stream_id: AtomicU64,
}

impl CpuEngine {
    /// Create an engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with explicit pool limits.
    pub fn with_config(config: EngineConfig) -> Self {
        let pools = DevicePools::new(config.device_pool_capacity, config.pinned_pool_capacity);

        let (default_stream, worker) = CpuStream::spawn(0);
        let streams = Mutex::new(vec![StreamEntry {
            stream: default_stream.clone(),
            worker: Some(worker),
        }]);

        info!(
            device_pool_capacity = ?config.device_pool_capacity,
            pinned_pool_capacity = ?config.pinned_pool_capacity,
            "cpu engine initialized"
        );

        Self {
            pools,
            default_stream,
            streams,
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// The stream used by [`launch`](Self::launch).
    pub fn default_stream(&self) -> &CpuStream {
        &self.default_stream
    }

    /// Create an additional stream; work on distinct streams runs
    /// concurrently.
    pub fn create_stream(&self) -> CpuStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (stream, worker) = CpuStream::spawn(id);
        self.streams.lock().push(StreamEntry {
            stream: stream.clone(),
            worker: Some(worker),
        });
        stream
    }

    /// The engine's memory pools.
    pub fn pools(&self) -> &DevicePools {
        &self.pools
    }

    /// Launch a kernel on the default stream.
    ///
    /// `pack` is a reduction handle or a tuple of references to handles;
    /// `body` runs once per GPU thread and receives that thread's workers.
    pub fn launch<P, F>(&self, cfg: &LaunchConfig, pack: P, body: F) -> Result<()>
    where
        P: ReduceArg,
        F: for<'a> Fn(&KernelCtx<'a>, &mut <P::Binding as ReduceBinding>::Workers<'a>)
            + Send
            + Sync
            + 'static,
    {
        let stream = self.default_stream.clone();
        self.launch_on(&stream, cfg, pack, body)
    }

    /// Launch a kernel on a specific stream.
    pub fn launch_on<P, F>(
        &self,
        stream: &CpuStream,
        cfg: &LaunchConfig,
        pack: P,
        body: F,
    ) -> Result<()>
    where
        P: ReduceArg,
        F: for<'a> Fn(&KernelCtx<'a>, &mut <P::Binding as ReduceBinding>::Workers<'a>)
            + Send
            + Sync
            + 'static,
    {
        cfg.validate()?;
        let active = !cfg.is_empty();

        // The host-to-device copy: reducers allocate scratch and claim
        // their result slot before the kernel is queued.
        let ctx = LaunchContext::new(
            Arc::new(stream.clone()),
            cfg.grid_dim,
            cfg.block_dim,
            self.pools.clone(),
            active,
        );
        let bindings = pack.bind(&ctx)?;

        if !active {
            debug!(stream = stream.id(), "empty launch, nothing submitted");
            return Ok(());
        }

        let grid_blocks = cfg.grid_blocks();
        let block_threads = cfg.block_threads();
        debug!(
            stream = stream.id(),
            grid_blocks, block_threads, "kernel submitted"
        );

        stream.submit(Box::new(move || {
            execute_grid(grid_blocks, block_threads, &bindings, &body);
            // Bindings drop here, on the host, after the kernel returns:
            // scratch goes back to the pools.
            drop(bindings);
        }))
    }

    /// Synchronize every stream the engine has created.
    pub fn synchronize_all(&self) -> Result<()> {
        let streams: Vec<CpuStream> = self
            .streams
            .lock()
            .iter()
            .map(|e| e.stream.clone())
            .collect();
        for stream in streams {
            stream.synchronize()?;
        }
        Ok(())
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpuEngine {
    fn drop(&mut self) {
        let mut streams = self.streams.lock();
        for entry in streams.iter() {
            entry.stream.signal_shutdown();
        }
        for entry in streams.iter_mut() {
            if let Some(worker) = entry.worker.take() {
                let _ = worker.join();
            }
        }
        info!("cpu engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfold_core::handle::{GridMode, ReduceMin, ReduceSum};
    use gridfold_core::error::GridFoldError;

    #[test]
    fn test_simple_sum_launch() {
        let engine = CpuEngine::new();
        let sum = ReduceSum::new(0i64);

        engine
            .launch(&LaunchConfig::new(4, 64), &sum, |ctx, acc| {
                *acc += ctx.global_thread_id() as i64;
            })
            .unwrap();

        assert_eq!(sum.get().unwrap(), (0..256).sum::<i64>());
    }

    #[test]
    fn test_empty_launch_is_noop() {
        let engine = CpuEngine::new();
        let sum = ReduceSum::new(7i32);

        engine
            .launch(&LaunchConfig::new(0, 128), &sum, |_, acc| acc.add(1))
            .unwrap();

        assert_eq!(sum.pending_results(), 0);
        assert_eq!(sum.get().unwrap(), 7);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let engine = CpuEngine::new();
        let sum = ReduceSum::new(0i32);
        let err = engine
            .launch(&LaunchConfig::new(1, 2048), &sum, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, GridFoldError::InvalidConfig(_)));
    }

    #[test]
    fn test_pool_exhaustion_fails_launch() {
        let engine = CpuEngine::with_config(EngineConfig {
            device_pool_capacity: Some(8),
            pinned_pool_capacity: None,
        });
        let sum = ReduceSum::new(0i64);
        // Four blocks of tree partials need 32 bytes; the pool caps at 8.
        let err = engine
            .launch(&LaunchConfig::new(4, 32), &sum, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, GridFoldError::AllocationFailed { .. }));
    }

    #[test]
    fn test_launch_on_created_stream() {
        let engine = CpuEngine::new();
        let stream = engine.create_stream();
        let min = ReduceMin::with_mode(i32::MAX, GridMode::Atomic);

        engine
            .launch_on(&stream, &LaunchConfig::new(2, 32), &min, |ctx, acc| {
                acc.min(100 - ctx.global_thread_id() as i32);
            })
            .unwrap();

        assert_eq!(min.get().unwrap(), 100 - 63);
    }

    #[test]
    fn test_multiple_reducers_one_launch() {
        let engine = CpuEngine::new();
        let sum = ReduceSum::new(0i64);
        let min = ReduceMin::new(i64::MAX);

        engine
            .launch(&LaunchConfig::new(2, 64), (&sum, &min), |ctx, (s, m)| {
                let v = ctx.global_thread_id() as i64 - 10;
                *s += v;
                m.min(v);
            })
            .unwrap();

        assert_eq!(sum.get().unwrap(), (0..128).map(|i| i - 10).sum::<i64>());
        assert_eq!(min.get().unwrap(), -10);
    }

    #[test]
    fn test_synchronize_all() {
        let engine = CpuEngine::new();
        let s1 = engine.create_stream();
        let sum = ReduceSum::new(0i32);
        engine
            .launch_on(&s1, &LaunchConfig::new(1, 32), &sum, |_, acc| acc.add(1))
            .unwrap();
        engine.synchronize_all().unwrap();
        assert_eq!(sum.get().unwrap(), 32);
    }
}
