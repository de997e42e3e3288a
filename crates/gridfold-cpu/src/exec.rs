//! Kernel execution on host threads with GPU-model semantics.
//!
//! Every GPU thread becomes one scoped OS thread. Warps exchange registers
//! through lockstep slot buffers guarded by a per-warp barrier; blocks get a
//! barrier, a block-wide OR flag, and word-addressable shared memory. All
//! blocks of a grid run concurrently, which is what makes the last-block
//! completion handshakes meaningful.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Barrier;

use gridfold_core::launch::{KernelCtx, ReduceBinding};
use gridfold_core::scope::ThreadScope;
use gridfold_core::types::{SHARED_MEM_WORDS, WARP_SIZE};

/// Stack size for kernel threads. Kernels are leaf computations; the
/// default 8 MiB per thread would be pure address-space waste at 2k threads.
const KERNEL_THREAD_STACK: usize = 512 * 1024;

struct WarpShared {
    barrier: Barrier,
    slots: [AtomicU32; WARP_SIZE as usize],
}

impl WarpShared {
    fn new(lanes: usize) -> Self {
        Self {
            barrier: Barrier::new(lanes),
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

pub(crate) struct BlockShared {
    threads: u32,
    barrier: Barrier,
    or_flag: AtomicU32,
    shared: Vec<AtomicU32>,
    warps: Vec<WarpShared>,
}

impl BlockShared {
    pub(crate) fn new(threads: u32) -> Self {
        let warp_count = threads.div_ceil(WARP_SIZE);
        let warps = (0..warp_count)
            .map(|w| {
                let lanes = (threads - w * WARP_SIZE).min(WARP_SIZE);
                WarpShared::new(lanes as usize)
            })
            .collect();

        Self {
            threads,
            barrier: Barrier::new(threads as usize),
            or_flag: AtomicU32::new(0),
            shared: (0..SHARED_MEM_WORDS).map(|_| AtomicU32::new(0)).collect(),
            warps,
        }
    }
}

/// One thread's view of its block and grid.
pub struct CpuScope<'g> {
    thread_id: u32,
    block_id: u32,
    grid_blocks: u32,
    block: &'g BlockShared,
}

impl ThreadScope for CpuScope<'_> {
    fn thread_id(&self) -> u32 {
        self.thread_id
    }

    fn block_id(&self) -> u32 {
        self.block_id
    }

    fn block_threads(&self) -> u32 {
        self.block.threads
    }

    fn grid_blocks(&self) -> u32 {
        self.grid_blocks
    }

    fn shuffle_word(&self, word: u32, src_lane: u32) -> u32 {
        let warp = &self.block.warps[self.warp_id() as usize];
        warp.slots[self.lane_id() as usize].store(word, Ordering::Relaxed);
        // Publish, then read in lockstep; the trailing wait keeps the next
        // exchange from overwriting slots a sibling lane has yet to read.
        warp.barrier.wait();
        let got = warp.slots[(src_lane % WARP_SIZE) as usize].load(Ordering::Relaxed);
        warp.barrier.wait();
        got
    }

    fn barrier(&self) {
        self.block.barrier.wait();
    }

    fn barrier_or(&self, pred: bool) -> bool {
        if pred {
            self.block.or_flag.fetch_or(1, Ordering::Relaxed);
        }
        self.block.barrier.wait();
        let result = self.block.or_flag.load(Ordering::Relaxed) != 0;
        self.block.barrier.wait();
        if self.thread_id == 0 {
            self.block.or_flag.store(0, Ordering::Relaxed);
        }
        // The flag must be clean before any thread can reach the next use.
        self.block.barrier.wait();
        result
    }

    fn shared_write_word(&self, index: usize, word: u32) {
        self.block.shared[index].store(word, Ordering::Relaxed);
    }

    fn shared_read_word(&self, index: usize) -> u32 {
        self.block.shared[index].load(Ordering::Relaxed)
    }

    fn fence_device(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Run one kernel: `grid_blocks` blocks of `block_threads` threads, all
/// concurrent. Per thread: create workers, run the body, drop workers (the
/// drop performs the grid reduction).
pub(crate) fn execute_grid<B, F>(grid_blocks: u32, block_threads: u32, bindings: &B, body: &F)
where
    B: ReduceBinding,
    F: for<'a> Fn(&KernelCtx<'a>, &mut B::Workers<'a>) + Sync,
{
    let blocks: Vec<BlockShared> = (0..grid_blocks)
        .map(|_| BlockShared::new(block_threads))
        .collect();

    std::thread::scope(|s| {
        for (block_id, block) in blocks.iter().enumerate() {
            for thread_id in 0..block_threads {
                let builder = std::thread::Builder::new()
                    .name(format!("gf-b{block_id}t{thread_id}"))
                    .stack_size(KERNEL_THREAD_STACK);
                builder
                    .spawn_scoped(s, move || {
                        let scope = CpuScope {
                            thread_id,
                            block_id: block_id as u32,
                            grid_blocks,
                            block,
                        };
                        let ctx = KernelCtx::new(&scope);
                        let mut workers = bindings.workers(&scope);
                        body(&ctx, &mut workers);
                    })
                    .expect("failed to spawn kernel thread");
            }
        }
    });
}
