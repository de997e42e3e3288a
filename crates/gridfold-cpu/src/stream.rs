//! Ordered work streams backed by worker threads.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use gridfold_core::error::{GridFoldError, Result};
use gridfold_core::launch::StreamHandle;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct StreamState {
    queue: VecDeque<Job>,
    in_flight: bool,
    shutdown: bool,
    failed: bool,
}

struct StreamInner {
    id: u64,
    state: Mutex<StreamState>,
    submitted: Condvar,
    idle: Condvar,
}

/// Cloneable handle to an ordered queue of kernel launches.
///
/// Jobs run on a dedicated worker thread in submission order.
/// [`synchronize`](StreamHandle::synchronize) blocks until everything
/// submitted so far has completed.
#[derive(Clone)]
pub struct CpuStream {
    inner: Arc<StreamInner>,
}

impl CpuStream {
    /// Create a stream and start its worker thread. The caller keeps the
    /// join handle and must signal shutdown before joining.
    pub(crate) fn spawn(id: u64) -> (Self, JoinHandle<()>) {
        let stream = Self {
            inner: Arc::new(StreamInner {
                id,
                state: Mutex::new(StreamState {
                    queue: VecDeque::new(),
                    in_flight: false,
                    shutdown: false,
                    failed: false,
                }),
                submitted: Condvar::new(),
                idle: Condvar::new(),
            }),
        };

        let inner = Arc::clone(&stream.inner);
        let handle = std::thread::Builder::new()
            .name(format!("gf-stream{id}"))
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn stream worker");

        debug!(stream = id, "stream created");
        (stream, handle)
    }

    /// Enqueue a job; it runs after everything already queued.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(GridFoldError::BackendError(format!(
                "stream {} is shut down",
                self.inner.id
            )));
        }
        state.queue.push_back(job);
        self.inner.submitted.notify_one();
        Ok(())
    }

    /// Ask the worker to drain the queue and exit.
    pub(crate) fn signal_shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.submitted.notify_all();
    }
}

fn worker_loop(inner: &StreamInner) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.in_flight = true;
                    break job;
                }
                if state.shutdown {
                    inner.idle.notify_all();
                    return;
                }
                inner.submitted.wait(&mut state);
            }
        };

        trace!(stream = inner.id, "running queued kernel");
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(job));

        let mut state = inner.state.lock();
        state.in_flight = false;
        if outcome.is_err() {
            state.failed = true;
        }
        if state.queue.is_empty() || state.failed {
            inner.idle.notify_all();
        }
    }
}

impl StreamHandle for CpuStream {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if state.failed {
                return Err(GridFoldError::BackendError(format!(
                    "a kernel on stream {} panicked",
                    self.inner.id
                )));
            }
            if state.queue.is_empty() && !state.in_flight {
                return Ok(());
            }
            self.inner.idle.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_order() {
        let (stream, handle) = CpuStream::spawn(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let order = Arc::clone(&order);
            stream.submit(Box::new(move || order.lock().push(i))).unwrap();
        }

        stream.synchronize().unwrap();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());

        stream.signal_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_synchronize_waits_for_in_flight() {
        let (stream, handle) = CpuStream::spawn(2);
        let done = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&done);
        stream
            .submit(Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                flag.store(1, Ordering::SeqCst);
            }))
            .unwrap();

        stream.synchronize().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        stream.signal_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_panicked_job_fails_synchronize() {
        let (stream, handle) = CpuStream::spawn(3);
        stream.submit(Box::new(|| panic!("kernel bug"))).unwrap();

        assert!(stream.synchronize().is_err());

        stream.signal_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (stream, handle) = CpuStream::spawn(4);
        stream.signal_shutdown();
        handle.join().unwrap();
        assert!(stream.submit(Box::new(|| ())).is_err());
    }
}
