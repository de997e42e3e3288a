//! Single-thread scope used by unit tests: one block of one thread.

use std::cell::RefCell;
use std::sync::atomic::{fence, Ordering};

use crate::scope::ThreadScope;
use crate::types::SHARED_MEM_WORDS;

/// A one-thread, one-block scope. Shuffles return the caller's own word and
/// barriers are no-ops, which is exactly the semantics of a solitary lane.
pub struct SoloScope {
    shared: RefCell<[u32; SHARED_MEM_WORDS]>,
}

impl Default for SoloScope {
    fn default() -> Self {
        Self {
            shared: RefCell::new([0; SHARED_MEM_WORDS]),
        }
    }
}

impl ThreadScope for SoloScope {
    fn thread_id(&self) -> u32 {
        0
    }

    fn block_id(&self) -> u32 {
        0
    }

    fn block_threads(&self) -> u32 {
        1
    }

    fn grid_blocks(&self) -> u32 {
        1
    }

    fn shuffle_word(&self, word: u32, _src_lane: u32) -> u32 {
        word
    }

    fn barrier(&self) {}

    fn barrier_or(&self, pred: bool) -> bool {
        pred
    }

    fn shared_write_word(&self, index: usize, word: u32) {
        self.shared.borrow_mut()[index] = word;
    }

    fn shared_read_word(&self, index: usize) -> u32 {
        self.shared.borrow()[index]
    }

    fn fence_device(&self) {
        fence(Ordering::SeqCst);
    }
}
