//! Per-handle tally of pinned result slots, grouped by stream.
//!
//! Every launch of a handle deposits its grid aggregate in one pinned slot;
//! the tally remembers which streams those slots belong to so the host read
//! can synchronize each stream exactly once before folding.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::launch::StreamHandle;
use crate::memory::{PinnedPool, PinnedSlot};

struct SlotRecord {
    slot: Arc<PinnedSlot>,
    pool: Arc<PinnedPool>,
}

struct StreamEntry {
    stream: Arc<dyn StreamHandle>,
    slots: Vec<SlotRecord>,
}

/// Stream-keyed collection of pinned result slots.
///
/// Slot allocation is serialized by a mutex so host threads may launch
/// kernels against the same handle concurrently.
#[derive(Default)]
pub struct Tally {
    entries: Mutex<Vec<StreamEntry>>,
}

impl Tally {
    /// Create an empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh slot for a launch on `stream`.
    pub fn new_slot(
        &self,
        stream: Arc<dyn StreamHandle>,
        pool: &Arc<PinnedPool>,
    ) -> Result<Arc<PinnedSlot>> {
        let mut entries = self.entries.lock();
        let slot = pool.alloc_slot()?;

        let record = SlotRecord {
            slot: Arc::clone(&slot),
            pool: Arc::clone(pool),
        };

        match entries.iter_mut().find(|e| e.stream.id() == stream.id()) {
            Some(entry) => entry.slots.push(record),
            None => entries.push(StreamEntry {
                stream,
                slots: vec![record],
            }),
        }

        Ok(slot)
    }

    /// True when no launch has recorded a slot since the last clear.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of recorded slots across all streams.
    pub fn slot_count(&self) -> usize {
        self.entries.lock().iter().map(|e| e.slots.len()).sum()
    }

    /// Number of distinct streams with recorded slots.
    pub fn stream_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of the streams holding slots, for synchronization.
    pub fn streams(&self) -> Vec<Arc<dyn StreamHandle>> {
        self.entries
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.stream))
            .collect()
    }

    /// Snapshot of every recorded slot, for folding.
    pub fn slots(&self) -> Vec<Arc<PinnedSlot>> {
        self.entries
            .lock()
            .iter()
            .flat_map(|e| e.slots.iter().map(|r| Arc::clone(&r.slot)))
            .collect()
    }

    /// Release every slot back to its pool and drop all stream entries.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.drain(..) {
            for record in entry.slots {
                record.pool.release(record.slot);
            }
        }
    }
}

impl Drop for Tally {
    fn drop(&mut self) {
        self.clear();
    }
}
