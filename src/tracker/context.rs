//! Per-worker tracking state and the table that aggregation walks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::alloc::AllocStats;
use crate::tracker::events::AllocationEvent;
use crate::tracker::ring::{RING_CAPACITY, SpscRing};

/// Thread-local tracking state for one worker: the shard it allocates
/// from, its event ring and its sampling counter.
///
/// A context is pinned to the arena generation it was created under; a
/// worker seeing a different generation discards and rebinds.
pub struct WorkerContext {
    generation: u64,
    shard_index: usize,
    sampling: u64,
    next_event_id: AtomicU64,
    ring: SpscRing<AllocationEvent>,
}

impl WorkerContext {
    pub(crate) fn new(generation: u64, shard_index: usize, sampling: u64) -> Self {
        WorkerContext {
            generation,
            shard_index,
            sampling: sampling.max(1),
            next_event_id: AtomicU64::new(0),
            ring: SpscRing::new(RING_CAPACITY),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// Events discarded because the ring was full.
    pub fn dropped_events(&self) -> u64 {
        self.ring.dropped()
    }

    /// Advance the per-worker event counter; under sampling rate K only
    /// every K-th operation is recorded, although the counter always moves.
    #[inline]
    fn next_id(&self) -> Option<u64> {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        (id % self.sampling == 0).then_some(id)
    }

    pub(crate) fn record_alloc(
        &self,
        offset: usize,
        size: usize,
        alignment: usize,
        actual_size: usize,
        tag: &str,
        stats: AllocStats,
    ) {
        if let Some(id) = self.next_id() {
            self.ring.push(AllocationEvent::allocate(
                id,
                offset,
                size,
                alignment,
                actual_size,
                tag,
                stats,
            ));
        }
    }

    pub(crate) fn record_dealloc(&self, offset: usize, span: usize, stats: AllocStats) {
        if let Some(id) = self.next_id() {
            self.ring
                .push(AllocationEvent::deallocate(id, offset, span, stats));
        }
    }

    pub(crate) fn drain_to(&self, out: &mut Vec<AllocationEvent>) -> usize {
        self.ring.drain_to(out)
    }
}

/// Weak registry of live worker contexts.
///
/// Workers hold the strong references through their thread-local slots; a
/// terminated worker drops its context and the next drain pass compacts
/// the dead entry.
pub struct WorkerTable {
    entries: Mutex<Vec<Weak<WorkerContext>>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        WorkerTable {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, ctx: &Arc<WorkerContext>) {
        self.entries.lock().push(Arc::downgrade(ctx));
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Drain every live context's ring into `out`, dropping dead entries
    /// along the way. Consumers are serialized by the table lock, which
    /// keeps each ring single-consumer.
    pub fn drain_all(&self, out: &mut Vec<AllocationEvent>) {
        let mut entries = self.entries.lock();
        entries.retain(|weak| {
            if let Some(ctx) = weak.upgrade() {
                ctx.drain_to(out);
                true
            } else {
                false
            }
        });
    }
}

impl Default for WorkerTable {
    fn default() -> Self {
        Self::new()
    }
}
