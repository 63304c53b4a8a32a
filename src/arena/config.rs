use std::fmt;
use std::sync::Arc;

use crate::tracker::EventSink;

/// Construction parameters for [`MemArena`](crate::arena::MemArena).
#[derive(Clone)]
pub struct ArenaConfig {
    /// Requested arena capacity in bytes; rounded up to a page.
    pub capacity: usize,
    /// Number of shards; normalized to a power of two in [1, 256].
    pub shard_count: usize,
    /// Record one event per `sampling` operations. 1 records everything.
    pub sampling: u64,
    /// Informational cache line size; 0 auto-detects (64 on most targets).
    pub cache_line_size: usize,
    /// Destination for event batches. Without one the aggregator still
    /// runs so rings stay fresh for `event_log`.
    pub sink: Option<Arc<dyn EventSink>>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            capacity: 1024 * 1024,
            shard_count: 256,
            sampling: 1,
            cache_line_size: 0,
            sink: None,
        }
    }
}

impl fmt::Debug for ArenaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaConfig")
            .field("capacity", &self.capacity)
            .field("shard_count", &self.shard_count)
            .field("sampling", &self.sampling)
            .field("cache_line_size", &self.cache_line_size)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
