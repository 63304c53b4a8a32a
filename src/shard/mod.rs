//! Fixed partition of the arena into independently locked sub-ranges.
//!
//! Lock ordering rule: a thread holds at most one shard lock at a time,
//! and never a shard lock together with the worker-table lock.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::alloc::BlockAllocator;
use crate::os::Region;

/// Hard upper bound on the shard count.
pub const MAX_SHARDS: usize = 256;

/// One sub-range of the region with its own allocator and lock.
pub struct Shard {
    allocator: Mutex<BlockAllocator>,
    base_offset: usize,
}

impl Shard {
    pub fn allocator(&self) -> &Mutex<BlockAllocator> {
        &self.allocator
    }

    /// Offset of this shard's base from the region base.
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }
}

/// All shards of one arena. Shards are created up front, never move and
/// jointly cover the region without overlap.
pub struct ShardSet {
    shards: Box<[Shard]>,
    shard_cap: usize,
}

impl ShardSet {
    /// Partition `region` into `requested` equal shards. The count is
    /// normalized to a power of two, clamped to [1, 256] and reduced until
    /// every shard spans at least one page.
    pub fn new(region: &Region, requested: usize) -> ShardSet {
        let cap = region.capacity();
        let mut count = requested.clamp(1, MAX_SHARDS);
        if !count.is_power_of_two() {
            count = count.next_power_of_two() / 2;
        }
        while count > 1 && cap / count < Region::page_size() {
            count /= 2;
        }

        let shard_cap = cap / count;
        let base = region.base().as_ptr();

        let shards = (0..count)
            .map(|i| {
                let base_offset = i * shard_cap;
                // SAFETY: the sub-ranges partition the mapped region and
                // each allocator is the sole owner of its range.
                let allocator = unsafe {
                    BlockAllocator::new(NonNull::new_unchecked(base.add(base_offset)), shard_cap)
                };
                Shard {
                    allocator: Mutex::new(allocator),
                    base_offset,
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!(
            "ShardSet::new: {} shards of {}",
            count,
            crate::common::format_bytes(shard_cap)
        );

        ShardSet { shards, shard_cap }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_capacity(&self) -> usize {
        self.shard_cap
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    /// Owning shard of a region-relative offset. O(1).
    pub fn shard_index_for_offset(&self, offset: usize) -> usize {
        debug_assert!(offset / self.shard_cap < self.shards.len());
        offset / self.shard_cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }

    pub fn aggregate_bytes_allocated(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.allocator.lock().bytes_allocated())
            .sum()
    }

    pub fn aggregate_bytes_free(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.allocator.lock().bytes_free())
            .sum()
    }
}
