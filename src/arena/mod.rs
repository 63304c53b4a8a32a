//! # Instrumented arena façade
//!
//! ## Overview
//! One object wrapping the whole pipeline: mmap region, sharded block
//! allocators, per-worker event tracking and the background aggregator.
//!
//! 1. **Sharding**: the region is split into independently locked
//!    sub-ranges so workers rarely contend
//! 2. **Thread-local binding**: each worker is pinned round-robin to one
//!    shard through a cached context, invalidated by generation
//! 3. **Out-of-band tracking**: every operation lands in the worker's
//!    lock-free ring, drained periodically towards the sink
//!
//! ## Lifecycle
//! `New -> Running -> Stopping -> Stopped`. Allocation is valid only in
//! Running. Drop stops and joins the aggregator before the shards and the
//! region are released, so no live context outlives its shard.

mod adapter;
mod config;
mod walker;


pub use adapter::TrackedAlloc;
pub use config::ArenaConfig;
pub use crate::tracker::ArenaSnapshot;

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crate::alloc::AllocError;
use crate::common::format_bytes;
use crate::os::{Region, RegionError};
use crate::shard::ShardSet;
use crate::tracker::{
    Aggregator, AllocationEvent, CommandHandler, EventSink, TrackerHub, WorkerContext,
};

/// Façade lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    New = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

/// The only process-wide mutable state: hands every arena a distinct
/// generation so thread-local bindings can detect staleness.
static GLOBAL_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This thread's binding to whichever arena it used last.
    static TLS_CONTEXT: RefCell<Option<Arc<WorkerContext>>> = const { RefCell::new(None) };

    /// Error-state companion for the nullable raw API.
    static LAST_ERROR: Cell<Option<AllocError>> = const { Cell::new(None) };
}

pub(crate) struct ArenaShared {
    // Declared before `region`: shard allocators hold pointers into the
    // mapping and must drop first.
    shards: ShardSet,
    region: Region,
    hub: Arc<TrackerHub>,
    generation: u64,
    next_shard: AtomicUsize,
    sampling: u64,
    cache_line_size: usize,
    state: AtomicU8,
}

impl ArenaShared {
    fn lifecycle(&self) -> Lifecycle {
        match self.state.load(Ordering::Acquire) {
            0 => Lifecycle::New,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Round-robin a fresh context onto the next shard and register it.
    fn bind_context(&self) -> Arc<WorkerContext> {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.shard_count();
        let ctx = Arc::new(WorkerContext::new(self.generation, idx, self.sampling));
        self.hub.table().register(&ctx);
        ctx
    }

    /// Run `f` with this thread's context, creating or rebinding it first.
    /// The shard pairing is stable for the context's lifetime.
    fn with_context<R>(&self, f: impl FnOnce(&WorkerContext) -> R) -> R {
        TLS_CONTEXT.with(|slot| {
            let mut slot = slot.borrow_mut();
            let ctx = match &mut *slot {
                Some(ctx) if ctx.generation() == self.generation => ctx,
                stale => stale.insert(self.bind_context()),
            };
            f(ctx)
        })
    }

    pub(crate) fn alloc_raw(&self, size: usize, alignment: usize, tag: &str) -> Option<NonNull<u8>> {
        if self.lifecycle() != Lifecycle::Running {
            return None;
        }
        self.with_context(|ctx| {
            let shard = self.shards.shard(ctx.shard_index());
            let (result, stats) = {
                let mut alloc = shard.allocator().lock();
                let result = alloc.allocate(size, alignment, tag);
                (result, alloc.stats())
            };
            match result {
                Ok(block) => {
                    LAST_ERROR.set(None);
                    // Ring push happens outside the shard lock.
                    ctx.record_alloc(
                        shard.base_offset() + block.offset,
                        size,
                        alignment,
                        block.actual_size,
                        tag,
                        stats,
                    );
                    Some(block.user)
                }
                Err(e) => {
                    LAST_ERROR.set(Some(e));
                    None
                }
            }
        })
    }

    pub(crate) fn dealloc_raw(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return true;
        }
        if self.lifecycle() != Lifecycle::Running {
            return false;
        }

        let base = self.region.base().as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.region.capacity() {
            log::warn!("dealloc_raw({ptr:p}): pointer outside the arena, ignored");
            LAST_ERROR.set(Some(AllocError::BadPointer));
            return false;
        }

        let shard = self
            .shards
            .shard(self.shards.shard_index_for_offset(addr - base));
        let (result, stats) = {
            let mut alloc = shard.allocator().lock();
            let result = alloc.deallocate(ptr);
            (result, alloc.stats())
        };
        match result {
            Ok(freed) => {
                LAST_ERROR.set(None);
                self.with_context(|ctx| {
                    ctx.record_dealloc(shard.base_offset() + freed.offset, freed.size, stats);
                });
                true
            }
            Err(e) => {
                log::warn!("dealloc_raw({ptr:p}): {e}, block left untouched");
                LAST_ERROR.set(Some(e));
                false
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ArenaSnapshot {
        let mut blocks = Vec::new();
        let mut total_allocated = 0;
        let mut total_free = 0;
        let mut free_block_count = 0;
        let mut largest = 0;

        for shard in self.shards.iter() {
            let alloc = shard.allocator().lock();
            let stats = alloc.stats();
            total_allocated += stats.total_allocated;
            total_free += stats.total_free;
            free_block_count += stats.free_block_count;
            largest = largest.max(stats.largest_free_block);
            walker::walk_shard(&alloc, shard.base_offset(), &mut blocks);
        }
        blocks.sort_unstable_by_key(|b| b.offset);

        let fragmentation_pct = if total_free == 0 {
            0
        } else {
            (100 - largest * 100 / total_free) as u8
        };
        ArenaSnapshot {
            capacity: self.region.capacity(),
            total_allocated,
            total_free,
            fragmentation_pct,
            free_block_count,
            blocks,
        }
    }
}

/// Single-entry-point façade for instrumented allocation.
///
/// Safe to share across threads by reference; every public operation takes
/// `&self`.
pub struct MemArena {
    shared: Arc<ArenaShared>,
    aggregator: Aggregator,
}

impl MemArena {
    /// Map the region, build the shards and start the aggregator.
    pub fn create(config: ArenaConfig) -> Result<MemArena, RegionError> {
        let ArenaConfig {
            capacity,
            shard_count,
            sampling,
            cache_line_size,
            sink,
        } = config;

        let region = Region::create(capacity)?;
        let shards = ShardSet::new(&region, shard_count);
        let hub = Arc::new(TrackerHub::new(sink));

        let shared = Arc::new(ArenaShared {
            shards,
            region,
            hub: Arc::clone(&hub),
            generation: GLOBAL_GENERATION.fetch_add(1, Ordering::Relaxed),
            next_shard: AtomicUsize::new(0),
            sampling: sampling.max(1),
            cache_line_size: if cache_line_size == 0 {
                detect_cache_line_size()
            } else {
                cache_line_size
            },
            state: AtomicU8::new(Lifecycle::New as u8),
        });

        let aggregator =
            Aggregator::start(Arc::clone(&hub)).map_err(RegionError::ResourceUnavailable)?;
        shared.set_lifecycle(Lifecycle::Running);

        log::debug!(
            "MemArena::create: {} across {} shards, sampling {}",
            format_bytes(shared.region.capacity()),
            shared.shards.shard_count(),
            shared.sampling,
        );
        Ok(MemArena { shared, aggregator })
    }

    /// Allocate raw bytes. Returns None on failure; see [`last_error`].
    ///
    /// [`last_error`]: Self::last_error
    pub fn alloc_raw(&self, size: usize, alignment: usize, tag: &str) -> Option<NonNull<u8>> {
        self.shared.alloc_raw(size, alignment, tag)
    }

    /// Release a pointer from [`alloc_raw`](Self::alloc_raw). Null is a
    /// no-op. A pointer the arena does not own is refused, reported
    /// through [`last_error`](Self::last_error) and left untouched.
    pub fn dealloc_raw(&self, ptr: *mut u8) -> bool {
        self.shared.dealloc_raw(ptr)
    }

    /// Move `value` into the arena under `tag`. On failure the value is
    /// dropped and None is returned.
    pub fn alloc_value<T>(&self, tag: &str, value: T) -> Option<NonNull<T>> {
        let raw = self
            .shared
            .alloc_raw(size_of::<T>(), align_of::<T>(), tag)?;
        let ptr = raw.cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
        }
        Some(ptr)
    }

    /// Drop the value in place and release its block.
    ///
    /// # Safety
    /// `ptr` must come from [`alloc_value`](Self::alloc_value) on this
    /// arena and must not be used afterwards.
    pub unsafe fn dealloc_value<T>(&self, ptr: NonNull<T>) {
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
        }
        self.shared.dealloc_raw(ptr.as_ptr() as *mut u8);
    }

    /// The last allocation or deallocation failure seen by this thread.
    pub fn last_error(&self) -> Option<AllocError> {
        LAST_ERROR.get()
    }

    /// Consistent-per-shard view of all live blocks, sorted by offset.
    pub fn snapshot(&self) -> ArenaSnapshot {
        self.shared.snapshot()
    }

    /// Drain everything currently buffered in the worker rings. Intended
    /// for one-shot dumps; the aggregator keeps running regardless.
    pub fn event_log(&self) -> Vec<AllocationEvent> {
        self.shared.hub.take_events()
    }

    /// Install or replace the outbound sink.
    pub fn set_sink(&self, sink: Option<Arc<dyn EventSink>>) {
        self.shared.hub.set_sink(sink);
    }

    /// Install the handler for opaque external commands.
    pub fn set_command_handler(&self, handler: CommandHandler) {
        self.shared.hub.set_command_handler(handler);
    }

    /// Forward a command string from the outside to the handler.
    pub fn dispatch_command(&self, command: &str) {
        self.shared.hub.dispatch_command(command);
    }

    /// A [`GlobalAlloc`](std::alloc::GlobalAlloc) view of this arena.
    pub fn tracked_alloc(&self) -> TrackedAlloc {
        TrackedAlloc::new(Arc::clone(&self.shared))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn capacity(&self) -> usize {
        self.shared.region.capacity()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.shared.shards.aggregate_bytes_allocated()
    }

    pub fn bytes_free(&self) -> usize {
        self.shared.shards.aggregate_bytes_free()
    }

    pub fn shard_count(&self) -> usize {
        self.shared.shards.shard_count()
    }

    pub fn cache_line_size(&self) -> usize {
        self.shared.cache_line_size
    }
}

impl Drop for MemArena {
    fn drop(&mut self) {
        self.shared.set_lifecycle(Lifecycle::Stopping);
        self.aggregator.stop(&self.shared.hub);
        self.shared.set_lifecycle(Lifecycle::Stopped);
    }
}

fn detect_cache_line_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        let v = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if v > 0 {
            return v as usize;
        }
    }
    64
}
