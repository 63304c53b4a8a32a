//! libmemviz
//! Instrumented memory arena: a user-space allocator carved from one
//! contiguous mmap region, recording every allocation and deallocation
//! out-of-band and handing the event stream to an external sink.

#[cfg(not(target_family = "unix"))]
compile_error!("Unsupported platform - libmemviz requires mmap (unix-family targets)");

pub mod alloc;
pub mod arena;
pub mod common;
pub mod os;
pub mod shard;
pub mod tracker;

pub use alloc::{AllocError, AllocStats, Allocation, BlockAllocator};
pub use arena::{ArenaConfig, ArenaSnapshot, MemArena, TrackedAlloc};
pub use os::{Region, RegionError};
pub use tracker::{AllocationEvent, BlockMetadata, EventKind, EventSink};
