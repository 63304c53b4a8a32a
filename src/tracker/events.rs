//! Event and snapshot records handed to external sinks.

use serde::{Deserialize, Serialize};

use crate::alloc::{AllocStats, TAG_LEN, encode_tag};

/// Type of allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Allocate,
    Deallocate,
}

/// A recorded allocation or deallocation with the owning shard's counters
/// as they stood right after the operation.
///
/// Event IDs increase monotonically per worker; there is no global order
/// across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub event_id: u64,
    /// Block offset from the arena base.
    pub offset: usize,
    /// Requested payload size (0 for deallocations).
    pub size: usize,
    /// Requested alignment (0 for deallocations).
    pub alignment: usize,
    /// Total span of the block.
    pub actual_size: usize,
    #[serde(with = "tag_str")]
    pub tag: [u8; TAG_LEN],
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub total_allocated: usize,
    pub total_free: usize,
    pub fragmentation_pct: u8,
    pub free_block_count: usize,
}

impl AllocationEvent {
    pub(crate) fn allocate(
        event_id: u64,
        offset: usize,
        size: usize,
        alignment: usize,
        actual_size: usize,
        tag: &str,
        stats: AllocStats,
    ) -> Self {
        AllocationEvent {
            kind: EventKind::Allocate,
            event_id,
            offset,
            size,
            alignment,
            actual_size,
            tag: encode_tag(tag),
            timestamp_us: now_us(),
            total_allocated: stats.total_allocated,
            total_free: stats.total_free,
            fragmentation_pct: stats.fragmentation_pct,
            free_block_count: stats.free_block_count,
        }
    }

    pub(crate) fn deallocate(event_id: u64, offset: usize, span: usize, stats: AllocStats) -> Self {
        AllocationEvent {
            kind: EventKind::Deallocate,
            event_id,
            offset,
            size: 0,
            alignment: 0,
            actual_size: span,
            tag: [0; TAG_LEN],
            timestamp_us: now_us(),
            total_allocated: stats.total_allocated,
            total_free: stats.total_free,
            fragmentation_pct: stats.fragmentation_pct,
            free_block_count: stats.free_block_count,
        }
    }
}

/// One live block in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Offset from the arena base.
    pub offset: usize,
    /// Approximate payload size (span minus fixed overhead; padding is not
    /// recoverable from the header).
    pub size: usize,
    /// Alignment is not recorded in the header; snapshots report 0.
    pub alignment: usize,
    /// Total span of the block.
    pub actual_size: usize,
    #[serde(with = "tag_str")]
    pub tag: [u8; TAG_LEN],
}

/// Consistent-per-shard view of every live block plus arena-wide totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaSnapshot {
    pub capacity: usize,
    pub total_allocated: usize,
    pub total_free: usize,
    pub fragmentation_pct: u8,
    pub free_block_count: usize,
    pub blocks: Vec<BlockMetadata>,
}

fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Serde adapter presenting the fixed tag buffer as a sanitized string.
pub mod tag_str {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::alloc::{TAG_LEN, decode_tag, encode_tag};

    pub fn serialize<S: Serializer>(tag: &[u8; TAG_LEN], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&decode_tag(tag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; TAG_LEN], D::Error> {
        let s = String::deserialize(de)?;
        Ok(encode_tag(&s))
    }
}
