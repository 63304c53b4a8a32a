//! Linear heap walk producing the live-block half of a snapshot.
//!
//! Works because every block, allocated or free, starts with a word that
//! identifies it: allocated blocks lead with the header magic, free
//! blocks lead with their size, and a quantized size can never alias the
//! magic value. The walk is consistent per shard (the caller holds the
//! shard lock) but not atomic across shards.

use crate::alloc::{
    BACK_OFFSET_SIZE, BlockAllocator, BlockHeader, HEADER_MAGIC, HEADER_SIZE, QUANTUM, decode_tag,
    encode_tag,
};
use crate::tracker::BlockMetadata;

/// Scan one shard, appending a [`BlockMetadata`] per live allocation.
/// `shard_base_offset` translates shard-relative offsets to arena offsets.
pub(crate) fn walk_shard(
    alloc: &BlockAllocator,
    shard_base_offset: usize,
    out: &mut Vec<BlockMetadata>,
) {
    let base = alloc.base_ptr().as_ptr();
    let cap = alloc.capacity();
    let mut offset = 0;

    while offset + HEADER_SIZE <= cap {
        // SAFETY: offset stays within [0, cap - HEADER_SIZE]; the shard
        // lock held by the caller freezes the block layout.
        let (magic, span) = unsafe {
            let ptr = base.add(offset);
            let magic = (ptr as *const u32).read();
            if magic == HEADER_MAGIC {
                (magic, (*(ptr as *const BlockHeader)).size)
            } else {
                (magic, (ptr as *const usize).read())
            }
        };

        // A zero or unquantized span means we walked into garbage; stop
        // rather than emit nonsense.
        if span == 0 || span % QUANTUM != 0 || offset + span > cap {
            break;
        }

        if magic == HEADER_MAGIC {
            let tag = unsafe { (*(base.add(offset) as *const BlockHeader)).tag };
            out.push(BlockMetadata {
                offset: shard_base_offset + offset,
                size: span.saturating_sub(HEADER_SIZE + BACK_OFFSET_SIZE),
                alignment: 0,
                actual_size: span,
                tag: encode_tag(&decode_tag(&tag)),
            });
        }
        offset += span;
    }
}
