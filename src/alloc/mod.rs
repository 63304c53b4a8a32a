//! # Hybrid free-space allocator over one contiguous byte range
//!
//! ## Overview
//! Single-threaded allocator used per shard. Two free structures share the
//! range:
//!
//! 1. **Small bins**: segregated LIFO lists for spans up to 128 bytes,
//!    giving O(1) recycling of the hottest sizes
//! 2. **Free tree**: an address-ordered red-black tree augmented with
//!    `subtree_max` for O(log N) lowest-address first-fit, with
//!    coalescing against both address neighbours on release
//!
//! Every allocated block carries an intrusive header (magic, span, tag)
//! at its start and a 32-bit back-offset just below the user pointer.
//! Tree blocks never abut other tree blocks; small blocks are exempt from
//! coalescing and may abut anything.

mod errors;
mod free_tree;
mod header;
mod small_bins;

pub use errors::AllocError;
pub use header::{BACK_OFFSET_SIZE, BlockHeader, HEADER_MAGIC, HEADER_SIZE, TAG_LEN};
pub use header::{decode_tag, encode_tag};
pub use small_bins::{QUANTUM, SMALL_CLASSES, SMALL_MAX};

use std::ptr::NonNull;

use crate::common::{align_up, checked_align_up};
use free_tree::{FreeTree, NODE_SIZE};
use small_bins::{SmallBins, class_index};

pub type Result<T> = core::result::Result<T, AllocError>;

/// Smallest possible block span: aligned header and trailer plus one
/// quantum of payload.
pub const MIN_SPAN: usize =
    (HEADER_SIZE + BACK_OFFSET_SIZE).next_multiple_of(QUANTUM) + QUANTUM;

/// A successful allocation.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Pointer handed to the caller, aligned as requested.
    pub user: NonNull<u8>,
    /// Offset of the block start from the allocator base.
    pub offset: usize,
    /// Total span consumed, including header, padding and any absorbed
    /// trailing remainder.
    pub actual_size: usize,
}

/// A successful deallocation.
#[derive(Debug, Clone, Copy)]
pub struct FreedBlock {
    /// Offset of the block start from the allocator base.
    pub offset: usize,
    /// Span returned to the free structures.
    pub size: usize,
}

/// Point-in-time counters, taken under the owning shard's lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    pub total_allocated: usize,
    pub total_free: usize,
    pub free_block_count: usize,
    pub largest_free_block: usize,
    pub fragmentation_pct: u8,
}

/// Allocator over the byte range `[base, base + cap)`.
///
/// Not internally synchronized; the shard wraps it in a mutex.
pub struct BlockAllocator {
    base: NonNull<u8>,
    cap: usize,
    allocated: usize,
    free_blocks: usize,
    bins: SmallBins,
    tree: FreeTree,
}

unsafe impl Send for BlockAllocator {}

impl BlockAllocator {
    /// Build an allocator whose free structure starts as one block spanning
    /// the whole range.
    ///
    /// # Safety
    /// `base` must point to `cap` writable bytes, 16-byte aligned, that
    /// stay mapped for the allocator's lifetime and are touched by nothing
    /// else.
    pub unsafe fn new(base: NonNull<u8>, cap: usize) -> Self {
        debug_assert!(cap % QUANTUM == 0 && cap >= NODE_SIZE);
        let mut tree = FreeTree::new();
        unsafe {
            tree.insert(base.as_ptr(), cap);
        }
        BlockAllocator {
            base,
            cap,
            allocated: 0,
            free_blocks: 1,
            bins: SmallBins::new(),
            tree,
        }
    }

    /// Allocate `size` bytes aligned to `alignment`, stamping `tag` into
    /// the block header. Size 0 is treated as 1.
    pub fn allocate(&mut self, size: usize, alignment: usize, tag: &str) -> Result<Allocation> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }
        let payload = size.max(1);
        // Blocks start 16-aligned; smaller alignments come for free, larger
        // ones pay slack so any block found is placeable.
        let eff_align = alignment.max(QUANTUM);
        let user_off = align_up(HEADER_SIZE + BACK_OFFSET_SIZE, eff_align);
        let slack = eff_align - QUANTUM;
        let total = user_off
            .checked_add(payload)
            .and_then(|t| t.checked_add(slack))
            .and_then(|t| checked_align_up(t, QUANTUM))
            .ok_or(AllocError::OutOfMemory)?;

        // Fast path: exact-quantum request recycled from the class lists.
        if eff_align == QUANTUM
            && let Some(class) = class_index(total)
            && let Some((start, span)) = self.bins.pop_at_least(class)
        {
            self.free_blocks -= 1;
            return Ok(self.commit(start, span, eff_align, payload, tag));
        }

        // Tree path: lowest-address block large enough for the padded total.
        let node = self.tree.find_first_fit(total);
        if node == self.tree.nil() {
            return Err(AllocError::OutOfMemory);
        }
        let span = self.tree.node_size(node);
        let start = node as *mut u8;
        unsafe {
            self.tree.remove(node);
        }
        self.free_blocks -= 1;

        let user = align_up(start as usize + HEADER_SIZE + BACK_OFFSET_SIZE, eff_align);
        let used = align_up(user - start as usize + payload, QUANTUM);
        let remainder = span - used;

        // A remainder big enough for the tree is split off; small change is
        // absorbed into the block so the free structures never accumulate
        // debris the tree cannot coalesce.
        let span = if remainder > SMALL_MAX {
            unsafe {
                self.tree.insert(start.wrapping_add(used), remainder);
            }
            self.free_blocks += 1;
            used
        } else {
            span
        };

        Ok(self.commit(start, span, eff_align, payload, tag))
    }

    /// Return a block to the free structures. `user` must be a pointer
    /// previously returned by [`allocate`](Self::allocate) and not yet
    /// freed; anything else yields `BadPointer` and leaves state intact.
    pub fn deallocate(&mut self, user: *mut u8) -> Result<FreedBlock> {
        let base = self.base.as_ptr() as usize;
        let u = user as usize;
        if u < base + HEADER_SIZE + BACK_OFFSET_SIZE || u >= base + self.cap {
            return Err(AllocError::BadPointer);
        }

        let back =
            unsafe { (user.wrapping_sub(BACK_OFFSET_SIZE) as *const u32).read_unaligned() }
                as usize;
        if back < HEADER_SIZE + BACK_OFFSET_SIZE || back > u - base {
            return Err(AllocError::BadPointer);
        }
        let start = u - back;
        if (start - base) % QUANTUM != 0 {
            return Err(AllocError::BadPointer);
        }

        let header = start as *mut BlockHeader;
        let span = unsafe {
            if (*header).magic != HEADER_MAGIC {
                return Err(AllocError::BadPointer);
            }
            (*header).size
        };
        if span % QUANTUM != 0 || span < MIN_SPAN || back > span || start - base + span > self.cap
        {
            return Err(AllocError::BadPointer);
        }

        // Kill the magic so a double free fails validation instead of
        // corrupting the free structures.
        unsafe {
            (*header).magic = 0;
        }

        self.allocated -= span;
        self.free_blocks += 1;

        if let Some(class) = class_index(span) {
            unsafe {
                self.bins.push(class, start as *mut u8);
            }
            return Ok(FreedBlock {
                offset: start - base,
                size: span,
            });
        }

        unsafe {
            let mut node = self.tree.insert(start as *mut u8, span);

            // Coalesce with the address predecessor if exactly adjacent.
            let pred = self.tree.predecessor(node);
            if pred != self.tree.nil()
                && pred as usize + self.tree.node_size(pred) == node as usize
            {
                let grown = self.tree.node_size(node);
                self.tree.remove(node);
                self.tree.grow(pred, grown);
                self.free_blocks -= 1;
                node = pred;
            }

            // And with the address successor.
            let succ = self.tree.successor(node);
            if succ != self.tree.nil()
                && node as usize + self.tree.node_size(node) == succ as usize
            {
                let grown = self.tree.node_size(succ);
                self.tree.remove(succ);
                self.tree.grow(node, grown);
                self.free_blocks -= 1;
            }
        }

        Ok(FreedBlock {
            offset: start - base,
            size: span,
        })
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocated
    }

    pub fn bytes_free(&self) -> usize {
        self.cap - self.allocated
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Largest contiguous free span across both free structures.
    pub fn largest_free_block(&self) -> usize {
        self.tree.max_size().max(self.bins.largest())
    }

    /// Counter bundle for event records and snapshots.
    pub fn stats(&self) -> AllocStats {
        let total_free = self.bytes_free();
        let largest = self.largest_free_block();
        let fragmentation_pct = if total_free == 0 {
            0
        } else {
            (100 - largest * 100 / total_free) as u8
        };
        AllocStats {
            total_allocated: self.allocated,
            total_free,
            free_block_count: self.free_blocks,
            largest_free_block: largest,
            fragmentation_pct,
        }
    }

    /// Stamp the header and back-offset into a block taken off a free
    /// structure, zero the payload region and account for it.
    fn commit(
        &mut self,
        start: *mut u8,
        span: usize,
        eff_align: usize,
        payload: usize,
        tag: &str,
    ) -> Allocation {
        let user = align_up(start as usize + HEADER_SIZE + BACK_OFFSET_SIZE, eff_align);
        debug_assert!(user - start as usize + payload <= span);

        unsafe {
            let header = start as *mut BlockHeader;
            header.write(BlockHeader {
                magic: HEADER_MAGIC,
                size: span,
                tag: encode_tag(tag),
            });
            ((user - BACK_OFFSET_SIZE) as *mut u32)
                .write_unaligned((user - start as usize) as u32);
            // Uniform zero-on-alloc, both paths.
            std::ptr::write_bytes(user as *mut u8, 0, span - (user - start as usize));
        }

        self.allocated += span;
        Allocation {
            // SAFETY: user points inside the block, never null.
            user: unsafe { NonNull::new_unchecked(user as *mut u8) },
            offset: start as usize - self.base.as_ptr() as usize,
            actual_size: span,
        }
    }
}

#[cfg(test)]
impl BlockAllocator {
    /// Assert every structural invariant: byte conservation, free block
    /// count, non-overlap, tree/tree non-adjacency and red-black validity.
    pub(crate) fn assert_consistent(&self) {
        self.tree.assert_valid();

        let base = self.base.as_ptr() as usize;
        let tree_nodes = self.tree.collect();
        let small_nodes = self.bins.collect();

        let free_bytes: usize = tree_nodes
            .iter()
            .chain(small_nodes.iter())
            .map(|&(_, s)| s)
            .sum();
        assert_eq!(
            self.allocated + free_bytes,
            self.cap,
            "allocated + free must cover the range"
        );
        assert_eq!(
            tree_nodes.len() + small_nodes.len(),
            self.free_blocks,
            "free block count out of sync"
        );

        let mut all: Vec<(usize, usize, bool)> = tree_nodes
            .iter()
            .map(|&(a, s)| (a, s, true))
            .chain(small_nodes.iter().map(|&(a, s)| (a, s, false)))
            .collect();
        all.sort_unstable();
        for &(addr, size, _) in &all {
            assert!(addr >= base && addr + size <= base + self.cap, "node escapes range");
            assert!(addr % QUANTUM == 0 && size % QUANTUM == 0, "unquantized node");
        }
        for w in all.windows(2) {
            let (a, sa, a_tree) = w[0];
            let (b, _, b_tree) = w[1];
            assert!(a + sa <= b, "free nodes overlap");
            if a_tree && b_tree {
                assert!(a + sa < b, "adjacent tree nodes escaped coalescing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Region;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn arena(cap: usize) -> (Region, BlockAllocator) {
        let region = Region::create(cap).unwrap();
        let alloc = unsafe { BlockAllocator::new(region.base(), cap) };
        (region, alloc)
    }

    #[test]
    fn fresh_allocator_is_one_free_block() {
        let (_r, alloc) = arena(64 * 1024);
        assert_eq!(alloc.bytes_allocated(), 0);
        assert_eq!(alloc.bytes_free(), 64 * 1024);
        assert_eq!(alloc.free_block_count(), 1);
        assert_eq!(alloc.largest_free_block(), 64 * 1024);
        alloc.assert_consistent();
    }

    #[test]
    fn zero_size_allocates_at_least_one_byte() {
        let (_r, mut alloc) = arena(64 * 1024);
        let a = alloc.allocate(0, 16, "zero").unwrap();
        assert!(a.actual_size >= MIN_SPAN);
        unsafe { a.user.as_ptr().write(0x55) };
        alloc.deallocate(a.user.as_ptr()).unwrap();
        alloc.assert_consistent();
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let (_r, mut alloc) = arena(64 * 1024);
        assert_eq!(
            alloc.allocate(64, 3, "bad").unwrap_err(),
            AllocError::InvalidAlignment
        );
        assert_eq!(
            alloc.allocate(64, 0, "bad").unwrap_err(),
            AllocError::InvalidAlignment
        );
        assert_eq!(alloc.bytes_allocated(), 0);
    }

    #[test]
    fn oversized_request_fails_without_side_effects() {
        let (_r, mut alloc) = arena(64 * 1024);
        let before = alloc.stats();
        assert_eq!(
            alloc.allocate(64 * 1024 + 1, 16, "big").unwrap_err(),
            AllocError::OutOfMemory
        );
        let after = alloc.stats();
        assert_eq!(before.total_allocated, after.total_allocated);
        assert_eq!(before.free_block_count, after.free_block_count);
        alloc.assert_consistent();
    }

    #[test]
    fn returned_pointers_honor_alignment() {
        let (_r, mut alloc) = arena(256 * 1024);
        for align in [4usize, 16, 64, 256, 4096] {
            let a = alloc.allocate(512, align, "aligned").unwrap();
            assert_eq!(a.user.as_ptr() as usize % align, 0, "align {}", align);
            assert!(a.actual_size >= 512 + HEADER_SIZE);
        }
        alloc.assert_consistent();
    }

    #[test]
    fn payload_is_zeroed_even_on_reuse() {
        let (_r, mut alloc) = arena(64 * 1024);
        let a = alloc.allocate(256, 16, "dirty").unwrap();
        unsafe { std::ptr::write_bytes(a.user.as_ptr(), 0xFF, 256) };
        alloc.deallocate(a.user.as_ptr()).unwrap();

        let b = alloc.allocate(256, 16, "clean").unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(b.user.as_ptr(), 256) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn alloc_dealloc_restores_counters_exactly() {
        let (_r, mut alloc) = arena(64 * 1024);
        let a = alloc.allocate(128, 16, "a").unwrap();
        let b = alloc.allocate(128, 16, "b").unwrap();
        alloc.deallocate(a.user.as_ptr()).unwrap();
        alloc.deallocate(b.user.as_ptr()).unwrap();

        assert_eq!(alloc.bytes_allocated(), 0);
        assert_eq!(alloc.free_block_count(), 1);
        assert_eq!(alloc.largest_free_block(), 64 * 1024);
        alloc.assert_consistent();
    }

    #[test]
    fn full_coalescence_allows_one_giant_block() {
        let (_r, mut alloc) = arena(64 * 1024);

        // Fill with 128-byte payloads until OOM, then free everything.
        let mut ptrs = Vec::new();
        loop {
            match alloc.allocate(128, 16, "fill") {
                Ok(a) => ptrs.push(a.user.as_ptr()),
                Err(AllocError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(ptrs.len() > 300);
        for p in ptrs {
            alloc.deallocate(p).unwrap();
        }
        assert_eq!(alloc.free_block_count(), 1);
        alloc.assert_consistent();

        // The whole arena minus the fixed overhead is allocatable again.
        let user_off = crate::common::align_up(HEADER_SIZE + BACK_OFFSET_SIZE, QUANTUM);
        let giant = alloc.allocate(64 * 1024 - user_off, 16, "giant").unwrap();
        assert_eq!(giant.actual_size, 64 * 1024);
        alloc.deallocate(giant.user.as_ptr()).unwrap();
        alloc.assert_consistent();
    }

    #[test]
    fn freed_small_blocks_recycle_lifo() {
        let (_r, mut alloc) = arena(64 * 1024);

        // 64-byte payloads land exactly on the largest small class.
        let mut ptrs = Vec::new();
        for i in 0..20 {
            ptrs.push(alloc.allocate(64, 16, &format!("b{i}")).unwrap());
        }
        // Free every other block, highest address first, so the LIFO head
        // ends up being the lowest hole.
        for a in ptrs.iter().step_by(2).rev() {
            alloc.deallocate(a.user.as_ptr()).unwrap();
        }
        // 10 holes plus the tail block.
        assert_eq!(alloc.free_block_count(), 11);
        alloc.assert_consistent();

        let reused = alloc.allocate(64, 16, "reuse").unwrap();
        assert_eq!(reused.offset, ptrs[0].offset, "lowest hole must be reused");
        assert_eq!(reused.actual_size, ptrs[0].actual_size);
    }

    #[test]
    fn first_fit_prefers_lowest_address_hole() {
        let (_r, mut alloc) = arena(64 * 1024);

        // Three 1 KiB allocations with spacers, then free them so the tree
        // holds three separated holes.
        let mut holes = Vec::new();
        let mut spacers = Vec::new();
        for _ in 0..3 {
            holes.push(alloc.allocate(1024, 16, "hole").unwrap());
            spacers.push(alloc.allocate(512, 16, "spacer").unwrap());
        }
        for h in &holes {
            alloc.deallocate(h.user.as_ptr()).unwrap();
        }
        alloc.assert_consistent();

        let a = alloc.allocate(1024, 16, "refill").unwrap();
        assert_eq!(a.offset, holes[0].offset);
    }

    #[test]
    fn bad_pointers_are_rejected() {
        let (_r, mut alloc) = arena(64 * 1024);
        let a = alloc.allocate(64, 16, "x").unwrap();

        // Outside the range entirely.
        assert_eq!(
            alloc.deallocate(0x1000 as *mut u8).unwrap_err(),
            AllocError::BadPointer
        );
        // Interior pointer with no valid trailer behind it.
        assert_eq!(
            alloc.deallocate(unsafe { a.user.as_ptr().add(8) }).unwrap_err(),
            AllocError::BadPointer
        );

        // Double free.
        alloc.deallocate(a.user.as_ptr()).unwrap();
        assert_eq!(
            alloc.deallocate(a.user.as_ptr()).unwrap_err(),
            AllocError::BadPointer
        );
        alloc.assert_consistent();
    }

    #[test]
    fn mixed_stress_preserves_invariants() {
        let (_r, mut alloc) = arena(1024 * 1024);
        // Seeded so failures replay.
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut live: Vec<*mut u8> = Vec::new();

        for round in 0..4000 {
            let free_bias = live.len() > 200;
            if !live.is_empty() && (free_bias || rng.gen_range(0..3) == 0) {
                let idx = rng.gen_range(0..live.len());
                let ptr = live.swap_remove(idx);
                alloc.deallocate(ptr).unwrap();
            } else {
                let size = rng.gen_range(1..=2048);
                let align = 1usize << rng.gen_range(0..8);
                match alloc.allocate(size, align, "stress") {
                    Ok(a) => live.push(a.user.as_ptr()),
                    Err(AllocError::OutOfMemory) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            if round % 512 == 0 {
                alloc.assert_consistent();
            }
        }
        for ptr in live {
            alloc.deallocate(ptr).unwrap();
        }
        alloc.assert_consistent();
        assert_eq!(alloc.bytes_allocated(), 0);
    }

    #[test]
    fn fragmented_allocation_stays_cheap() {
        // Doubling the number of holes must not double the work per
        // allocation; with the subtree_max index the lookup is O(log N).
        // Run the same churn at two fragmentation levels and require the
        // per-op cost to grow sub-linearly.
        fn churn(holes: usize) -> std::time::Duration {
            let cap = holes * 512 * 2;
            let region = Region::create(cap).unwrap();
            let mut alloc = unsafe { BlockAllocator::new(region.base(), region.capacity()) };

            let mut keep = Vec::new();
            let mut gaps = Vec::new();
            for i in 0..holes * 2 {
                let a = alloc.allocate(256, 16, "frag").unwrap();
                if i % 2 == 0 { gaps.push(a) } else { keep.push(a) }
            }
            for g in &gaps {
                alloc.deallocate(g.user.as_ptr()).unwrap();
            }

            let start = std::time::Instant::now();
            for _ in 0..2000 {
                let a = alloc.allocate(256, 16, "probe").unwrap();
                alloc.deallocate(a.user.as_ptr()).unwrap();
            }
            start.elapsed()
        }

        let small = churn(1 << 8);
        let large = churn(1 << 12);
        // 16x the holes, well under 8x the time.
        assert!(
            large < small * 8,
            "latency grew superlinearly: {small:?} -> {large:?}"
        );
    }
}
