//! Fixed-capacity single-producer single-consumer ring buffer.
//!
//! The producer is the worker that owns the enclosing context; the
//! consumer is whoever holds the worker-table lock (the aggregator or a
//! one-shot `event_log` drain), which serializes consumers. Overflow
//! policy is drop-on-full so the allocation hot path never blocks on a
//! slow observer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Events buffered per worker before the aggregator drains them.
pub const RING_CAPACITY: usize = 4096;

pub struct SpscRing<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the producer writes. Only the producer stores it.
    head: AtomicUsize,
    /// Next slot the consumer reads. Only the consumer stores it.
    tail: AtomicUsize,
    dropped: AtomicU64,
}

// SAFETY: one producer and one consumer at a time, coordinated through the
// release/acquire pairs on head and tail.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SpscRing {
            buf,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Producer side. Returns false when the ring is full and the item was
    /// discarded. One slot is sacrificed to distinguish full from empty.
    pub fn push(&self, item: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % self.buf.len();
        if next == self.tail.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            (*self.buf[head].get()).write(item);
        }
        self.head.store(next, Ordering::Release);
        true
    }

    /// Consumer side. Appends everything currently buffered, in producer
    /// order, and returns how many items were moved.
    pub fn drain_to(&self, out: &mut Vec<T>) -> usize {
        let mut tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let mut moved = 0;
        while tail != head {
            let item = unsafe { (*self.buf[tail].get()).assume_init() };
            out.push(item);
            tail = (tail + 1) % self.buf.len();
            moved += 1;
        }
        self.tail.store(tail, Ordering::Release);
        moved
    }

    /// Items discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
