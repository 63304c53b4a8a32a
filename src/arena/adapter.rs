//! `GlobalAlloc` view of an arena.
//!
//! Lets arena memory back anything that speaks the standard allocator
//! protocol (FFI shims, custom containers). Failures surface as null, per
//! the `GlobalAlloc` contract. Tags default to `"untagged"`; a one-shot
//! override can be staged per thread with [`TrackedAlloc::set_next_tag`].

use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;
use std::sync::Arc;

use crate::arena::ArenaShared;

thread_local! {
    static NEXT_TAG: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Cloneable allocation handle kept alive independently of the façade
/// value itself (it shares the arena's internals).
#[derive(Clone)]
pub struct TrackedAlloc {
    shared: Arc<ArenaShared>,
}

impl TrackedAlloc {
    pub(crate) fn new(shared: Arc<ArenaShared>) -> Self {
        TrackedAlloc { shared }
    }

    /// Tag applied to this thread's next allocation through this adapter,
    /// then cleared.
    pub fn set_next_tag(&self, tag: &str) {
        NEXT_TAG.with(|t| *t.borrow_mut() = Some(tag.to_string()));
    }
}

unsafe impl GlobalAlloc for TrackedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let staged = NEXT_TAG.with(|t| t.borrow_mut().take());
        let tag = staged.as_deref().unwrap_or("untagged");
        match self.shared.alloc_raw(layout.size(), layout.align(), tag) {
            Some(ptr) => ptr.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.shared.dealloc_raw(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // Payloads are zeroed on every allocation already.
        unsafe { self.alloc(layout) }
    }
}
