//! Contiguous anonymous mapping acquired from the OS.

use std::ptr::{self, NonNull};
use std::sync::LazyLock;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, mmap, munmap};

use crate::common::checked_align_up;
use crate::os::{RegionError, Result};

static PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// Owns one contiguous read/write region of virtual memory obtained via
/// `mmap`. Unmapped on drop. The base address and capacity never change
/// after creation.
pub struct Region {
    base: NonNull<u8>,
    capacity: usize,
}

// The region itself is immutable after creation; interior mutation of the
// mapped bytes is governed by the allocator layered on top.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map a private anonymous region of at least `capacity` bytes.
    /// The actual capacity is rounded up to a page boundary.
    pub fn create(capacity: usize) -> Result<Region> {
        if capacity == 0 {
            return Err(RegionError::InvalidCapacity);
        }

        let page = Self::page_size();
        let capacity = checked_align_up(capacity, page).ok_or(RegionError::InvalidCapacity)?;

        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                capacity,
                PROT_READ | PROT_WRITE,
                MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return Err(RegionError::ResourceUnavailable(
                std::io::Error::last_os_error(),
            ));
        }

        log::debug!(
            "Region::create: mapped {} at {:p}",
            crate::common::format_bytes(capacity),
            ptr
        );

        // SAFETY: mmap never returns null on success.
        let base = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        Ok(Region { base, capacity })
    }

    /// Base address of the mapped region.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Actual mapped capacity (page-aligned, >= requested).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// System page size used for rounding.
    pub fn page_size() -> usize {
        *PAGE_SIZE
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe exactly the mapping obtained in
        // create() and are never modified afterwards.
        unsafe {
            munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}
