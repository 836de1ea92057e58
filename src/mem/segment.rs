//! Backing-region shim.
//!
//! The allocators never call the operating system themselves; they manage a byte region handed
//! to them once at initialization. [`Segment`] is the owner of that region: it maps an
//! anonymous private range with `mmap` and releases it on drop.

use core::ptr;

use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use crate::err::SegmentError;
use crate::mem::HeapAddr;

/// An owned, page-backed byte region `[start, start + len)`.
///
/// The region is mapped readable and writable, 8-byte aligned at both ends (page alignment
/// guarantees far more), and stays fixed for the lifetime of the value. Allocators borrow the
/// bounds through [`start`](Self::start) and [`len`](Self::len); the `Segment` must outlive
/// every allocator built on top of it.
#[derive(Debug)]
pub struct Segment {
    base: *mut c_void,
    len: usize,
}

impl Segment {
    /// Maps an anonymous private region of at least `bytes` bytes.
    ///
    /// The request is rounded up to the system page size.
    pub fn map(bytes: usize) -> Result<Self, SegmentError> {
        if bytes == 0 {
            return Err(SegmentError::EmptySegment);
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = bytes.div_ceil(page) * page;

        let base = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == MAP_FAILED {
            return Err(SegmentError::MapFailed);
        }

        Ok(Self { base, len })
    }

    /// Lowest address of the region.
    pub fn start(&self) -> HeapAddr {
        HeapAddr::from_ptr(self.base)
    }

    /// Length of the region, in bytes. Always a multiple of the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base, self.len);
        }
    }
}
