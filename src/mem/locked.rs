//! Synchronization adapters.
//!
//! The allocators themselves are single-threaded by contract; callers that want to share one
//! across threads (or install one as the global Rust allocator) wrap it in [`LockedHeap`],
//! which serializes every entry point behind a spinlock-based Mutex.

use core::alloc::{GlobalAlloc, Layout};

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::mem::alloc::HeapAllocator;
use crate::mem::index::FreeIndex;
use crate::mem::seglist::SegList;
use crate::mem::{HeapAddr, ALIGNMENT};

/// Locked version of a [`HeapAllocator`].
///
/// It uses a spinlock-based Mutex to ensure interior mutability.
pub struct LockedHeap<I: FreeIndex> {
    pub alloc: Mutex<HeapAllocator<I>>,
}

// The raw block pointers inside the allocator never leave the segment, and every access goes
// through the Mutex.
unsafe impl<I: FreeIndex> Send for LockedHeap<I> {}
unsafe impl<I: FreeIndex> Sync for LockedHeap<I> {}

impl<I: FreeIndex> LockedHeap<I> {
    pub fn new(allocator: HeapAllocator<I>) -> Self {
        Self {
            alloc: Mutex::new(allocator),
        }
    }
}

unsafe impl<I: FreeIndex> GlobalAlloc for LockedHeap<I> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            // Only the natural 8-byte alignment is supported.
            return core::ptr::null_mut();
        }

        self.alloc.lock().malloc(layout.size()).as_mut_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.lock().free(HeapAddr::from_ptr(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }

        self.alloc
            .lock()
            .realloc(HeapAddr::from_ptr(ptr), new_size)
            .as_mut_ptr()
    }
}

static GLOBAL_HEAP: OnceCell<LockedHeap<SegList>> = OnceCell::uninit();

/// Initializes the process-wide allocator instance over `[start, start + size)`.
///
/// Should only be run once; later calls keep the first instance.
///
/// # Safety
///
/// Same contract as [`HeapAllocator::init`], plus: the segment must stay valid for the rest
/// of the process.
pub unsafe fn init_global_heap(start: HeapAddr, size: usize) {
    GLOBAL_HEAP.init_once(|| {
        LockedHeap::new(HeapAllocator::init(start, size).expect("invalid global heap segment"))
    });
}

/// Zero-sized handle to the process-wide instance, suitable for `#[global_allocator]`.
///
/// Every call requires [`init_global_heap`] to have run first.
pub struct SyncHeapAllocator;

impl SyncHeapAllocator {
    pub const fn new() -> Self {
        Self {}
    }
}

impl Default for SyncHeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for SyncHeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        GLOBAL_HEAP.get_unchecked().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        GLOBAL_HEAP.get_unchecked().dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        GLOBAL_HEAP.get_unchecked().realloc(ptr, layout, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::rbtree::stack::RbStack;
    use crate::mem::segment::Segment;

    #[test]
    fn global_alloc_round_trip() {
        let seg = Segment::map(1 << 16).unwrap();
        let heap =
            unsafe { HeapAllocator::<RbStack>::init(seg.start(), 1 << 16).unwrap() };
        let locked = LockedHeap::new(heap);

        unsafe {
            let layout = Layout::from_size_align(128, 8).unwrap();
            let p = locked.alloc(layout);
            assert!(!p.is_null());

            p.write_bytes(0x42, 128);
            let q = locked.realloc(p, layout, 256);
            assert!(!q.is_null());
            assert_eq!(q.read(), 0x42);

            locked.dealloc(q, Layout::from_size_align(256, 8).unwrap());
            assert_eq!(locked.alloc.lock().free_total(), 1);
            assert!(locked.alloc.lock().validate_heap());
        }

        // Over-aligned layouts are refused.
        unsafe {
            let layout = Layout::from_size_align(64, 64).unwrap();
            assert!(locked.alloc(layout).is_null());
        }
    }
}
