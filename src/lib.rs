//! Segment-bound heap allocators.
//!
//! One contiguous byte region, handed over once at initialization, is tiled into boundary-
//! tagged blocks and served through a `malloc` / `realloc` / `free` triad. Adjacent free
//! blocks coalesce eagerly on every release, and the set of free blocks is kept in one of
//! three interchangeable best-fit indexes:
//!
//! - [`SegList`](mem::seglist::SegList) — fifteen size-class free lists;
//! - [`RbStack`](mem::rbtree::stack::RbStack) — red-black tree, bottom-up fixups over an
//!   explicit ancestor stack;
//! - [`RbTopdown`](mem::rbtree::topdown::RbTopdown) — red-black tree repaired on descent.
//!
//! The [`harness`] module replays trace scripts against any of them and scores heap
//! utilization; the `fzalloc` binary drives it from the command line.

pub mod err;
pub mod harness;
pub mod mem;

pub use crate::mem::alloc::HeapAllocator;
pub use crate::mem::index::{FreeIndex, PrintStyle};
pub use crate::mem::locked::{init_global_heap, LockedHeap, SyncHeapAllocator};
pub use crate::mem::segment::Segment;
pub use crate::mem::{HeapAddr, ALIGNMENT, MAX_REQUEST_SIZE};

/// Allocator over the segregated-fits index.
pub type SegListHeap = HeapAllocator<mem::seglist::SegList>;

/// Allocator over the bottom-up red-black index.
pub type RbStackHeap = HeapAllocator<mem::rbtree::stack::RbStack>;

/// Allocator over the top-down red-black index.
pub type RbTopdownHeap = HeapAllocator<mem::rbtree::topdown::RbTopdown>;
