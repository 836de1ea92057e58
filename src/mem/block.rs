//! Block layout and boundary tags.
//!
//! Every block in the segment starts with a one-word [`BlockHeader`] packing the block size
//! with three status bits. Free blocks mirror the header into their last word (the footer), so
//! a right neighbor can reach the block in one hop without any global structure. Allocated
//! blocks reuse the footer bytes as payload.
//!
//! Block sizes always count the full footprint, header through footer: the right neighbor of a
//! block sits exactly `size` bytes above its header.

use crate::mem::{HeapAddr, HEADER_SIZE};

/// Color of a free block's node in a tree index. Packed into the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// Header contained in every block, allocated or not.
///
/// Bit 0 flags the block as allocated, bit 1 records the allocation state of the block
/// immediately to the left, bit 2 carries the node color for tree indexes (and must stay zero
/// under the segregated index — the validator checks it). The remaining bits are the size,
/// always a multiple of 8.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    inner: u64,
}

impl BlockHeader {
    const ALLOCATED: u64 = 0b1;
    const LEFT_ALLOCATED: u64 = 0b10;
    const RED: u64 = 0b100;
    const SIZE_MASK: u64 = !0b111;

    /// Sentinel header: allocated, size zero, black. Terminates segment walks and right-merge
    /// scans without a bounds check.
    pub(crate) const BOUNDARY: Self = Self {
        inner: Self::ALLOCATED,
    };

    /// Fresh header for a free block. The left neighbor of a free block is always allocated
    /// (coalescing is eager), so `LEFT_ALLOCATED` is set. Color starts out black.
    pub(crate) fn new_free(size: usize) -> Self {
        Self {
            inner: size as u64 | Self::LEFT_ALLOCATED,
        }
    }

    /// Fresh header for an allocated block. Allocated blocks are carved out of free blocks
    /// whose left neighbor was allocated, so `LEFT_ALLOCATED` is set here as well.
    pub(crate) fn new_allocated(size: usize) -> Self {
        Self {
            inner: size as u64 | Self::LEFT_ALLOCATED | Self::ALLOCATED,
        }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.inner & Self::ALLOCATED != 0
    }

    pub(crate) fn left_allocated(&self) -> bool {
        self.inner & Self::LEFT_ALLOCATED != 0
    }

    pub(crate) fn set_left_allocated(&mut self, allocated: bool) {
        if allocated {
            self.inner |= Self::LEFT_ALLOCATED;
        } else {
            self.inner &= !Self::LEFT_ALLOCATED;
        }
    }

    pub(crate) fn get_size(&self) -> usize {
        (self.inner & Self::SIZE_MASK) as usize
    }

    pub(crate) fn color(&self) -> Color {
        if self.inner & Self::RED != 0 {
            Color::Red
        } else {
            Color::Black
        }
    }

    pub(crate) fn set_color(&mut self, color: Color) {
        match color {
            Color::Red => self.inner |= Self::RED,
            Color::Black => self.inner &= !Self::RED,
        }
    }

    /// True when bit 2 is set. Under the segregated index that bit has no meaning and must be
    /// zero; the validator uses this to catch stray header writes.
    pub(crate) fn third_bit(&self) -> bool {
        self.inner & Self::RED != 0
    }
}

/// Wrapper around a raw pointer to a block header.
///
/// All accessors are unsafe: the link is only as valid as the address it was built from, and
/// the usual aliasing rules still apply even though they cannot be checked here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLink {
    ptr: *mut BlockHeader,
}

impl BlockLink {
    pub(crate) fn from_addr(addr: HeapAddr) -> Self {
        Self {
            ptr: addr.as_mut_ptr(),
        }
    }

    /// Link to the block owning the payload pointer `payload`.
    pub(crate) fn from_payload(payload: HeapAddr) -> Self {
        Self::from_addr(payload - HEADER_SIZE)
    }

    pub(crate) fn addr(self) -> HeapAddr {
        HeapAddr::from_ptr(self.ptr)
    }

    /// First payload byte of this block.
    pub(crate) fn payload(self) -> HeapAddr {
        self.addr() + HEADER_SIZE
    }

    pub(crate) unsafe fn header(self) -> BlockHeader {
        *self.ptr
    }

    pub(crate) unsafe fn set_header(self, header: BlockHeader) {
        *self.ptr = header;
    }

    pub(crate) unsafe fn size(self) -> usize {
        (*self.ptr).get_size()
    }

    pub(crate) unsafe fn is_allocated(self) -> bool {
        (*self.ptr).is_allocated()
    }

    pub(crate) unsafe fn left_allocated(self) -> bool {
        (*self.ptr).left_allocated()
    }

    pub(crate) unsafe fn set_left_allocated(self, allocated: bool) {
        (*self.ptr).set_left_allocated(allocated);
    }

    pub(crate) unsafe fn color(self) -> Color {
        (*self.ptr).color()
    }

    pub(crate) unsafe fn paint(self, color: Color) {
        (*self.ptr).set_color(color);
    }

    pub(crate) unsafe fn is_red(self) -> bool {
        (*self.ptr).color() == Color::Red
    }

    /// The block starting right after this one.
    pub(crate) unsafe fn right_neighbor(self) -> BlockLink {
        Self::from_addr(self.addr() + self.size())
    }

    /// The block ending right before this one.
    ///
    /// Only valid when the left neighbor is free: the hop goes through the neighbor's footer,
    /// and allocated blocks have no footer.
    pub(crate) unsafe fn left_neighbor(self) -> BlockLink {
        let footer = *(self.addr() - HEADER_SIZE).as_ptr::<BlockHeader>();

        Self::from_addr(self.addr() - footer.get_size())
    }

    /// Mirrors the header into the last word of the block. Free blocks only.
    pub(crate) unsafe fn write_footer(self) {
        let footer: *mut BlockHeader = (self.addr() + self.size() - HEADER_SIZE).as_mut_ptr();
        *footer = *self.ptr;
    }
}

/// Marks a block free: fresh header, footer mirror, and the right neighbor told its left is
/// now free.
pub(crate) unsafe fn init_free(block: BlockLink, size: usize) {
    block.set_header(BlockHeader::new_free(size));
    block.write_footer();
    block.right_neighbor().set_left_allocated(false);
}

/// Marks a block allocated: fresh header (no footer — the bytes belong to the payload), and
/// the right neighbor told its left is allocated.
pub(crate) unsafe fn init_alloc(block: BlockLink, size: usize) {
    block.set_header(BlockHeader::new_allocated(size));
    block.right_neighbor().set_left_allocated(true);
}

/// A header whose size would jump outside the client area, found during a segment walk.
///
/// Carries the prior block address so the corruption can be pinned to the header that wrote
/// over it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BadJump {
    pub at: HeapAddr,
    pub prev: HeapAddr,
}

/// Forward block-by-block walk over the client area `[start, end)`.
///
/// Advances by each block's header size and stops at the boundary sentinel. The only full
/// traversal of the segment; allocation and coalescing use single-neighbor hops instead.
pub(crate) struct SegmentWalker {
    cursor: HeapAddr,
    end: HeapAddr,
    prev: HeapAddr,
}

impl SegmentWalker {
    pub(crate) fn new(start: HeapAddr, end: HeapAddr) -> Self {
        Self {
            cursor: start,
            end,
            prev: HeapAddr::NULL_PTR,
        }
    }

    /// Next block of the walk, `None` once the boundary is reached.
    pub(crate) unsafe fn step(&mut self) -> Option<Result<BlockLink, BadJump>> {
        if self.cursor == self.end {
            return None;
        }

        let block = BlockLink::from_addr(self.cursor);
        let size = block.size();

        if size == 0 || self.cursor + size > self.end {
            return Some(Err(BadJump {
                at: self.cursor,
                prev: self.prev,
            }));
        }

        self.prev = self.cursor;
        self.cursor = self.cursor + size;

        Some(Ok(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Arena([u8; 256]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; 256]))
    }

    #[test]
    fn header_bit_packing() {
        let mut h = BlockHeader::new_free(64);
        assert_eq!(h.get_size(), 64);
        assert!(!h.is_allocated());
        assert!(h.left_allocated());
        assert_eq!(h.color(), Color::Black);

        h.set_color(Color::Red);
        assert_eq!(h.color(), Color::Red);
        assert_eq!(h.get_size(), 64);

        let a = BlockHeader::new_allocated(4096);
        assert!(a.is_allocated());
        assert_eq!(a.get_size(), 4096);
        assert!(!a.third_bit());
    }

    #[test]
    fn boundary_header_is_allocated_and_empty() {
        assert!(BlockHeader::BOUNDARY.is_allocated());
        assert_eq!(BlockHeader::BOUNDARY.get_size(), 0);
        assert_eq!(BlockHeader::BOUNDARY.color(), Color::Black);
    }

    #[test]
    fn neighbor_hops() {
        let mem = arena();
        let base = HeapAddr::from_ptr(mem.0.as_ptr());

        unsafe {
            let first = BlockLink::from_addr(base);
            let second = BlockLink::from_addr(base + 64);

            first.set_header(BlockHeader::new_free(64));
            first.write_footer();
            second.set_header(BlockHeader::new_allocated(32));

            assert_eq!(first.right_neighbor(), second);
            assert_eq!(second.left_neighbor(), first);
            assert_eq!(first.payload(), base + 8);
            assert_eq!(BlockLink::from_payload(base + 8), first);
        }
    }

    #[test]
    fn init_free_updates_right_neighbor() {
        let mem = arena();
        let base = HeapAddr::from_ptr(mem.0.as_ptr());

        unsafe {
            let block = BlockLink::from_addr(base);
            let right = BlockLink::from_addr(base + 64);
            right.set_header(BlockHeader::new_allocated(32));

            init_free(block, 64);
            assert!(!right.left_allocated());
            assert!(right.is_allocated());

            init_alloc(block, 64);
            assert!(right.left_allocated());
        }
    }

    #[test]
    fn walker_visits_every_block() {
        let mem = arena();
        let base = HeapAddr::from_ptr(mem.0.as_ptr());

        unsafe {
            BlockLink::from_addr(base).set_header(BlockHeader::new_allocated(64));
            BlockLink::from_addr(base + 64).set_header(BlockHeader::new_free(96));
            BlockLink::from_addr(base + 160).set_header(BlockHeader::new_allocated(96));

            let mut walker = SegmentWalker::new(base, base + 256);
            let mut sizes = Vec::new();
            while let Some(step) = walker.step() {
                sizes.push(step.expect("clean walk").size());
            }
            assert_eq!(sizes, vec![64, 96, 96]);
        }
    }

    #[test]
    fn walker_reports_bad_jump() {
        let mem = arena();
        let base = HeapAddr::from_ptr(mem.0.as_ptr());

        unsafe {
            BlockLink::from_addr(base).set_header(BlockHeader::new_allocated(64));
            // Size zero at the second block: the walk cannot advance.
            BlockLink::from_addr(base + 64).set_header(BlockHeader::new_free(0));

            let mut walker = SegmentWalker::new(base, base + 256);
            assert!(walker.step().unwrap().is_ok());
            let bad = walker.step().unwrap().unwrap_err();
            assert_eq!(bad.at, base + 64);
            assert_eq!(bad.prev, base);
        }
    }
}
