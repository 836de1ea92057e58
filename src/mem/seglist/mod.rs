//! Segregated-fits free index.
//!
//! Fifteen size classes, each a doubly-linked list threaded through the payload bytes of its
//! free blocks. The four smallest classes hold exactly one size each (32, 40, 48, 56); the
//! rest cover a power-of-two range, with a catch-all for 64 KiB and beyond. Lists are LIFO
//! and unsorted: insertion is O(1), and the loosely-sorted class layout keeps best-fit scans
//! short.

use core::fmt;

use log::error;

use crate::mem::block::{BlockHeader, BlockLink};
use crate::mem::index::{FreeIndex, PrintStyle};
use crate::mem::{HeapAddr, ALIGNMENT};

pub(crate) const NUM_CLASSES: usize = 15;

/// Lower bound of each class. A block of size `s` belongs to class `i` when
/// `CLASS_SIZES[i] <= s < CLASS_SIZES[i + 1]` (last class unbounded).
pub(crate) const CLASS_SIZES: [usize; NUM_CLASSES] = [
    32, 40, 48, 56, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// Largest size held by the exact-size classes.
const SMALL_CLASS_MAX: usize = 56;

/// Maps a block size to its class.
///
/// Sizes past the exact classes map through `floor(log2(size)) - 2`, which lands every size in
/// the same class a linear scan of [`CLASS_SIZES`] would pick.
pub(crate) fn find_index(size: usize) -> usize {
    debug_assert!(
        size >= CLASS_SIZES[0] && size % ALIGNMENT == 0,
        "size {size} outside class range"
    );

    if size <= SMALL_CLASS_MAX {
        return (size - CLASS_SIZES[0]) / ALIGNMENT;
    }

    let log2 = usize::BITS as usize - 1 - size.leading_zeros() as usize;

    usize::min(log2 - 2, NUM_CLASSES - 1)
}

/// In-memory view of a free block tracked by the segregated index.
///
/// `prev` and `next` live in the first payload bytes; the footer occupies the last word, so
/// the smallest trackable block is 32 bytes.
#[repr(C)]
struct ListNode {
    header: BlockHeader,
    prev: ListLink,
    next: ListLink,
}

/// Wrapper around the raw pointer to a [`ListNode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ListLink {
    ptr: *mut ListNode,
}

impl ListLink {
    fn from_addr(addr: HeapAddr) -> Self {
        Self {
            ptr: addr.as_mut_ptr(),
        }
    }

    fn from_block(block: BlockLink) -> Self {
        Self::from_addr(block.addr())
    }

    fn addr(self) -> HeapAddr {
        HeapAddr::from_ptr(self.ptr)
    }

    fn block(self) -> BlockLink {
        BlockLink::from_addr(self.addr())
    }

    unsafe fn size(self) -> usize {
        (*self.ptr).header.get_size()
    }

    unsafe fn prev(self) -> ListLink {
        (*self.ptr).prev
    }

    unsafe fn next(self) -> ListLink {
        (*self.ptr).next
    }

    unsafe fn set_prev(self, link: ListLink) {
        (*self.ptr).prev = link;
    }

    unsafe fn set_next(self, link: ListLink) {
        (*self.ptr).next = link;
    }
}

/// The segregated-fits index.
///
/// Class heads point at the shared sentinel when empty. The sentinel sits at the top of the
/// segment: its first word is the boundary header that terminates segment walks, and its link
/// fields are write-allowed, read-undefined, so list surgery needs no null checks.
pub struct SegList {
    heads: [ListLink; NUM_CLASSES],
    sentinel: ListLink,
    count: usize,
}

impl SegList {
    /// Unlinks `node` from its list. Head nodes are recognized by their `prev` pointing at
    /// the sentinel, and evict through the class table instead.
    unsafe fn unlink(&mut self, node: ListLink) {
        let prev = node.prev();
        let next = node.next();

        if prev == self.sentinel {
            self.heads[find_index(node.size())] = next;
        } else {
            prev.set_next(next);
        }

        if next != self.sentinel {
            next.set_prev(prev);
        }

        self.count -= 1;
    }
}

impl FreeIndex for SegList {
    const NAME: &'static str = "seglist";
    const USES_COLOR: bool = false;
    const MIN_BLOCK_SIZE: usize = 32;
    const OVERHEAD: usize = 16;
    const SENTINEL_BYTES: usize = 16;

    unsafe fn attach(sentinel: HeapAddr) -> Self {
        let boundary: *mut BlockHeader = sentinel.as_mut_ptr();
        *boundary = BlockHeader::BOUNDARY;
        *sentinel.as_mut_ptr::<u64>().add(1) = 0;

        let sentinel = ListLink::from_addr(sentinel);

        Self {
            heads: [sentinel; NUM_CLASSES],
            sentinel,
            count: 0,
        }
    }

    unsafe fn insert(&mut self, block: BlockLink) {
        let node = ListLink::from_block(block);
        let class = find_index(block.size());
        let head = self.heads[class];

        node.set_prev(self.sentinel);
        node.set_next(head);

        if head != self.sentinel {
            head.set_prev(node);
        }

        self.heads[class] = node;
        self.count += 1;
    }

    unsafe fn remove_best_fit(&mut self, need: usize) -> Option<BlockLink> {
        for class in find_index(need)..NUM_CLASSES {
            let mut node = self.heads[class];

            while node != self.sentinel {
                if node.size() >= need {
                    self.unlink(node);
                    return Some(node.block());
                }

                node = node.next();
            }
        }

        None
    }

    unsafe fn remove_by_address(&mut self, block: BlockLink) {
        self.unlink(ListLink::from_block(block));
    }

    fn free_total(&self) -> usize {
        self.count
    }

    unsafe fn validate(&self, free_bytes: usize, free_blocks: usize) -> bool {
        let mut bytes = 0;
        let mut blocks = 0;
        let mut ok = true;

        for (class, &head) in self.heads.iter().enumerate() {
            let mut back = self.sentinel;
            let mut node = head;

            while node != self.sentinel {
                if blocks >= free_blocks + 1 {
                    error!(target: "seglist", "class {class} list does not terminate");
                    return false;
                }

                let header = node.block().header();

                if header.is_allocated() {
                    error!(
                        target: "seglist",
                        "allocated block {} in class {class}", node.addr()
                    );
                    ok = false;
                }

                if find_index(header.get_size()) != class {
                    error!(
                        target: "seglist",
                        "block {} of size {} filed under class {class}",
                        node.addr(),
                        header.get_size()
                    );
                    ok = false;
                }

                if node.prev() != back {
                    error!(target: "seglist", "broken back-link at {}", node.addr());
                    ok = false;
                }

                bytes += header.get_size();
                blocks += 1;
                back = node;
                node = node.next();
            }
        }

        if blocks != free_blocks {
            error!(
                target: "seglist",
                "index holds {blocks} nodes, segment walk found {free_blocks}"
            );
            ok = false;
        }

        if bytes != free_bytes {
            error!(
                target: "seglist",
                "index holds {bytes} free bytes, segment walk found {free_bytes}"
            );
            ok = false;
        }

        ok
    }

    unsafe fn write_free_nodes(
        &self,
        style: PrintStyle,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        writeln!(out, "segregated free lists, {} nodes", self.count)?;

        for (class, &head) in self.heads.iter().enumerate() {
            let marker = if class == NUM_CLASSES - 1 { "+" } else { " " };
            write!(out, "  [{:>6}{marker}]", CLASS_SIZES[class])?;

            let mut node = head;
            while node != self.sentinel {
                match style {
                    PrintStyle::Plain => write!(out, " {}", node.size())?,
                    PrintStyle::Verbose => {
                        write!(out, " {}@{}", node.size(), node.addr())?;
                    }
                }
                node = node.next();
            }

            writeln!(out)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::block::init_free;
    use crate::mem::segment::Segment;

    /// Reference class lookup: last class whose lower bound fits.
    fn linear_index(size: usize) -> usize {
        (0..NUM_CLASSES)
            .rev()
            .find(|&class| size >= CLASS_SIZES[class])
            .expect("size below the smallest class")
    }

    #[test]
    fn class_map_matches_linear_search() {
        for size in (CLASS_SIZES[0]..=262144).step_by(ALIGNMENT) {
            assert_eq!(find_index(size), linear_index(size), "size {size}");
        }
    }

    #[test]
    fn exact_classes_cover_small_sizes() {
        assert_eq!(find_index(32), 0);
        assert_eq!(find_index(40), 1);
        assert_eq!(find_index(48), 2);
        assert_eq!(find_index(56), 3);
        assert_eq!(find_index(64), 4);
        assert_eq!(find_index(128), 5);
        assert_eq!(find_index(65536), NUM_CLASSES - 1);
        assert_eq!(find_index(1 << 24), NUM_CLASSES - 1);
    }

    /// Carves free blocks of the given sizes at the bottom of a fresh segment and attaches an
    /// index over them (without inserting).
    fn carve(seg: &Segment, sizes: &[usize]) -> (SegList, Vec<BlockLink>) {
        let sentinel = seg.start() + seg.len() - SegList::SENTINEL_BYTES;
        let index = unsafe { SegList::attach(sentinel) };

        let mut cursor = seg.start();
        let mut blocks = Vec::new();
        for &size in sizes {
            let block = BlockLink::from_addr(cursor);
            unsafe { init_free(block, size) };
            blocks.push(block);
            cursor = cursor + size;
        }

        (index, blocks)
    }

    #[test]
    fn lifo_insertion_order() {
        let seg = Segment::map(4096).unwrap();
        let (mut index, blocks) = carve(&seg, &[64, 64, 64]);

        unsafe {
            for &block in &blocks {
                index.insert(block);
            }
            assert_eq!(index.free_total(), 3);

            // All three fit; the scan returns the most recently inserted first.
            assert_eq!(index.remove_best_fit(40), Some(blocks[2]));
            assert_eq!(index.remove_best_fit(40), Some(blocks[1]));
            assert_eq!(index.remove_best_fit(40), Some(blocks[0]));
            assert_eq!(index.remove_best_fit(40), None);
            assert_eq!(index.free_total(), 0);
        }
    }

    #[test]
    fn best_fit_advances_past_undersized_classes() {
        let seg = Segment::map(4096).unwrap();
        let (mut index, blocks) = carve(&seg, &[64, 72, 256]);

        unsafe {
            for &block in &blocks {
                index.insert(block);
            }

            // Class 4 holds 64 and 72, both too small for 120: the scan moves on and takes
            // the 256 block from class 6.
            assert_eq!(index.remove_best_fit(120), Some(blocks[2]));
            // 72 still fits a 72-byte request even though it shares a class with 64.
            assert_eq!(index.remove_best_fit(72), Some(blocks[1]));
        }
    }

    #[test]
    fn remove_by_address_relinks_the_list() {
        let seg = Segment::map(4096).unwrap();
        let (mut index, blocks) = carve(&seg, &[96, 96, 96]);

        unsafe {
            for &block in &blocks {
                index.insert(block);
            }

            // Middle of the list (insertion was LIFO: list is b2 -> b1 -> b0).
            index.remove_by_address(blocks[1]);
            assert_eq!(index.free_total(), 2);

            // Head of the list.
            index.remove_by_address(blocks[2]);
            assert_eq!(index.free_total(), 1);

            assert_eq!(index.remove_best_fit(96), Some(blocks[0]));
            assert_eq!(index.free_total(), 0);
        }
    }

    #[test]
    fn validate_cross_checks_totals() {
        let seg = Segment::map(4096).unwrap();
        let (mut index, blocks) = carve(&seg, &[64, 128]);

        unsafe {
            index.insert(blocks[0]);
            index.insert(blocks[1]);

            assert!(index.validate(192, 2));
            assert!(!index.validate(192, 3));
            assert!(!index.validate(200, 2));
        }
    }
}
