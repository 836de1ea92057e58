//! The free-block index seam.
//!
//! Both index families (segregated fits and red-black tree, in both removal styles) sit behind
//! the [`FreeIndex`] trait, so one allocation service drives any of them. The contract is
//! deliberately small: insert a free block, remove the best fit for a size, remove a known
//! block by address. Everything else an index needs (its sentinel, its per-variant constants,
//! validation and printing hooks) hangs off the same trait so the service stays
//! variant-agnostic.

use core::fmt;

use crate::mem::block::BlockLink;
use crate::mem::HeapAddr;

/// Output style of the free-node printers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrintStyle {
    /// Block sizes only.
    Plain,
    /// Sizes plus heap addresses, and subtree black-heights for tree indexes.
    Verbose,
}

/// A best-fit index over the free blocks of one segment.
///
/// # Safety
///
/// The index stores its bookkeeping inside the payload bytes of the free blocks themselves.
/// Every method taking a [`BlockLink`] requires the link to point at a live block header
/// within the segment the index was attached to; `remove_by_address` additionally requires the
/// block to currently sit in the index.
pub trait FreeIndex {
    /// Short name, used as logging target and in printer headings.
    const NAME: &'static str;

    /// Whether the index keeps a node color in header bit 2. When it does not, the bit must
    /// stay zero and the validator treats it as a corruption canary.
    const USES_COLOR: bool;

    /// Smallest block this index can track: header, index pointers, footer.
    const MIN_BLOCK_SIZE: usize;

    /// Per-request overhead added before rounding, per the allocation contract.
    const OVERHEAD: usize;

    /// Bytes reserved at the top of the segment for the index sentinel.
    const SENTINEL_BYTES: usize;

    /// Builds an empty index whose sentinel lives at `sentinel`.
    ///
    /// Writes the sentinel bytes; the caller guarantees `SENTINEL_BYTES` of writable memory
    /// at that address.
    unsafe fn attach(sentinel: HeapAddr) -> Self;

    /// Adds a free block. The block's header must already carry its final size.
    unsafe fn insert(&mut self, block: BlockLink);

    /// Removes and returns a smallest free block of size at least `need`, or `None` when no
    /// block fits. Ties resolve in the structure's natural order.
    unsafe fn remove_best_fit(&mut self, need: usize) -> Option<BlockLink>;

    /// Removes a specific free block, located by address. Used by coalescing, which already
    /// knows the neighbor it is absorbing.
    unsafe fn remove_by_address(&mut self, block: BlockLink);

    /// Number of free blocks currently indexed. O(1).
    fn free_total(&self) -> usize;

    /// Walks the index and cross-checks it against the segment walk totals: `free_bytes` and
    /// `free_blocks` are what the segment walk counted. Structural invariants of the variant
    /// are verified along the way. Failures are logged under [`Self::NAME`].
    unsafe fn validate(&self, free_bytes: usize, free_blocks: usize) -> bool;

    /// Renders the free nodes in the given style.
    unsafe fn write_free_nodes(
        &self,
        style: PrintStyle,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result;
}
