//! Red-black tree free index.
//!
//! The tree is keyed on block size. Equal sizes never create a second tree node: later
//! arrivals are pushed onto a doubly-linked duplicate list hanging off the node that owns the
//! size, which keeps rebalancing work off the hot path when a workload recycles one size.
//!
//! Two removal styles share this module's node layer: [`stack::RbStack`] deletes bottom-up
//! with an explicit ancestor stack, [`topdown::RbTopdown`] repairs the tree on the way down
//! and never looks back up. Both drive the same rotation primitive, parameterized by
//! direction so the mirror cases share one body.
//!
//! The sentinel node at the top of the segment stands in for every `nil` leaf and terminates
//! every duplicate list. It is permanently black and its header reads as allocated; its link
//! fields may be written freely but never carry meaning, which is what lets rotation and
//! transplant code skip the null checks.

use core::fmt;
use core::ops::Not;

use log::error;

use crate::mem::block::{BlockHeader, BlockLink, Color};
use crate::mem::index::PrintStyle;
use crate::mem::{HeapAddr, ALIGNMENT};

pub mod stack;
pub mod topdown;

/// Child slot selector. Backs the direction-unified rotation: the symmetric case of every
/// tree transformation is reached through [`Not`] instead of a mirrored copy of the code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Left = 0,
    Right = 1,
}

impl Not for Direction {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

impl Direction {
    /// Which child slot of `parent` holds `child`.
    unsafe fn of(parent: NodeLink, child: NodeLink) -> Self {
        if parent.link(Self::Right) == child {
            Self::Right
        } else {
            Self::Left
        }
    }
}

/// In-memory view of a free block indexed as a tree node.
///
/// `list_start` heads the duplicate list (sentinel-terminated when empty). The footer takes
/// the last word of the block, so the smallest trackable block is 40 bytes.
#[repr(C)]
pub(crate) struct TreeNode {
    pub(crate) header: BlockHeader,
    pub(crate) links: [NodeLink; 2],
    pub(crate) list_start: NodeLink,
}

/// In-memory view of a free block sitting on a duplicate list.
///
/// Same footprint as [`TreeNode`]: `links` become the prev/next chain, and the `parent` slot
/// aliases `list_start`. Only the head of a list carries a live parent value — the tree parent
/// of the owning node, so the owner can be replaced in O(1) when it coalesces away. Every
/// other list member holds the null "none" marker there, which is how list surgery tells head
/// from interior without a search.
#[repr(C)]
struct DupNode {
    header: BlockHeader,
    links: [NodeLink; 2],
    parent: NodeLink,
}

/// Position of the prev pointer in a duplicate's `links`.
const PREV: Direction = Direction::Left;
/// Position of the next pointer in a duplicate's `links`.
const NEXT: Direction = Direction::Right;

/// Wrapper around the raw pointer to a tree or duplicate node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeLink {
    ptr: *mut TreeNode,
}

impl NodeLink {
    /// The "none" marker for duplicate parent slots. Distinct from the sentinel, which is a
    /// real in-segment address.
    pub(crate) const NULL_LINK: Self = Self {
        ptr: core::ptr::null_mut(),
    };

    pub(crate) fn from_raw(ptr: *mut TreeNode) -> Self {
        Self { ptr }
    }

    pub(crate) fn from_block(block: BlockLink) -> Self {
        Self {
            ptr: block.addr().as_mut_ptr(),
        }
    }

    pub(crate) fn block(self) -> BlockLink {
        BlockLink::from_addr(self.addr())
    }

    pub(crate) fn addr(self) -> HeapAddr {
        HeapAddr::from_ptr(self.ptr)
    }

    unsafe fn size(self) -> usize {
        (*self.ptr).header.get_size()
    }

    unsafe fn is_red(self) -> bool {
        (*self.ptr).header.color() == Color::Red
    }

    unsafe fn color(self) -> Color {
        (*self.ptr).header.color()
    }

    unsafe fn paint(self, color: Color) {
        (*self.ptr).header.set_color(color);
    }

    unsafe fn link(self, dir: Direction) -> NodeLink {
        (*self.ptr).links[dir as usize]
    }

    unsafe fn set_link(self, dir: Direction, link: NodeLink) {
        (*self.ptr).links[dir as usize] = link;
    }

    unsafe fn list_start(self) -> NodeLink {
        (*self.ptr).list_start
    }

    unsafe fn set_list_start(self, link: NodeLink) {
        (*self.ptr).list_start = link;
    }

    unsafe fn dup_prev(self) -> NodeLink {
        self.link(PREV)
    }

    unsafe fn dup_next(self) -> NodeLink {
        self.link(NEXT)
    }

    unsafe fn set_dup_prev(self, link: NodeLink) {
        self.set_link(PREV, link);
    }

    unsafe fn set_dup_next(self, link: NodeLink) {
        self.set_link(NEXT, link);
    }

    unsafe fn parent_slot(self) -> NodeLink {
        (*(self.ptr as *mut DupNode)).parent
    }

    unsafe fn set_parent_slot(self, link: NodeLink) {
        (*(self.ptr as *mut DupNode)).parent = link;
    }
}

/// How a free block is attached to the index, as recovered from its own fields in O(1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    /// A tree node with an empty duplicate list.
    Unique,
    /// A tree node owning at least one duplicate.
    WithDuplicates,
    /// Head of a duplicate list.
    DupHead,
    /// Interior or tail member of a duplicate list.
    DupInterior,
}

/// Shared state and node-level operations of both removal styles.
pub(crate) struct RbCore {
    pub(crate) root: NodeLink,
    pub(crate) nil: NodeLink,
    pub(crate) count: usize,
}

impl RbCore {
    /// Builds an empty tree whose sentinel lives at `sentinel`.
    pub(crate) unsafe fn attach(sentinel: HeapAddr) -> Self {
        let nil = NodeLink::from_raw(sentinel.as_mut_ptr());

        core::ptr::write(
            nil.ptr,
            TreeNode {
                header: BlockHeader::BOUNDARY,
                links: [nil; 2],
                list_start: nil,
            },
        );

        Self {
            root: nil,
            nil,
            count: 0,
        }
    }

    /// Prepares a free block for tree membership: sentinel children, empty duplicate list,
    /// painted red as every fresh arrival is.
    pub(crate) unsafe fn init_tree_node(&self, node: NodeLink) {
        node.set_link(Direction::Left, self.nil);
        node.set_link(Direction::Right, self.nil);
        node.set_list_start(self.nil);
        node.paint(Color::Red);
    }

    /// Rotates the subtree rooted at `node` in direction `dir`; the child on the opposite
    /// side rises. Returns the new subtree root, which the caller hooks into the old parent
    /// (and whose duplicate back-pointer the caller refreshes, since only the caller knows
    /// that parent).
    unsafe fn rotate(&mut self, node: NodeLink, dir: Direction) -> NodeLink {
        let child = node.link(!dir);
        let moved = child.link(dir);

        node.set_link(!dir, moved);
        child.set_link(dir, node);

        self.refresh_list_parent(moved, node);
        self.refresh_list_parent(node, child);

        child
    }

    /// Points `old`'s slot under `parent` at `new`. A sentinel parent means `old` was the
    /// root.
    unsafe fn hook(&mut self, parent: NodeLink, old: NodeLink, new: NodeLink) {
        if parent == self.nil {
            self.root = new;
        } else {
            parent.set_link(Direction::of(parent, old), new);
        }
    }

    /// Keeps the duplicate-list head of `node` in sync after `node`'s tree parent changed.
    unsafe fn refresh_list_parent(&self, node: NodeLink, parent: NodeLink) {
        if node == self.nil {
            return;
        }

        let head = node.list_start();
        if head != self.nil {
            head.set_parent_slot(parent);
        }
    }

    /// Pushes `add` onto `node`'s duplicate list. `parent` is `node`'s current tree parent
    /// (sentinel when `node` is the root); the new head inherits custody of it.
    unsafe fn push_duplicate(&mut self, node: NodeLink, add: NodeLink, parent: NodeLink) {
        let first = node.list_start();

        add.set_dup_prev(node);
        add.set_dup_next(first);
        add.set_parent_slot(parent);

        if first != self.nil {
            first.set_dup_prev(add);
            first.set_parent_slot(NodeLink::NULL_LINK);
        }

        node.set_list_start(add);
        self.count += 1;
    }

    /// Splices the head of `node`'s duplicate list out and returns it. The next member, if
    /// any, becomes the new head and takes over the parent slot.
    unsafe fn pop_duplicate(&mut self, node: NodeLink) -> NodeLink {
        let head = node.list_start();
        let rest = head.dup_next();

        node.set_list_start(rest);
        if rest != self.nil {
            rest.set_dup_prev(node);
            rest.set_parent_slot(head.parent_slot());
        }

        self.count -= 1;
        head
    }

    /// Unlinks a duplicate that is not the head of its list. Pure list surgery.
    unsafe fn remove_dup_interior(&mut self, node: NodeLink) {
        let prev = node.dup_prev();
        let next = node.dup_next();

        prev.set_dup_next(next);
        if next != self.nil {
            next.set_dup_prev(prev);
        }

        self.count -= 1;
    }

    /// Replaces a tree node that owns duplicates with the head of its list: the head copies
    /// the children and color, the stored tree parent makes the relink O(1), and no
    /// rebalancing is needed since the tree shape is untouched.
    unsafe fn promote_duplicate(&mut self, node: NodeLink) {
        let head = node.list_start();
        let parent = head.parent_slot();
        let rest = head.dup_next();

        head.set_link(Direction::Left, node.link(Direction::Left));
        head.set_link(Direction::Right, node.link(Direction::Right));
        head.paint(node.color());
        head.set_list_start(rest);

        if rest != self.nil {
            rest.set_dup_prev(head);
            rest.set_parent_slot(parent);
        }

        self.hook(parent, node, head);
        self.refresh_list_parent(head.link(Direction::Left), head);
        self.refresh_list_parent(head.link(Direction::Right), head);

        self.count -= 1;
    }

    /// Recovers how `node` is attached to the index from its own fields.
    ///
    /// The slot shared by `TreeNode::list_start` and `DupNode::parent` disambiguates: null
    /// marks an interior duplicate, the sentinel marks either a unique tree node or the head
    /// of the root's list (told apart through the root itself), and any other address is
    /// either this node's first duplicate (its prev pointer comes back here) or the tree
    /// parent stored by a list head.
    unsafe fn classify(&self, node: NodeLink) -> NodeKind {
        let slot = node.parent_slot();

        if slot == NodeLink::NULL_LINK {
            return NodeKind::DupInterior;
        }

        if slot == self.nil {
            if self.root != self.nil && self.root != node && self.root.list_start() == node {
                return NodeKind::DupHead;
            }
            return NodeKind::Unique;
        }

        if slot.dup_prev() == node {
            NodeKind::WithDuplicates
        } else {
            NodeKind::DupHead
        }
    }

    /// O(1) removal of `node` when it is attached through a duplicate list (either side of
    /// it). Returns false when `node` is a plain tree node and needs a structural delete.
    unsafe fn remove_if_listed(&mut self, node: NodeLink) -> bool {
        match self.classify(node) {
            NodeKind::DupInterior => {
                self.remove_dup_interior(node);
                true
            }
            NodeKind::DupHead => {
                let owner = node.dup_prev();
                debug_assert!(owner.list_start() == node);
                self.pop_duplicate(owner);
                true
            }
            NodeKind::WithDuplicates => {
                self.promote_duplicate(node);
                true
            }
            NodeKind::Unique => false,
        }
    }

    /// Black-node count from `node` down its left spine to the sentinel, counting the
    /// sentinel itself.
    unsafe fn left_spine_black_height(&self, mut node: NodeLink) -> usize {
        let mut height = 1;

        while node != self.nil {
            if !node.is_red() {
                height += 1;
            }
            node = node.link(Direction::Left);
        }

        height
    }

    /// Second, independent black-height check: every root-to-sentinel path must match the
    /// left-spine count.
    unsafe fn paths_match_black_height(
        &self,
        node: NodeLink,
        acc: usize,
        expect: usize,
        ok: &mut bool,
    ) {
        if node == self.nil {
            if acc + 1 != expect {
                error!(
                    target: "rbtree",
                    "path reaches the sentinel with black count {} instead of {expect}",
                    acc + 1
                );
                *ok = false;
            }
            return;
        }

        let acc = acc + usize::from(!node.is_red());
        self.paths_match_black_height(node.link(Direction::Left), acc, expect, ok);
        self.paths_match_black_height(node.link(Direction::Right), acc, expect, ok);
    }

    /// Recursive structural check. Returns the subtree black-height, or `None` after logging
    /// when the subtree is broken.
    #[allow(clippy::too_many_arguments)]
    unsafe fn check_subtree(
        &self,
        node: NodeLink,
        parent: NodeLink,
        min: usize,
        max: usize,
        bytes: &mut usize,
        blocks: &mut usize,
        limit: usize,
    ) -> Option<usize> {
        if node == self.nil {
            return Some(1);
        }

        let size = node.size();
        let header = node.block().header();

        if header.is_allocated() {
            error!(target: "rbtree", "allocated block {} in the tree", node.addr());
            return None;
        }

        if size <= min || size >= max || size % ALIGNMENT != 0 {
            error!(
                target: "rbtree",
                "node {} of size {size} breaks the search order", node.addr()
            );
            return None;
        }

        if node.is_red() && (node.link(Direction::Left).is_red() || node.link(Direction::Right).is_red())
        {
            error!(target: "rbtree", "red node {} has a red child", node.addr());
            return None;
        }

        *bytes += size;
        *blocks += 1;

        if !self.check_duplicates(node, parent, bytes, blocks, limit) {
            return None;
        }

        if *blocks > limit {
            error!(target: "rbtree", "index walk exceeds the segment free count");
            return None;
        }

        let left = self.check_subtree(
            node.link(Direction::Left),
            node,
            min,
            size,
            bytes,
            blocks,
            limit,
        )?;
        let right = self.check_subtree(
            node.link(Direction::Right),
            node,
            size,
            max,
            bytes,
            blocks,
            limit,
        )?;

        if left != right {
            error!(
                target: "rbtree",
                "black height splits at {}: {left} left, {right} right", node.addr()
            );
            return None;
        }

        Some(left + usize::from(!node.is_red()))
    }

    /// Walks `node`'s duplicate list: equal sizes, intact back-links, parent custody in the
    /// head and nowhere else.
    unsafe fn check_duplicates(
        &self,
        node: NodeLink,
        parent: NodeLink,
        bytes: &mut usize,
        blocks: &mut usize,
        limit: usize,
    ) -> bool {
        let size = node.size();
        let mut back = node;
        let mut dup = node.list_start();
        let mut first = true;

        while dup != self.nil {
            if *blocks > limit {
                error!(target: "rbtree", "duplicate list at {} does not terminate", node.addr());
                return false;
            }

            if dup.size() != size {
                error!(
                    target: "rbtree",
                    "duplicate {} of size {} under a node of size {size}",
                    dup.addr(),
                    dup.size()
                );
                return false;
            }

            if dup.dup_prev() != back {
                error!(target: "rbtree", "broken duplicate back-link at {}", dup.addr());
                return false;
            }

            let slot = dup.parent_slot();
            if first && slot != parent {
                error!(
                    target: "rbtree",
                    "list head {} stores a stale tree parent", dup.addr()
                );
                return false;
            }
            if !first && slot != NodeLink::NULL_LINK {
                error!(
                    target: "rbtree",
                    "interior duplicate {} carries a parent", dup.addr()
                );
                return false;
            }

            *bytes += dup.size();
            *blocks += 1;
            first = false;
            back = dup;
            dup = dup.dup_next();
        }

        true
    }

    /// Full tree validation against the segment walk totals.
    pub(crate) unsafe fn validate(&self, free_bytes: usize, free_blocks: usize) -> bool {
        if self.root == self.nil {
            if self.count != 0 || free_blocks != 0 {
                error!(target: "rbtree", "empty tree but {free_blocks} free blocks on the segment");
                return false;
            }
            return true;
        }

        if self.root.is_red() {
            error!(target: "rbtree", "root is red");
            return false;
        }

        let mut bytes = 0;
        let mut blocks = 0;

        if self
            .check_subtree(
                self.root,
                self.nil,
                0,
                usize::MAX,
                &mut bytes,
                &mut blocks,
                free_blocks,
            )
            .is_none()
        {
            return false;
        }

        let mut ok = true;
        let expect = self.left_spine_black_height(self.root);
        self.paths_match_black_height(self.root, 0, expect, &mut ok);

        if blocks != free_blocks {
            error!(
                target: "rbtree",
                "index holds {blocks} nodes, segment walk found {free_blocks}"
            );
            ok = false;
        }

        if bytes != free_bytes {
            error!(
                target: "rbtree",
                "index holds {bytes} free bytes, segment walk found {free_bytes}"
            );
            ok = false;
        }

        ok
    }

    unsafe fn duplicate_len(&self, node: NodeLink) -> usize {
        let mut len = 0;
        let mut dup = node.list_start();

        while dup != self.nil {
            len += 1;
            dup = dup.dup_next();
        }

        len
    }

    /// Directory-style diagram of the tree, larger subtree first.
    unsafe fn write_node(
        &self,
        node: NodeLink,
        prefix: &str,
        last: bool,
        style: PrintStyle,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        let connector = if last { "└──" } else { "├──" };
        let tag = if node.is_red() { "R" } else { "B" };

        write!(out, "{prefix}{connector}[{tag}]({})", node.size())?;

        let dups = self.duplicate_len(node);
        if dups > 0 {
            write!(out, "(+{dups})")?;
        }

        if style == PrintStyle::Verbose {
            write!(
                out,
                " @{} bh={}",
                node.addr(),
                self.left_spine_black_height(node)
            )?;
        }

        writeln!(out)?;

        let child_prefix = format!("{prefix}{}", if last { "   " } else { "│  " });
        let right = node.link(Direction::Right);
        let left = node.link(Direction::Left);

        if right != self.nil {
            self.write_node(right, &child_prefix, left == self.nil, style, out)?;
        }
        if left != self.nil {
            self.write_node(left, &child_prefix, true, style, out)?;
        }

        Ok(())
    }

    pub(crate) unsafe fn write_free_nodes(
        &self,
        style: PrintStyle,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        writeln!(out, "red-black free tree, {} nodes", self.count)?;

        if self.root == self.nil {
            return writeln!(out, "  (empty)");
        }

        self.write_node(self.root, "", true, style, out)
    }
}
