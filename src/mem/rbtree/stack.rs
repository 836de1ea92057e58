//! Bottom-up removal style.
//!
//! The classic insert and delete procedures need to see ancestry, and the tree nodes carry no
//! parent pointers. This style records the descent in an explicit stack and fixes violations
//! ascending it; every rotation also repairs the stack so the fixup's view of ancestry stays
//! correct.

use core::fmt;

use crate::mem::block::{BlockLink, Color};
use crate::mem::index::{FreeIndex, PrintStyle};
use crate::mem::rbtree::{Direction, NodeLink, RbCore};
use crate::mem::HeapAddr;

/// Deepest descent the stack can record. A red-black tree over a segment of minimum-size
/// blocks stays far below this.
const MAX_TREE_HEIGHT: usize = 96;

/// Fixed-capacity ancestor stack. `nodes[0]` is the root.
struct Path {
    nodes: [NodeLink; MAX_TREE_HEIGHT],
    len: usize,
}

impl Path {
    fn new() -> Self {
        Self {
            nodes: [NodeLink::NULL_LINK; MAX_TREE_HEIGHT],
            len: 0,
        }
    }

    fn push(&mut self, node: NodeLink) {
        self.nodes[self.len] = node;
        self.len += 1;
    }

    fn get(&self, index: usize) -> NodeLink {
        self.nodes[index]
    }

    fn set(&mut self, index: usize, node: NodeLink) {
        self.nodes[index] = node;
    }

    fn truncate(&mut self, len: usize) {
        self.len = len;
    }

    /// Ancestor right above depth `index`, sentinel-as-none above the root.
    fn parent_of(&self, index: usize, nil: NodeLink) -> NodeLink {
        if index == 0 {
            nil
        } else {
            self.nodes[index - 1]
        }
    }
}

/// Red-black free index, bottom-up style.
pub struct RbStack {
    core: RbCore,
}

impl RbStack {
    /// Rebuilds the descent path from the root down to `node`, which must be a tree node.
    /// Sizes are unique in the tree, so steering by size lands exactly on it.
    unsafe fn path_to(&self, node: NodeLink, path: &mut Path) {
        let size = node.size();
        let mut cur = self.core.root;

        loop {
            path.push(cur);
            if cur == node {
                return;
            }

            cur = cur.link(if size < cur.size() {
                Direction::Left
            } else {
                Direction::Right
            });
        }
    }

    /// Restores the red-black shape after attaching a red leaf at the top of `path`.
    unsafe fn fix_insert(&mut self, path: &mut Path) {
        let nil = self.core.nil;
        let mut zi = path.len - 1;

        while zi >= 2 {
            let parent = path.get(zi - 1);
            if !parent.is_red() {
                break;
            }

            let grand = path.get(zi - 2);
            let pdir = Direction::of(grand, parent);
            let uncle = grand.link(!pdir);

            if uncle.is_red() {
                parent.paint(Color::Black);
                uncle.paint(Color::Black);
                grand.paint(Color::Red);
                zi -= 2;
                continue;
            }

            let node = path.get(zi);
            if Direction::of(parent, node) != pdir {
                // Inner child: rotate it outward first. The stack swaps the two.
                let sub = self.core.rotate(parent, pdir);
                grand.set_link(pdir, sub);
                self.core.refresh_list_parent(sub, grand);
                path.set(zi - 1, node);
                path.set(zi, parent);
            }

            let outer = path.get(zi - 1);
            outer.paint(Color::Black);
            grand.paint(Color::Red);

            let above = path.parent_of(zi - 2, nil);
            let sub = self.core.rotate(grand, !pdir);
            self.core.hook(above, grand, sub);
            self.core.refresh_list_parent(sub, above);
            break;
        }

        self.core.root.paint(Color::Black);
    }

    /// Deletes the tree node at the top of `path` (no duplicates), transplanting through the
    /// minimum of its right subtree when both children are real.
    unsafe fn delete(&mut self, node: NodeLink, path: &mut Path) {
        let nil = self.core.nil;
        let ix = path.len - 1;
        debug_assert!(path.get(ix) == node);

        let removed_color;
        let fix_len;
        let fix_dir;

        if node.link(Direction::Left) == nil || node.link(Direction::Right) == nil {
            // At most one child: splice the node, the child takes its slot.
            let cdir = if node.link(Direction::Left) == nil {
                Direction::Right
            } else {
                Direction::Left
            };
            let child = node.link(cdir);
            let parent = path.parent_of(ix, nil);

            removed_color = node.color();
            let dir = if parent == nil {
                Direction::Left
            } else {
                Direction::of(parent, node)
            };

            self.core.hook(parent, node, child);
            self.core.refresh_list_parent(child, parent);

            path.truncate(ix);
            fix_len = ix;
            fix_dir = dir;
        } else {
            // Two children: the successor (minimum of the right subtree) takes the node's
            // place; the fixup starts where the successor used to hang.
            let mut succ = node.link(Direction::Right);
            path.push(succ);
            while succ.link(Direction::Left) != nil {
                succ = succ.link(Direction::Left);
                path.push(succ);
            }

            removed_color = succ.color();
            let child = succ.link(Direction::Right);
            let parent = path.parent_of(ix, nil);

            if succ == node.link(Direction::Right) {
                succ.set_link(Direction::Left, node.link(Direction::Left));
                succ.paint(node.color());

                self.core.hook(parent, node, succ);
                self.core.refresh_list_parent(succ, parent);
                self.core
                    .refresh_list_parent(succ.link(Direction::Left), succ);

                path.set(ix, succ);
                path.truncate(ix + 1);
                fix_len = ix + 1;
                fix_dir = Direction::Right;
            } else {
                let succ_parent = path.get(path.len - 2);
                succ_parent.set_link(Direction::Left, child);
                self.core.refresh_list_parent(child, succ_parent);

                succ.set_link(Direction::Left, node.link(Direction::Left));
                succ.set_link(Direction::Right, node.link(Direction::Right));
                succ.paint(node.color());

                self.core.hook(parent, node, succ);
                self.core.refresh_list_parent(succ, parent);
                self.core
                    .refresh_list_parent(succ.link(Direction::Left), succ);
                self.core
                    .refresh_list_parent(succ.link(Direction::Right), succ);

                path.set(ix, succ);
                path.truncate(path.len - 1);
                fix_len = path.len;
                fix_dir = Direction::Left;
            }
        }

        if removed_color == Color::Black {
            self.fix_delete(path, fix_len, fix_dir);
        }

        self.core.count -= 1;
        if self.core.root != nil {
            self.core.root.paint(Color::Black);
        }
    }

    /// Resolves the doubly-black position hanging on side `dir` of `path[len - 1]`,
    /// ascending the stack through the four classic cases.
    unsafe fn fix_delete(&mut self, path: &mut Path, mut len: usize, mut dir: Direction) {
        let nil = self.core.nil;

        loop {
            if len == 0 {
                // The extra black reached the root; it evaporates.
                break;
            }

            let parent = path.get(len - 1);
            let node = parent.link(dir);

            if node != nil && node.is_red() {
                node.paint(Color::Black);
                break;
            }

            let mut sibling = parent.link(!dir);

            if sibling.is_red() {
                // Case 1: rotate the red sibling above, exposing a black one. The parent
                // slides one level down, so the stack grows in place.
                sibling.paint(Color::Black);
                parent.paint(Color::Red);

                let above = path.parent_of(len - 1, nil);
                let sub = self.core.rotate(parent, dir);
                self.core.hook(above, parent, sub);
                self.core.refresh_list_parent(sub, above);

                // The stack may still hold stale entries above `len` from an earlier ascent,
                // so the parent is written by index rather than pushed.
                path.set(len - 1, sub);
                path.set(len, parent);
                len += 1;

                sibling = parent.link(!dir);
            }

            let near = sibling.link(dir);
            let far = sibling.link(!dir);

            if !near.is_red() && !far.is_red() {
                // Case 2: recolor and push the problem one level up.
                sibling.paint(Color::Red);
                len -= 1;

                if len >= 1 {
                    dir = Direction::of(path.get(len - 1), parent);
                }
                continue;
            }

            let sibling = if !far.is_red() {
                // Case 3: near child red, far child black; rotate the sibling so the red
                // ends up far.
                near.paint(Color::Black);
                sibling.paint(Color::Red);

                let sub = self.core.rotate(sibling, !dir);
                parent.set_link(!dir, sub);
                self.core.refresh_list_parent(sub, parent);
                sub
            } else {
                sibling
            };

            // Case 4: far child red; one rotation pays the debt off.
            sibling.paint(parent.color());
            parent.paint(Color::Black);
            sibling.link(!dir).paint(Color::Black);

            let above = path.parent_of(len - 1, nil);
            let sub = self.core.rotate(parent, dir);
            self.core.hook(above, parent, sub);
            self.core.refresh_list_parent(sub, above);
            break;
        }
    }
}

impl FreeIndex for RbStack {
    const NAME: &'static str = "rbstack";
    const USES_COLOR: bool = true;
    const MIN_BLOCK_SIZE: usize = 40;
    const OVERHEAD: usize = 24;
    const SENTINEL_BYTES: usize = 32;

    unsafe fn attach(sentinel: HeapAddr) -> Self {
        Self {
            core: RbCore::attach(sentinel),
        }
    }

    unsafe fn insert(&mut self, block: BlockLink) {
        let node = NodeLink::from_block(block);
        let nil = self.core.nil;

        self.core.init_tree_node(node);

        if self.core.root == nil {
            self.core.root = node;
            node.paint(Color::Black);
            self.core.count += 1;
            return;
        }

        let size = node.size();
        let mut path = Path::new();
        let mut cur = self.core.root;

        loop {
            path.push(cur);
            let cur_size = cur.size();

            if size == cur_size {
                let parent = path.parent_of(path.len - 1, nil);
                self.core.push_duplicate(cur, node, parent);
                return;
            }

            let dir = if size < cur_size {
                Direction::Left
            } else {
                Direction::Right
            };
            let next = cur.link(dir);

            if next == nil {
                cur.set_link(dir, node);
                path.push(node);
                self.core.count += 1;
                self.fix_insert(&mut path);
                return;
            }

            cur = next;
        }
    }

    unsafe fn remove_best_fit(&mut self, need: usize) -> Option<BlockLink> {
        let nil = self.core.nil;
        let mut path = Path::new();
        let mut best = nil;
        let mut best_size = usize::MAX;
        let mut best_len = 0;
        let mut cur = self.core.root;

        while cur != nil {
            path.push(cur);
            let size = cur.size();

            if size == need {
                best = cur;
                best_len = path.len;
                break;
            }

            if size < need {
                cur = cur.link(Direction::Right);
            } else {
                if size < best_size {
                    best = cur;
                    best_size = size;
                    best_len = path.len;
                }
                cur = cur.link(Direction::Left);
            }
        }

        if best == nil {
            return None;
        }

        if best.list_start() != nil {
            // The size has duplicates: hand one out, no tree surgery.
            return Some(self.core.pop_duplicate(best).block());
        }

        path.truncate(best_len);
        self.delete(best, &mut path);
        Some(best.block())
    }

    unsafe fn remove_by_address(&mut self, block: BlockLink) {
        let node = NodeLink::from_block(block);

        if self.core.remove_if_listed(node) {
            return;
        }

        let mut path = Path::new();
        self.path_to(node, &mut path);
        self.delete(node, &mut path);
    }

    fn free_total(&self) -> usize {
        self.core.count
    }

    unsafe fn validate(&self, free_bytes: usize, free_blocks: usize) -> bool {
        self.core.validate(free_bytes, free_blocks)
    }

    unsafe fn write_free_nodes(
        &self,
        style: PrintStyle,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        self.core.write_free_nodes(style, out)
    }
}
