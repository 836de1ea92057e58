//! Top-down removal style.
//!
//! Instead of remembering ancestry, this style repairs the tree on the way down: insertion
//! splits four-nodes as it descends, and deletion pushes a red down the search path so the
//! node that finally gets unhooked is never doubly black. The working set is a rolling window
//! of grandparent, parent, current node, and the last search direction; a pseudo-root on the
//! call stack absorbs the root special cases.
//!
//! Deletion is merged with the best-fit search: the same descent that steers toward the
//! tightest fitting size performs the fix-on-descent rotations, and the node reached at the
//! bottom of the path is transplanted into the candidate's position.

use core::fmt;

use crate::mem::block::{BlockHeader, BlockLink, Color};
use crate::mem::index::{FreeIndex, PrintStyle};
use crate::mem::rbtree::{Direction, NodeLink, RbCore, TreeNode};
use crate::mem::HeapAddr;

/// Red-black free index, top-down style.
pub struct RbTopdown {
    core: RbCore,
}

impl RbTopdown {
    /// Single rotation with the classic top-down recoloring: the demoted node turns red, the
    /// promoted one black.
    unsafe fn single(&mut self, node: NodeLink, dir: Direction) -> NodeLink {
        let sub = self.core.rotate(node, dir);
        node.paint(Color::Red);
        sub.paint(Color::Black);
        sub
    }

    /// Double rotation: the inner grandchild rises two levels.
    unsafe fn double(&mut self, node: NodeLink, dir: Direction) -> NodeLink {
        let inner = self.single(node.link(!dir), !dir);
        node.set_link(!dir, inner);
        self.core.refresh_list_parent(inner, node);
        self.single(node, dir)
    }

    /// A pseudo-root living on the call stack, holding the real root on its right. Rotations
    /// near the top hook into it like into any other parent, and the (possibly new) root is
    /// read back from it afterwards.
    fn pseudo_root(&self) -> TreeNode {
        TreeNode {
            header: BlockHeader::BOUNDARY,
            links: [self.core.nil, self.core.root],
            list_start: self.core.nil,
        }
    }

    /// Parent value to store or propagate when a subtree was hooked under `holder`: hooking
    /// under the pseudo-root means the subtree is the root, whose parent is the sentinel.
    fn custody(&self, holder: NodeLink, pseudo: NodeLink) -> NodeLink {
        if holder == pseudo {
            self.core.nil
        } else {
            holder
        }
    }

    /// Top-down deletion merged with the fit search.
    ///
    /// With `exact` set, the descent steers toward that node's size (sizes are unique in the
    /// tree, so it lands on the node itself). Otherwise it tracks the smallest size at least
    /// `need` and deletes that, or hands out one of its duplicates when it has any. Returns
    /// the removed block.
    unsafe fn remove(&mut self, need: usize, exact: Option<NodeLink>) -> Option<BlockLink> {
        let nil = self.core.nil;

        if self.core.root == nil {
            return None;
        }

        let mut pseudo_storage = self.pseudo_root();
        let pseudo = NodeLink::from_raw(&mut pseudo_storage);

        let mut grand = NodeLink::NULL_LINK;
        let mut parent = NodeLink::NULL_LINK;
        let mut cur = pseudo;
        let mut dir = Direction::Right;

        let mut found = nil;
        let mut found_size = usize::MAX;

        while cur.link(dir) != nil {
            let last = dir;
            grand = parent;
            parent = cur;
            cur = cur.link(dir);

            let size = cur.size();

            dir = match exact {
                Some(_) => {
                    if size == need {
                        found = cur;
                    }
                    if size < need {
                        Direction::Right
                    } else {
                        Direction::Left
                    }
                }
                None => {
                    if size < need {
                        Direction::Right
                    } else {
                        if size < found_size {
                            found = cur;
                            found_size = size;
                        }
                        Direction::Left
                    }
                }
            };

            // Push a red down to the current node if neither it nor the next step is red.
            if !cur.is_red() && !cur.link(dir).is_red() {
                if cur.link(!dir).is_red() {
                    let sub = self.single(cur, dir);
                    parent.set_link(last, sub);
                    self.core
                        .refresh_list_parent(sub, self.custody(parent, pseudo));
                    parent = sub;
                } else {
                    let sibling = parent.link(!last);

                    if sibling != nil {
                        if !sibling.link(!last).is_red() && !sibling.link(last).is_red() {
                            // Color flip across the parent.
                            parent.paint(Color::Black);
                            sibling.paint(Color::Red);
                            cur.paint(Color::Red);
                        } else {
                            let gdir = if grand.link(Direction::Right) == parent {
                                Direction::Right
                            } else {
                                Direction::Left
                            };

                            let sub = if sibling.link(last).is_red() {
                                self.double(parent, last)
                            } else {
                                self.single(parent, last)
                            };
                            grand.set_link(gdir, sub);
                            self.core
                                .refresh_list_parent(sub, self.custody(grand, pseudo));

                            cur.paint(Color::Red);
                            sub.paint(Color::Red);
                            sub.link(Direction::Left).paint(Color::Black);
                            sub.link(Direction::Right).paint(Color::Black);
                        }
                    }
                }
            }
        }

        let removed = if found == nil {
            None
        } else if exact.is_none() && found.list_start() != nil {
            // Best fit has duplicates: hand one out, the tree keeps its shape. The repairs
            // made on the way down stand on their own.
            Some(self.core.pop_duplicate(found))
        } else {
            debug_assert!(exact.is_none() || exact == Some(found));

            // Unhook the bottom node; the red push made it safe to remove.
            let cdir = if cur.link(Direction::Left) == nil {
                Direction::Right
            } else {
                Direction::Left
            };
            let child = cur.link(cdir);
            let pdir = Direction::of(parent, cur);

            parent.set_link(pdir, child);
            self.core
                .refresh_list_parent(child, self.custody(parent, pseudo));

            if cur != found {
                // The bottom node is the candidate's in-order predecessor: transplant it
                // into the candidate's position. The candidate's parent is recovered by a
                // fresh descent, the only ancestry this style ever needs.
                let target = found.size();
                let mut above = pseudo;
                let mut walk = pseudo.link(Direction::Right);

                while walk != found {
                    above = walk;
                    walk = walk.link(if target < walk.size() {
                        Direction::Left
                    } else {
                        Direction::Right
                    });
                }

                cur.set_link(Direction::Left, found.link(Direction::Left));
                cur.set_link(Direction::Right, found.link(Direction::Right));
                cur.paint(found.color());

                above.set_link(Direction::of(above, found), cur);
                self.core
                    .refresh_list_parent(cur, self.custody(above, pseudo));
                self.core
                    .refresh_list_parent(cur.link(Direction::Left), cur);
                self.core
                    .refresh_list_parent(cur.link(Direction::Right), cur);
            }

            self.core.count -= 1;
            Some(found)
        };

        self.core.root = pseudo.link(Direction::Right);
        if self.core.root != nil {
            self.core.root.paint(Color::Black);
        }

        removed.map(NodeLink::block)
    }
}

impl FreeIndex for RbTopdown {
    const NAME: &'static str = "rbtopdown";
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

        let key = node.size();

        let mut pseudo_storage = self.pseudo_root();
        let pseudo = NodeLink::from_raw(&mut pseudo_storage);

        let mut great = pseudo;
        let mut grand = NodeLink::NULL_LINK;
        let mut parent = NodeLink::NULL_LINK;
        let mut cur = self.core.root;
        let mut dir = Direction::Right;
        let mut last = Direction::Right;

        loop {
            let mut cur_parent = parent;

            if cur == nil {
                cur = node;
                parent.set_link(dir, node);
                self.core.count += 1;
            } else if cur.link(Direction::Left).is_red() && cur.link(Direction::Right).is_red()
            {
                // Split the four-node on the way down.
                cur.paint(Color::Red);
                cur.link(Direction::Left).paint(Color::Black);
                cur.link(Direction::Right).paint(Color::Black);
            }

            if cur.is_red() && parent != NodeLink::NULL_LINK && parent.is_red() {
                let gdir = if great.link(Direction::Right) == grand {
                    Direction::Right
                } else {
                    Direction::Left
                };

                let sub = if cur == parent.link(last) {
                    self.single(grand, !last)
                } else {
                    self.double(grand, !last)
                };
                great.set_link(gdir, sub);
                self.core
                    .refresh_list_parent(sub, self.custody(great, pseudo));

                // A double rotation lifts the current node to the subtree top; its parent is
                // now whatever the subtree hooked into.
                if sub == cur {
                    cur_parent = self.custody(great, pseudo);
                }
            }

            if cur.size() == key {
                if cur != node {
                    let custody = if cur_parent == NodeLink::NULL_LINK {
                        nil
                    } else {
                        cur_parent
                    };
                    self.core.push_duplicate(cur, node, custody);
                }
                break;
            }

            last = dir;
            dir = if cur.size() < key {
                Direction::Right
            } else {
                Direction::Left
            };

            if grand != NodeLink::NULL_LINK {
                great = grand;
            }
            grand = parent;
            parent = cur;
            cur = cur.link(dir);
        }

        self.core.root = pseudo.link(Direction::Right);
        self.core.root.paint(Color::Black);
    }

    unsafe fn remove_best_fit(&mut self, need: usize) -> Option<BlockLink> {
        self.remove(need, None)
    }

    unsafe fn remove_by_address(&mut self, block: BlockLink) {
        let node = NodeLink::from_block(block);

        if self.core.remove_if_listed(node) {
            return;
        }

        let removed = self.remove(node.size(), Some(node));
        debug_assert!(removed == Some(node.block()));
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
