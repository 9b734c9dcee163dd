//! Intrusive red-black tree.
//!
//! Nodes are embedded in the structures they order (free page runs, large
//! free blocks); the tree itself holds only the root. Ordering is supplied
//! per call, so one node type can be keyed differently by different owners.
//! Null pointers stand in for nil leaves and count as black.

use core::ptr;

#[repr(C)]
pub struct RbNode {
    left: *mut RbNode,
    right: *mut RbNode,
    parent: *mut RbNode,
    red: bool,
}

impl RbNode {
    pub const fn new() -> Self {
        Self {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            red: false,
        }
    }
}

unsafe fn is_red(node: *mut RbNode) -> bool {
    !node.is_null() && (*node).red
}

unsafe fn is_black(node: *mut RbNode) -> bool {
    node.is_null() || !(*node).red
}

unsafe fn leftmost(mut node: *mut RbNode) -> *mut RbNode {
    while !(*node).left.is_null() {
        node = (*node).left;
    }
    node
}

pub struct RbTree {
    root: *mut RbNode,
}

impl RbTree {
    pub const fn new() -> Self {
        Self {
            root: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// In-order successor of `node`, or null.
    ///
    /// # Safety
    /// `node` must be linked into a tree.
    pub unsafe fn successor(node: *mut RbNode) -> *mut RbNode {
        if !(*node).right.is_null() {
            return leftmost((*node).right);
        }
        let mut n = node;
        let mut p = (*n).parent;
        while !p.is_null() && (*p).right == n {
            n = p;
            p = (*p).parent;
        }
        p
    }

    /// Lowest-ordered node for which `at_least` holds. `at_least` must be
    /// monotone in the tree order (false ... false true ... true).
    ///
    /// # Safety
    /// All nodes in the tree must be valid.
    pub unsafe fn lower_bound<F: Fn(*mut RbNode) -> bool>(&self, at_least: F) -> *mut RbNode {
        let mut node = self.root;
        let mut best = ptr::null_mut();
        while !node.is_null() {
            if at_least(node) {
                best = node;
                node = (*node).left;
            } else {
                node = (*node).right;
            }
        }
        best
    }

    /// Inserts `node`, ordering by `less`.
    ///
    /// # Safety
    /// `node` must point to writable memory not currently in any tree.
    pub unsafe fn insert<F: Fn(*mut RbNode, *mut RbNode) -> bool>(
        &mut self,
        node: *mut RbNode,
        less: F,
    ) {
        (*node).left = ptr::null_mut();
        (*node).right = ptr::null_mut();
        (*node).red = true;

        if self.root.is_null() {
            (*node).parent = ptr::null_mut();
            (*node).red = false;
            self.root = node;
            return;
        }

        let mut parent = self.root;
        loop {
            let next = if less(node, parent) {
                (*parent).left
            } else {
                (*parent).right
            };
            if next.is_null() {
                break;
            }
            parent = next;
        }
        (*node).parent = parent;
        if less(node, parent) {
            (*parent).left = node;
        } else {
            (*parent).right = node;
        }

        self.insert_fixup(node);
    }

    /// Unlinks `node` from the tree.
    ///
    /// # Safety
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, node: *mut RbNode) {
        let z = node;
        let removed_red;
        // The subtree that may have lost a black node, and its parent.
        let x: *mut RbNode;
        let x_parent: *mut RbNode;

        if (*z).left.is_null() {
            removed_red = (*z).red;
            x = (*z).right;
            x_parent = (*z).parent;
            self.transplant(z, x);
        } else if (*z).right.is_null() {
            removed_red = (*z).red;
            x = (*z).left;
            x_parent = (*z).parent;
            self.transplant(z, x);
        } else {
            let y = leftmost((*z).right);
            removed_red = (*y).red;
            x = (*y).right;
            if (*y).parent == z {
                x_parent = y;
            } else {
                x_parent = (*y).parent;
                self.transplant(y, x);
                (*y).right = (*z).right;
                (*(*y).right).parent = y;
            }
            self.transplant(z, y);
            (*y).left = (*z).left;
            (*(*y).left).parent = y;
            (*y).red = (*z).red;
        }

        if !removed_red {
            self.remove_fixup(x, x_parent);
        }

        (*z).left = ptr::null_mut();
        (*z).right = ptr::null_mut();
        (*z).parent = ptr::null_mut();
        (*z).red = false;
    }

    unsafe fn transplant(&mut self, old: *mut RbNode, new: *mut RbNode) {
        let p = (*old).parent;
        if p.is_null() {
            self.root = new;
        } else if (*p).left == old {
            (*p).left = new;
        } else {
            (*p).right = new;
        }
        if !new.is_null() {
            (*new).parent = p;
        }
    }

    unsafe fn rotate_left(&mut self, x: *mut RbNode) {
        let y = (*x).right;
        (*x).right = (*y).left;
        if !(*y).left.is_null() {
            (*(*y).left).parent = x;
        }
        (*y).parent = (*x).parent;
        let p = (*x).parent;
        if p.is_null() {
            self.root = y;
        } else if (*p).left == x {
            (*p).left = y;
        } else {
            (*p).right = y;
        }
        (*y).left = x;
        (*x).parent = y;
    }

    unsafe fn rotate_right(&mut self, x: *mut RbNode) {
        let y = (*x).left;
        (*x).left = (*y).right;
        if !(*y).right.is_null() {
            (*(*y).right).parent = x;
        }
        (*y).parent = (*x).parent;
        let p = (*x).parent;
        if p.is_null() {
            self.root = y;
        } else if (*p).left == x {
            (*p).left = y;
        } else {
            (*p).right = y;
        }
        (*y).right = x;
        (*x).parent = y;
    }

    unsafe fn insert_fixup(&mut self, mut n: *mut RbNode) {
        while is_red((*n).parent) {
            let p = (*n).parent;
            let gp = (*p).parent;
            debug_assert!(!gp.is_null());
            if p == (*gp).left {
                let uncle = (*gp).right;
                if is_red(uncle) {
                    (*p).red = false;
                    (*uncle).red = false;
                    (*gp).red = true;
                    n = gp;
                } else {
                    if n == (*p).right {
                        n = p;
                        self.rotate_left(n);
                    }
                    let p = (*n).parent;
                    let gp = (*p).parent;
                    (*p).red = false;
                    (*gp).red = true;
                    self.rotate_right(gp);
                }
            } else {
                let uncle = (*gp).left;
                if is_red(uncle) {
                    (*p).red = false;
                    (*uncle).red = false;
                    (*gp).red = true;
                    n = gp;
                } else {
                    if n == (*p).left {
                        n = p;
                        self.rotate_right(n);
                    }
                    let p = (*n).parent;
                    let gp = (*p).parent;
                    (*p).red = false;
                    (*gp).red = true;
                    self.rotate_left(gp);
                }
            }
        }
        (*self.root).red = false;
    }

    unsafe fn remove_fixup(&mut self, mut x: *mut RbNode, mut p: *mut RbNode) {
        while x != self.root && is_black(x) {
            if p.is_null() {
                break;
            }
            if x == (*p).left {
                let mut w = (*p).right;
                debug_assert!(!w.is_null());
                if is_red(w) {
                    (*w).red = false;
                    (*p).red = true;
                    self.rotate_left(p);
                    w = (*p).right;
                }
                if is_black((*w).left) && is_black((*w).right) {
                    (*w).red = true;
                    x = p;
                    p = (*x).parent;
                } else {
                    if is_black((*w).right) {
                        (*(*w).left).red = false;
                        (*w).red = true;
                        self.rotate_right(w);
                        w = (*p).right;
                    }
                    (*w).red = (*p).red;
                    (*p).red = false;
                    (*(*w).right).red = false;
                    self.rotate_left(p);
                    x = self.root;
                    break;
                }
            } else {
                let mut w = (*p).left;
                debug_assert!(!w.is_null());
                if is_red(w) {
                    (*w).red = false;
                    (*p).red = true;
                    self.rotate_right(p);
                    w = (*p).left;
                }
                if is_black((*w).right) && is_black((*w).left) {
                    (*w).red = true;
                    x = p;
                    p = (*x).parent;
                } else {
                    if is_black((*w).left) {
                        (*(*w).right).red = false;
                        (*w).red = true;
                        self.rotate_left(w);
                        w = (*p).left;
                    }
                    (*w).red = (*p).red;
                    (*p).red = false;
                    (*(*w).left).red = false;
                    self.rotate_right(p);
                    x = self.root;
                    break;
                }
            }
        }
        if !x.is_null() {
            (*x).red = false;
        }
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> *mut RbNode {
        self.root
    }
}
