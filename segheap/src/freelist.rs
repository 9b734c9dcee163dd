//! Free-block index over all blocked slabs.
//!
//! A free block's home is decided by its size:
//!   - below 32 B: untracked (marked free, coalescable, in no index)
//!   - 32 B ..= 8 KiB: an exact-size bin, `(size - 32) / 16`, with a bitset
//!     of non-empty bins so first-fit-from-size is one scan
//!   - above 8 KiB: a red-black tree keyed by (size, address)
//!
//! Free blocks carry their index links in their own bodies; tracked blocks
//! are large enough for header + links + footer by construction.

use core::mem::offset_of;
use core::ptr;

use crate::block::{
    block_size_for_user, is_untracked_size, Block, MAX_BINNED_SIZE, MIN_BLOCK_SIZE,
};
use crate::collections::{BitSet, List, ListNode, RbNode, RbTree};
use crate::layout::DEFAULT_ALIGN;

const NUM_BINS: usize = ((MAX_BINNED_SIZE - MIN_BLOCK_SIZE) / DEFAULT_ALIGN as u64) as usize + 1;
const BIN_WORDS: usize = (NUM_BINS + 63) / 64;

/// A binned free block: header, list links, (free space), footer.
#[repr(C)]
struct BinnedBlock {
    block: Block,
    link: ListNode,
}

/// A tree-indexed free block: header, tree node, (free space), footer.
#[repr(C)]
struct TreeBlock {
    block: Block,
    node: RbNode,
}

// Tracked blocks must fit their links plus the footer.
static_assertions::const_assert!(
    core::mem::size_of::<BinnedBlock>() + 8 <= MIN_BLOCK_SIZE as usize
);
static_assertions::const_assert!(
    core::mem::size_of::<TreeBlock>() + 8 <= MAX_BINNED_SIZE as usize + DEFAULT_ALIGN
);

fn bin_idx(size: u64) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE && size <= MAX_BINNED_SIZE);
    ((size - MIN_BLOCK_SIZE) / DEFAULT_ALIGN as u64) as usize
}

unsafe fn link_of(block: *mut Block) -> *mut ListNode {
    block.cast::<u8>().add(offset_of!(BinnedBlock, link)).cast()
}

unsafe fn block_of_link(link: *mut ListNode) -> *mut Block {
    link.cast::<u8>().sub(offset_of!(BinnedBlock, link)).cast()
}

unsafe fn node_of(block: *mut Block) -> *mut RbNode {
    block.cast::<u8>().add(offset_of!(TreeBlock, node)).cast()
}

unsafe fn block_of_node(node: *mut RbNode) -> *mut Block {
    node.cast::<u8>().sub(offset_of!(TreeBlock, node)).cast()
}

pub struct Freelist {
    bins: [List; NUM_BINS],
    nonempty: BitSet<BIN_WORDS>,
    tree: RbTree,
}

impl Freelist {
    pub const fn new() -> Self {
        const EMPTY: List = List::new();
        Self {
            bins: [EMPTY; NUM_BINS],
            nonempty: BitSet::new(),
            tree: RbTree::new(),
        }
    }

    /// A free block large enough for `user_size` bytes, or null. The block
    /// stays free and indexed; the caller splits or marks it allocated.
    pub fn find_free(&mut self, user_size: usize) -> *mut Block {
        let required = block_size_for_user(user_size);

        if required <= MAX_BINNED_SIZE {
            if let Some(idx) = self.nonempty.first_set_from(bin_idx(required)) {
                let link = self.bins[idx].front();
                debug_assert!(!link.is_null());
                return unsafe { block_of_link(link) };
            }
        }

        // Any tree block outsizes any binned block, so the tree only needs
        // consulting when the bins come up empty.
        let hit = unsafe {
            self.tree
                .lower_bound(|n| unsafe { (*block_of_node(n)).size() >= required })
        };
        if hit.is_null() {
            ptr::null_mut()
        } else {
            unsafe { block_of_node(hit) }
        }
    }

    /// Writes a free block of `size` bytes at `block` (header, footer, and
    /// the successor's PREV_FREE bit) and indexes it if trackable.
    ///
    /// # Safety
    /// `[block, block+size)` plus the next header must be writable slab
    /// memory, and the block's neighbors must be allocated (or about to be
    /// initialized consistently by the caller).
    pub unsafe fn init_free(&mut self, block: *mut Block, size: u64) {
        debug_assert!(size >= DEFAULT_ALIGN as u64 && size % DEFAULT_ALIGN as u64 == 0);
        // A free block never has a free predecessor.
        Block::init_allocated(block, size, false);
        (*block).set_free(true);
        Block::write_footer(block);
        (*Block::next_adjacent(block)).set_prev_free(true);

        if !is_untracked_size(size) {
            self.insert(block);
        }
    }

    /// Clears the free bit, fixes the successor's PREV_FREE, and removes
    /// the block from its index.
    ///
    /// # Safety
    /// `block` must be a tracked free block in this freelist.
    pub unsafe fn mark_allocated(&mut self, block: *mut Block) {
        debug_assert!((*block).is_free());
        self.remove(block);
        (*block).set_free(false);
        (*Block::next_adjacent(block)).set_prev_free(false);
    }

    /// Splits `block` (free, tracked) into an allocated head of at least
    /// `required` bytes and a free remainder, unless the remainder would be
    /// too small to track, in which case the whole block is handed out.
    ///
    /// # Safety
    /// `block` must be a tracked free block in this freelist; `required`
    /// must not exceed its size.
    pub unsafe fn split(
        &mut self,
        block: *mut Block,
        required: u64,
    ) -> (*mut Block, *mut Block) {
        let size = (*block).size();
        debug_assert!(required <= size);

        let remainder = size - required;
        if remainder < MIN_BLOCK_SIZE {
            self.mark_allocated(block);
            return (block, ptr::null_mut());
        }

        self.remove(block);
        (*block).set_size(required);
        (*block).set_free(false);
        let rest = Block::next_adjacent(block);
        self.init_free(rest, remainder);
        (block, rest)
    }

    /// Marks an allocated block free, coalescing with free neighbors.
    /// Returns the head of the (possibly merged) free block.
    ///
    /// # Safety
    /// `block` must be an allocated block inside a blocked slab.
    pub unsafe fn mark_free(&mut self, block: *mut Block) -> *mut Block {
        debug_assert!(!(*block).is_free());
        let mut size = (*block).size();
        let mut head = block;

        if (*block).prev_free() {
            let prev = Block::prev_adjacent(block);
            debug_assert_eq!((*prev).size(), Block::prev_size(block));
            size += (*prev).size();
            if !is_untracked_size((*prev).size()) {
                self.remove(prev);
            }
            head = prev;
        }

        let next = Block::next_adjacent(block);
        if (*next).is_free() {
            size += (*next).size();
            if !is_untracked_size((*next).size()) {
                self.remove(next);
            }
        }

        (*head).set_size(size);
        (*head).set_free(true);
        Block::write_footer(head);
        (*Block::next_adjacent(head)).set_prev_free(true);

        if !is_untracked_size(size) {
            self.insert(head);
        }
        head
    }

    /// Resizes an allocated block in place. Shrinking always succeeds and
    /// frees the cut-off tail; growing succeeds only into a free successor.
    ///
    /// # Safety
    /// `block` must be an allocated block inside a blocked slab.
    pub unsafe fn resize_in_place(&mut self, block: *mut Block, new_size: u64) -> bool {
        let size = (*block).size();
        let next = Block::next_adjacent(block);
        let next_free = (*next).is_free();
        let next_size = (*next).size();

        if new_size <= size {
            (*block).set_size(new_size);
            let cut = Block::next_adjacent(block);
            if next_free {
                // Extend the following free block backwards over the tail.
                self.move_head(next, cut, next_size + size - new_size);
            } else if new_size != size {
                self.init_free(cut, size - new_size);
            }
            return true;
        }

        if next_free && new_size <= size + next_size {
            (*block).set_size(new_size);
            self.move_head(next, Block::next_adjacent(block), size + next_size - new_size);
            return true;
        }

        false
    }

    /// Removes a tracked free block from its index without touching its
    /// header. Used when a blocked slab is released whole.
    ///
    /// # Safety
    /// `block` must be a tracked free block in this freelist.
    pub unsafe fn delete_block(&mut self, block: *mut Block) {
        self.remove(block);
    }

    /// Moves a free block's head from `old` to `new_head` with `new_size`
    /// bytes (possibly zero, consuming it entirely).
    unsafe fn move_head(&mut self, old: *mut Block, new_head: *mut Block, new_size: u64) {
        if !is_untracked_size((*old).size()) {
            self.remove(old);
        }
        if new_size != 0 {
            self.init_free(new_head, new_size);
        } else {
            // `new_head` is the block after the consumed free region.
            (*new_head).set_prev_free(false);
        }
    }

    unsafe fn insert(&mut self, block: *mut Block) {
        let size = (*block).size();
        debug_assert!(!is_untracked_size(size));
        if size <= MAX_BINNED_SIZE {
            let idx = bin_idx(size);
            self.bins[idx].push_front(link_of(block));
            self.nonempty.set(idx);
        } else {
            self.tree.insert(node_of(block), |a, b| unsafe {
                let (ba, bb) = (block_of_node(a), block_of_node(b));
                ((*ba).size(), ba as usize) < ((*bb).size(), bb as usize)
            });
        }
    }

    unsafe fn remove(&mut self, block: *mut Block) {
        let size = (*block).size();
        debug_assert!(!is_untracked_size(size));
        if size <= MAX_BINNED_SIZE {
            let idx = bin_idx(size);
            debug_assert!(self.nonempty.test(idx));
            self.bins[idx].remove(link_of(block));
            if self.bins[idx].is_empty() {
                self.nonempty.clear(idx);
            }
        } else {
            self.tree.remove(node_of(block));
        }
    }
}
