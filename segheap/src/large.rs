//! Large allocator: requests above the small limit.
//!
//! Two sub-paths. Blocked slabs hold boundary-tagged blocks and serve
//! everything up to the binned maximum; the process-wide freelist is
//! consulted first so free space in any blocked slab is eligible. Requests
//! above that (or explicitly page-aligned ones) get a single-alloc slab:
//! the whole page run is one allocation, resized in place through the slab
//! manager when possible.

use core::ptr::NonNull;

use crate::block::{block_size_for_user, Block, BLOCK_HEADER_SIZE, MAX_BINNED_SIZE};
use crate::freelist::Freelist;
use crate::layout::{pages_for, PageId, PAGE_SHIFT, PAGE_SIZE};
use crate::slab::{Slab, SlabKind};
use crate::slab_manager::{SlabCtx, SlabInit, SlabManager};
use crate::sys::RawHeap;

/// Offset of the first block header in a blocked slab, placed so user data
/// lands 16-aligned.
const FIRST_BLOCK_OFFSET: usize = 8;

/// Header offset plus the phony terminator at the slab end.
const BLOCKED_SLAB_OVERHEAD: usize = FIRST_BLOCK_OFFSET + BLOCK_HEADER_SIZE;

/// Largest block a blocked slab of `pages` pages can hold.
fn max_block_size(pages: u32) -> u64 {
    (((pages as usize) << PAGE_SHIFT) - BLOCKED_SLAB_OVERHEAD) as u64
}

/// Pages for a blocked slab whose first block serves `user_size`.
fn pages_for_block(user_size: usize) -> u32 {
    pages_for(block_size_for_user(user_size) as usize + BLOCKED_SLAB_OVERHEAD)
}

/// Sizes that get a slab of their own rather than a block.
fn suits_single_alloc(user_size: usize) -> bool {
    user_size as u64 > MAX_BINNED_SIZE
}

pub struct LargeAllocator {
    freelist: Freelist,
}

impl LargeAllocator {
    pub const fn new() -> Self {
        Self {
            freelist: Freelist::new(),
        }
    }

    pub fn alloc<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        user_size: usize,
    ) -> Option<NonNull<u8>> {
        if let Some(block) = self.alloc_from_freelist(mgr, ctx, user_size) {
            return NonNull::new(unsafe { Block::user_ptr(block) });
        }

        if suits_single_alloc(user_size) {
            return self.alloc_single(mgr, ctx, user_size, 1);
        }

        let block = self.alloc_blocked_slab(mgr, ctx, user_size)?;
        NonNull::new(unsafe { Block::user_ptr(block) })
    }

    /// Allocates a single-alloc slab, page-aligned to `align_pages`.
    pub fn alloc_single<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        user_size: usize,
        align_pages: u32,
    ) -> Option<NonNull<u8>> {
        let n_pages = pages_for(user_size.max(1));
        let (id, _slab) = if align_pages <= 1 {
            mgr.alloc(ctx, n_pages, SlabInit::SingleAlloc)?
        } else {
            mgr.alloc_aligned(ctx, n_pages, align_pages)?
        };
        NonNull::new(mgr.page_start(id))
    }

    pub fn free<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
        ptr: NonNull<u8>,
    ) {
        match unsafe { (*slab).kind() } {
            SlabKind::Blocked => unsafe {
                let block = Block::from_user_ptr(ptr.as_ptr());
                debug_assert!(!(*block).is_free(), "double free of large block");
                (*slab).remove_allocation((*block).size());
                self.freelist.mark_free(block);

                if (*slab).allocated_bytes() == 0 {
                    self.release_blocked_slab(mgr, ctx, slab);
                }
            },
            SlabKind::SingleAlloc => {
                debug_assert_eq!(
                    ptr.as_ptr(),
                    mgr.page_start(unsafe { (*slab).start() }),
                    "single-alloc free not at slab start"
                );
                mgr.free(ctx, slab);
            }
            _ => unreachable!("large free on non-large slab"),
        }
    }

    pub fn realloc<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
        ptr: NonNull<u8>,
        user_size: usize,
    ) -> Option<NonNull<u8>> {
        let orig_user_size: usize;

        match unsafe { (*slab).kind() } {
            SlabKind::Blocked => unsafe {
                let block = Block::from_user_ptr(ptr.as_ptr());
                let old_size = (*block).size();
                let new_size = block_size_for_user(user_size);

                if self.freelist.resize_in_place(block, new_size) {
                    (*slab).add_allocation(new_size);
                    (*slab).remove_allocation(old_size);
                    return Some(ptr);
                }
                orig_user_size = (*block).user_size() as usize;
            },
            SlabKind::SingleAlloc => {
                if suits_single_alloc(user_size)
                    && mgr.resize(ctx, slab, pages_for(user_size))
                {
                    return Some(ptr);
                }
                orig_user_size = unsafe { (*slab).pages() } as usize * PAGE_SIZE;
            }
            _ => unreachable!("large realloc on non-large slab"),
        }

        // In-place failed: allocate fresh, copy, free the old region.
        let new_ptr = self.alloc(mgr, ctx, user_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                user_size.min(orig_user_size),
            );
        }
        self.free(mgr, ctx, slab, ptr);
        Some(new_ptr)
    }

    /// Usable bytes of the allocation at `ptr` in a large slab.
    pub fn usable_size(&self, slab: *mut Slab, ptr: NonNull<u8>) -> usize {
        match unsafe { (*slab).kind() } {
            SlabKind::Blocked => unsafe {
                (*Block::from_user_ptr(ptr.as_ptr())).user_size() as usize
            },
            SlabKind::SingleAlloc => unsafe { (*slab).pages() as usize * PAGE_SIZE },
            _ => unreachable!("not a large slab"),
        }
    }

    fn alloc_from_freelist<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        user_size: usize,
    ) -> Option<*mut Block> {
        let free = self.freelist.find_free(user_size);
        if free.is_null() {
            return None;
        }

        let slab = ctx.map.find_slab(mgr.page_id(free.cast()));
        debug_assert!(!slab.is_null());
        unsafe {
            let (block, _rest) = self.freelist.split(free, block_size_for_user(user_size));
            (*slab).add_allocation((*block).size());
            Some(block)
        }
    }

    fn alloc_blocked_slab<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        user_size: usize,
    ) -> Option<*mut Block> {
        let n_pages = pages_for_block(user_size);
        let (id, slab) = mgr.alloc(ctx, n_pages, SlabInit::Blocked)?;

        let block_size = block_size_for_user(user_size);
        let max_size = max_block_size(n_pages);
        debug_assert!(block_size <= max_size);

        unsafe {
            let block = Self::first_block(mgr, id);
            Block::init_allocated(block, block_size, false);
            (*slab).add_allocation(block_size);

            // The remainder becomes the slab's free tail; either way a
            // phony terminator caps the run.
            let remainder = max_size - block_size;
            if remainder > 0 {
                let rest = Block::next_adjacent(block);
                self.freelist.init_free(rest, remainder);
                Block::init_phony(Block::next_adjacent(rest), true);
            } else {
                Block::init_phony(Block::next_adjacent(block), false);
            }
            Some(block)
        }
    }

    /// Gives an empty blocked slab back to the slab manager. Only fires
    /// when the slab's one remaining free block spans everything between
    /// the boundary tags.
    unsafe fn release_blocked_slab<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
    ) {
        debug_assert_eq!((*slab).allocated_bytes(), 0);
        let only = Self::first_block(mgr, (*slab).start());
        if !(*only).is_free() || (*only).size() != max_block_size((*slab).pages()) {
            debug_assert!(false, "empty blocked slab with fragmented interior");
            return;
        }
        self.freelist.delete_block(only);
        mgr.free(ctx, slab);
    }

    fn first_block(mgr: &SlabManager, id: PageId) -> *mut Block {
        unsafe { mgr.page_start(id).add(FIRST_BLOCK_OFFSET).cast() }
    }

    /// Walks a blocked slab's boundary tags and checks every interior
    /// invariant: sizes tile the slab exactly, no two adjacent free
    /// blocks, footers mirror headers, PREV_FREE bits match reality, and
    /// the allocated-bytes counter agrees with the walk.
    #[cfg(test)]
    pub(crate) fn check_blocked_slab(mgr: &SlabManager, slab: *mut crate::slab::Slab) {
        unsafe {
            let max = max_block_size((*slab).pages());
            let mut block = Self::first_block(mgr, (*slab).start());
            let mut total = 0u64;
            let mut allocated = 0u64;
            let mut prev_was_free = false;

            loop {
                let size = (*block).size();
                if size == 0 {
                    assert!(!(*block).is_free(), "phony header marked free");
                    assert_eq!((*block).prev_free(), prev_was_free);
                    break;
                }
                assert_eq!(size % 16, 0, "misaligned block size");
                assert_eq!((*block).prev_free(), prev_was_free);
                if (*block).is_free() {
                    assert!(!prev_was_free, "adjacent free blocks");
                    let next = Block::next_adjacent(block);
                    assert_eq!(Block::prev_size(next), size, "footer mismatch");
                    prev_was_free = true;
                } else {
                    allocated += size;
                    prev_was_free = false;
                }
                total += size;
                block = Block::next_adjacent(block);
            }

            assert_eq!(total, max, "blocks do not tile the slab");
            assert_eq!(
                allocated,
                (*slab).allocated_bytes(),
                "allocated-bytes counter out of sync"
            );
        }
    }
}
