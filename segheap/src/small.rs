//! Small allocator: fixed-size slice pools.
//!
//! Requests of up to 128 bytes are served from single-page small slabs,
//! one size class per slab. Free slices stack intrusively inside the page
//! (each free slice's first two bytes hold the id of the next), and the
//! non-full slabs of a class form a doubly linked list threaded through
//! `PageId` links in the slab records, headed here per class.

use core::ptr::NonNull;

use crate::layout::PageId;
use crate::size_class::{SizeClass, SliceId, NUM_SIZE_CLASSES};
use crate::slab::Slab;
use crate::slab_manager::{SlabCtx, SlabInit, SlabManager};
use crate::sys::RawHeap;

pub struct SmallAllocator {
    /// Head of each class's list of non-full slabs.
    partial: [PageId; NUM_SIZE_CLASSES],
}

impl SmallAllocator {
    pub const fn new() -> Self {
        Self {
            partial: [PageId::NIL; NUM_SIZE_CLASSES],
        }
    }

    pub fn alloc<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        user_size: usize,
    ) -> Option<NonNull<u8>> {
        self.alloc_class(mgr, ctx, SizeClass::from_user_size(user_size))
    }

    /// Allocates one slice of exactly `class`. Also the entry point for
    /// aligned requests whose class was promoted to an alignment multiple.
    pub fn alloc_class<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        class: SizeClass,
    ) -> Option<NonNull<u8>> {
        let head = self.partial[class.ordinal()];
        let slab = if head.is_nil() {
            let (id, slab) = mgr.alloc(ctx, 1, SlabInit::Small(class))?;
            unsafe { Self::init_slice_stack(slab, mgr.page_start(id)) };
            self.push_partial(ctx, slab);
            slab
        } else {
            ctx.map.find_slab(head)
        };
        debug_assert!(!slab.is_null());
        Some(self.take_slice(mgr, ctx, slab))
    }

    /// Reallocation within the small range. Same class keeps the slice;
    /// otherwise a new slice is allocated and the payload copied.
    pub fn realloc<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
        ptr: NonNull<u8>,
        user_size: usize,
    ) -> Option<NonNull<u8>> {
        let cur_class = unsafe { (*slab).class() };
        let new_class = SizeClass::from_user_size(user_size);
        if cur_class == new_class {
            return Some(ptr);
        }

        let new_ptr = self.alloc_class(mgr, ctx, new_class)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                cur_class.slice_size().min(new_class.slice_size()),
            );
        }
        self.free(mgr, ctx, slab, ptr);
        Some(new_ptr)
    }

    pub fn free<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
        ptr: NonNull<u8>,
    ) {
        let page = mgr.page_start(unsafe { (*slab).start() });
        let class = unsafe { (*slab).class() };
        let offset = ptr.as_ptr() as usize - page as usize;
        debug_assert!(offset < crate::layout::PAGE_SIZE);
        debug_assert_eq!(offset % class.slice_size(), 0, "misaligned small free");

        unsafe {
            // A full slab rejoins its class list before taking the slice.
            if (*slab).is_full() {
                self.push_partial(ctx, slab);
            }

            let idx = SliceId((offset / class.slice_size()) as u16);
            Self::push_slice(slab, page, ptr.as_ptr(), idx);

            if (*slab).is_empty() {
                self.remove_partial(ctx, slab);
                mgr.free(ctx, slab);
            }
        }
    }

    fn take_slice<H: RawHeap>(
        &mut self,
        mgr: &mut SlabManager,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
    ) -> NonNull<u8> {
        unsafe {
            debug_assert!(!(*slab).is_full());
            let page = mgr.page_start((*slab).start());
            let ptr = Self::pop_slice(slab, page);
            if (*slab).is_full() {
                self.remove_partial(ctx, slab);
            }
            NonNull::new_unchecked(ptr)
        }
    }

    /// Builds the free-slice stack through the whole page: slice 0 on top,
    /// each pointing at its neighbor, the last at NIL.
    unsafe fn init_slice_stack(slab: *mut Slab, page: *mut u8) {
        let class = (*slab).class();
        let size = class.slice_size();
        let n = class.slices_per_page();
        for i in 0..n - 1 {
            let slice = page.add(i as usize * size).cast::<u16>();
            *slice = (i + 1) as u16;
        }
        let last = page.add((n - 1) as usize * size).cast::<u16>();
        *last = SliceId::NIL.0;
        (*slab).set_free_head(SliceId(0));
    }

    unsafe fn pop_slice(slab: *mut Slab, page: *mut u8) -> *mut u8 {
        let head = (*slab).free_head();
        debug_assert!(!head.is_nil());
        let ptr = page.add(head.0 as usize * (*slab).class().slice_size());
        let next = SliceId(*ptr.cast::<u16>());
        (*slab).set_free_head(next);
        (*slab).add_slice();
        ptr
    }

    unsafe fn push_slice(slab: *mut Slab, page: *mut u8, ptr: *mut u8, idx: SliceId) {
        debug_assert_eq!(
            page.add(idx.0 as usize * (*slab).class().slice_size()),
            ptr
        );
        *ptr.cast::<u16>() = (*slab).free_head().0;
        (*slab).set_free_head(idx);
        (*slab).remove_slice();
    }

    fn push_partial<H: RawHeap>(&mut self, ctx: &mut SlabCtx<H>, slab: *mut Slab) {
        unsafe {
            let ord = (*slab).class().ordinal();
            let head = self.partial[ord];
            (*slab).set_next_partial(head);
            (*slab).set_prev_partial(PageId::NIL);
            if !head.is_nil() {
                let old_head = ctx.map.find_slab(head);
                (*old_head).set_prev_partial((*slab).start());
            }
            self.partial[ord] = (*slab).start();
        }
    }

    fn remove_partial<H: RawHeap>(&mut self, ctx: &mut SlabCtx<H>, slab: *mut Slab) {
        unsafe {
            let ord = (*slab).class().ordinal();
            let prev = (*slab).prev_partial();
            let next = (*slab).next_partial();
            if prev.is_nil() {
                debug_assert_eq!(self.partial[ord], (*slab).start());
                self.partial[ord] = next;
            } else {
                (*ctx.map.find_slab(prev)).set_next_partial(next);
            }
            if !next.is_nil() {
                (*ctx.map.find_slab(next)).set_prev_partial(prev);
            }
            (*slab).set_next_partial(PageId::NIL);
            (*slab).set_prev_partial(PageId::NIL);
        }
    }
}
