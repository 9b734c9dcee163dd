//! Slab manager: the page-run universe of the user region.
//!
//! Free runs are held in two structures written into the free pages
//! themselves: a LIFO list of single-page runs (cache-warm reuse) and a
//! red-black tree of multi-page runs keyed by page count (best-fit), with a
//! cached pointer to the tree's smallest run so 1-2 page requests skip the
//! descent. Allocation tries those, then splits a larger run, then extends
//! the region, absorbing a trailing free run first so extension maps only
//! the difference. Freeing coalesces with both page-adjacent neighbors; no
//! two adjacent free runs ever survive a public operation.

use core::ptr;

use crate::collections::{List, ListNode, RbNode, RbTree};
use crate::layout::{align_up, PageId, MAX_PAGES, PAGE_SHIFT, PAGE_SIZE};
use crate::metadata::MetadataManager;
use crate::size_class::SizeClass;
use crate::slab::{Slab, SlabKind};
use crate::slab_map::SlabMap;
use crate::sys::RawHeap;

/// Collaborators every page-run operation needs.
pub struct SlabCtx<'a, H: RawHeap> {
    pub heap: &'a mut H,
    pub map: &'a mut SlabMap,
    pub meta: &'a mut MetadataManager<H>,
}

/// What to initialize a freshly allocated slab as.
pub enum SlabInit {
    Small(SizeClass),
    Blocked,
    SingleAlloc,
}

/// Head of a free multi-page run, written at the run's first page.
#[repr(C)]
struct FreeRun {
    node: RbNode,
    pages: u32,
}

static_assertions::const_assert!(core::mem::size_of::<FreeRun>() <= PAGE_SIZE);
static_assertions::const_assert!(core::mem::size_of::<ListNode>() <= PAGE_SIZE);

pub struct SlabManager {
    /// User region base; stable for the region's lifetime.
    base: *mut u8,
    single_page_free: List,
    multi_page_free: RbTree,
    /// Cached smallest run in the tree.
    smallest_run: *mut FreeRun,
}

unsafe fn run_pages(node: *mut RbNode) -> u32 {
    (*node.cast::<FreeRun>()).pages
}

impl SlabManager {
    pub fn new(base: *mut u8) -> Self {
        Self {
            base,
            single_page_free: List::new(),
            multi_page_free: RbTree::new(),
            smallest_run: ptr::null_mut(),
        }
    }

    /// Start of the page with the given id.
    pub fn page_start(&self, id: PageId) -> *mut u8 {
        debug_assert!(!id.is_nil());
        unsafe { self.base.add(id.byte_offset()) }
    }

    /// Id of the page containing `ptr`.
    pub fn page_id(&self, ptr: *const u8) -> PageId {
        debug_assert!(ptr as usize >= self.base as usize);
        PageId(((ptr as usize - self.base as usize) >> PAGE_SHIFT) as u32)
    }

    fn heap_end_id<H: RawHeap>(heap: &H) -> PageId {
        PageId((heap.size() >> PAGE_SHIFT) as u32)
    }

    /// Allocates `n_pages` contiguous pages, initializes a record for them
    /// per `init`, and maps every page to the record. `None` on OOM with no
    /// state changed.
    pub fn alloc<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        n_pages: u32,
        init: SlabInit,
    ) -> Option<(PageId, *mut Slab)> {
        debug_assert!(n_pages > 0);
        let (start, slab) = self.alloc_run(ctx, n_pages)?;

        let class = unsafe {
            match init {
                SlabInit::Small(class) => {
                    (*slab).init_small(start, n_pages, class);
                    Some(class)
                }
                SlabInit::Blocked => {
                    (*slab).init_blocked(start, n_pages);
                    None
                }
                SlabInit::SingleAlloc => {
                    (*slab).init_single_alloc(start, n_pages);
                    None
                }
            }
        };

        let end = PageId(start.0 + n_pages - 1);
        ctx.map.insert_range(start, end, slab, class);
        Some((start, slab))
    }

    /// Like `alloc`, but the run's start page is aligned to `align_pages`
    /// (a power of two). Used for coarser-than-page `aligned_alloc`; the
    /// run is always a single-alloc slab. The unaligned prefix and suffix
    /// of the carved region go back to the free pool.
    pub fn alloc_aligned<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        n_pages: u32,
        align_pages: u32,
    ) -> Option<(PageId, *mut Slab)> {
        debug_assert!(align_pages.is_power_of_two());
        if align_pages <= 1 {
            return self.alloc(ctx, n_pages, SlabInit::SingleAlloc);
        }

        let total = n_pages + align_pages - 1;
        let (start, slab) = self.alloc_run(ctx, total)?;

        // Align the absolute address; the region base itself is only
        // page-aligned.
        let start_addr = self.base as usize + start.byte_offset();
        let aligned_addr = align_up(start_addr, (align_pages as usize) << PAGE_SHIFT);
        let aligned = PageId(start.0 + ((aligned_addr - start_addr) >> PAGE_SHIFT) as u32);
        let prefix = aligned.0 - start.0;
        let suffix = total - prefix - n_pages;

        if prefix > 0 && self.carve_free(ctx, start, prefix).is_none() {
            // Could not describe the trim; give the whole run back.
            unsafe { (*slab).init_single_alloc(start, total) };
            ctx.map
                .insert_range(start, PageId(start.0 + total - 1), slab, None);
            self.free(ctx, slab);
            return None;
        }
        if suffix > 0 {
            let tail_start = PageId(aligned.0 + n_pages);
            if self.carve_free(ctx, tail_start, suffix).is_none() {
                unsafe { (*slab).init_single_alloc(aligned, n_pages + suffix) };
                ctx.map.insert_range(
                    aligned,
                    PageId(aligned.0 + n_pages + suffix - 1),
                    slab,
                    None,
                );
                self.free(ctx, slab);
                return None;
            }
        }

        unsafe { (*slab).init_single_alloc(aligned, n_pages) };
        ctx.map
            .insert_range(aligned, PageId(aligned.0 + n_pages - 1), slab, None);
        Some((aligned, slab))
    }

    /// Describes `[start, start+pages)` as a fresh free region with a new
    /// record. Used for the trims of aligned carving, whose neighbors are
    /// never free.
    fn carve_free<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        start: PageId,
        pages: u32,
    ) -> Option<*mut Slab> {
        let rec = ctx.meta.alloc_slab_record();
        if rec.is_null() {
            return None;
        }
        self.free_region(ctx, rec, start, pages);
        Some(rec)
    }

    /// Frees the slab's page run, coalescing with adjacent free runs. Takes
    /// ownership of the record (it becomes the merged run's record).
    pub fn free<H: RawHeap>(&mut self, ctx: &mut SlabCtx<H>, slab: *mut Slab) {
        let kind = unsafe { (*slab).kind() };
        debug_assert!(!matches!(kind, SlabKind::Free | SlabKind::Unmapped));

        let (mut start, mut pages) = unsafe { ((*slab).start(), (*slab).pages()) };

        if start.0 > 0 {
            let prev = ctx.map.find_slab(PageId(start.0 - 1));
            if !prev.is_null() && unsafe { (*prev).kind() } == SlabKind::Free {
                unsafe {
                    start = (*prev).start();
                    pages += (*prev).pages();
                    self.remove_free_run(prev);
                }
                ctx.meta.free_slab_record(prev);
            }
        }

        let next_id = PageId(unsafe { (*slab).end() }.0 + 1);
        if next_id < Self::heap_end_id(ctx.heap) {
            let next = ctx.map.find_slab(next_id);
            if !next.is_null() && unsafe { (*next).kind() } == SlabKind::Free {
                unsafe {
                    pages += (*next).pages();
                    self.remove_free_run(next);
                }
                ctx.meta.free_slab_record(next);
            }
        }

        self.free_region(ctx, slab, start, pages);
    }

    /// Grows or shrinks `slab` in place to `new_pages`. Growth absorbs the
    /// next-adjacent free slab, and when the slab (or that free run) ends
    /// the mapped region, extends the region for the difference. Shrinking
    /// frees the tail (and may fail only if no record is available to
    /// describe it).
    pub fn resize<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        slab: *mut Slab,
        new_pages: u32,
    ) -> bool {
        debug_assert!(new_pages > 0);
        let (start, cur) = unsafe { ((*slab).start(), (*slab).pages()) };
        if new_pages == cur {
            return true;
        }

        if new_pages < cur {
            let rec = ctx.meta.alloc_slab_record();
            if rec.is_null() {
                return false;
            }
            let mut tail_pages = cur - new_pages;

            // The freed tail may touch a free run on its right.
            let next_id = PageId(start.0 + cur);
            if next_id < Self::heap_end_id(ctx.heap) {
                let next = ctx.map.find_slab(next_id);
                if !next.is_null() && unsafe { (*next).kind() } == SlabKind::Free {
                    unsafe {
                        tail_pages += (*next).pages();
                        self.remove_free_run(next);
                    }
                    ctx.meta.free_slab_record(next);
                }
            }

            unsafe { (*slab).set_extent(start, new_pages) };
            self.free_region(ctx, rec, PageId(start.0 + new_pages), tail_pages);
            return true;
        }

        let needed = new_pages - cur;
        let next_id = PageId(start.0 + cur);
        let heap_end = Self::heap_end_id(ctx.heap);

        // A free run too small to cover the growth, but one that reaches
        // the region end, can still be absorbed with an extension.
        let mut absorbed: *mut Slab = ptr::null_mut();
        if next_id < heap_end {
            let next = ctx.map.find_slab(next_id);
            if next.is_null() || unsafe { (*next).kind() } != SlabKind::Free {
                return false;
            }
            let next_pages = unsafe { (*next).pages() };
            if next_pages >= needed {
                unsafe { self.remove_free_run(next) };
                if next_pages == needed {
                    ctx.meta.free_slab_record(next);
                } else {
                    // The leftover keeps the neighbor's record.
                    self.free_region(
                        ctx,
                        next,
                        PageId(next_id.0 + needed),
                        next_pages - needed,
                    );
                }
                unsafe { (*slab).set_extent(start, new_pages) };
                ctx.map
                    .insert_range(next_id, PageId(start.0 + new_pages - 1), slab, None);
                return true;
            }
            if next_id.0 + next_pages != heap_end.0 {
                return false;
            }
            absorbed = next;
        }

        // The slab (plus any trailing free run) ends the region: extend it
        // for the difference. Nothing is claimed until the extension is
        // certain, so failures only need the fresh map path undone.
        let grow_end = PageId(start.0 + new_pages - 1);
        if grow_end.0 >= MAX_PAGES {
            return false;
        }
        if !ctx.map.allocate_path(ctx.meta, heap_end, grow_end) {
            return false;
        }
        let absorbed_pages = if absorbed.is_null() {
            0
        } else {
            unsafe { (*absorbed).pages() }
        };
        let required = ((needed - absorbed_pages) as usize) << PAGE_SHIFT;
        if ctx.heap.sbrk(required).is_none() {
            log::debug!("region extension of {} bytes refused", required);
            ctx.map.deallocate_path(heap_end, grow_end);
            return false;
        }
        if !absorbed.is_null() {
            unsafe { self.remove_free_run(absorbed) };
            ctx.meta.free_slab_record(absorbed);
        }
        unsafe { (*slab).set_extent(start, new_pages) };
        ctx.map.insert_range(next_id, grow_end, slab, None);
        true
    }

    /// Finds (or maps) a run of `n_pages`, returning its start and a record
    /// for it. The record is in an unspecified mapped-or-unmapped state;
    /// the caller initializes it and fills the map range.
    fn alloc_run<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        n_pages: u32,
    ) -> Option<(PageId, *mut Slab)> {
        if let Some(hit) = self.alloc_run_from_free(ctx, n_pages) {
            return Some(hit);
        }
        self.alloc_run_with_sbrk(ctx, n_pages)
    }

    fn alloc_run_from_free<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        n_pages: u32,
    ) -> Option<(PageId, *mut Slab)> {
        if n_pages == 1 {
            if let Some(node) = unsafe { self.single_page_free.pop_front() } {
                let id = self.page_id(node.cast());
                let slab = ctx.map.find_slab(id);
                debug_assert!(!slab.is_null());
                return Some((id, slab));
            }
        }

        if self.smallest_run.is_null() {
            return None;
        }
        // The cached minimum has at least two pages, so it fits any request
        // up to two pages without a tree descent.
        let run = if n_pages <= 2 {
            self.smallest_run
        } else {
            let hit = unsafe {
                self.multi_page_free
                    .lower_bound(|n| unsafe { run_pages(n) >= n_pages })
            };
            if hit.is_null() {
                return None;
            }
            hit.cast::<FreeRun>()
        };

        let actual = unsafe { (*run).pages };
        debug_assert!(actual >= n_pages);
        unsafe { self.remove_multi_run(run) };

        let id = self.page_id(run.cast());
        let slab = ctx.map.find_slab(id);
        debug_assert!(!slab.is_null());

        if actual > n_pages {
            // Put the remainder back. It cannot touch another free run:
            // this region was free, so its neighbors are not.
            let rec = ctx.meta.alloc_slab_record();
            if rec.is_null() {
                // Roll back: reinsert the run untouched.
                self.insert_free_run_structures(id, actual);
                return None;
            }
            self.free_region(ctx, rec, PageId(id.0 + n_pages), actual - n_pages);
        }
        Some((id, slab))
    }

    fn alloc_run_with_sbrk<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        n_pages: u32,
    ) -> Option<(PageId, *mut Slab)> {
        let heap_end = Self::heap_end_id(ctx.heap);
        let mut required = (n_pages as usize) << PAGE_SHIFT;
        let mut start = heap_end;
        let mut absorbed: *mut Slab = ptr::null_mut();

        // Absorb a free run at the end of the region so only the difference
        // gets mapped.
        if heap_end.0 > 0 {
            let last = ctx.map.find_slab(PageId(heap_end.0 - 1));
            if !last.is_null() && unsafe { (*last).kind() } == SlabKind::Free {
                // A trailing run at least as large as the request means the
                // free-structure pass failed for lack of a record, not for
                // lack of pages; extending cannot help.
                if unsafe { (*last).pages() } >= n_pages {
                    return None;
                }
                unsafe {
                    start = (*last).start();
                    required -= ((*last).pages() as usize) << PAGE_SHIFT;
                    self.remove_free_run(last);
                }
                absorbed = last;
            }
        }

        let slab = if absorbed.is_null() {
            let rec = ctx.meta.alloc_slab_record();
            if rec.is_null() {
                return None;
            }
            rec
        } else {
            absorbed
        };

        let end = PageId(start.0 + n_pages - 1);
        if end.0 >= MAX_PAGES {
            self.rollback_sbrk_claim(ctx, absorbed, slab);
            return None;
        }

        // Allocate the map path for the fresh pages before extending, so a
        // path failure needs no region rollback. The absorbed prefix is
        // already path-allocated.
        if !ctx.map.allocate_path(ctx.meta, heap_end, end) {
            self.rollback_sbrk_claim(ctx, absorbed, slab);
            return None;
        }

        if ctx.heap.sbrk(required).is_none() {
            log::debug!("region extension of {} bytes refused", required);
            ctx.map.deallocate_path(heap_end, end);
            self.rollback_sbrk_claim(ctx, absorbed, slab);
            return None;
        }

        Some((start, slab))
    }

    fn rollback_sbrk_claim<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        absorbed: *mut Slab,
        record: *mut Slab,
    ) {
        if absorbed.is_null() {
            ctx.meta.free_slab_record(record);
        } else {
            // Reinsert the trailing free run we claimed.
            let (start, pages) = unsafe { ((*absorbed).start(), (*absorbed).pages()) };
            self.insert_free_run_structures(start, pages);
        }
    }

    /// Initializes `record` as a free slab over the region and inserts it
    /// into the free structures and the map. Does not coalesce.
    fn free_region<H: RawHeap>(
        &mut self,
        ctx: &mut SlabCtx<H>,
        record: *mut Slab,
        start: PageId,
        pages: u32,
    ) {
        unsafe { (*record).init_free(start, pages) };
        // Free runs are only ever queried at their edges.
        ctx.map.insert(start, record, None);
        ctx.map.insert(PageId(start.0 + pages - 1), record, None);
        self.insert_free_run_structures(start, pages);
    }

    fn insert_free_run_structures(&mut self, start: PageId, pages: u32) {
        let page = self.page_start(start);
        if pages == 1 {
            let node = page.cast::<ListNode>();
            unsafe {
                ptr::write(node, ListNode::new());
                self.single_page_free.push_front(node);
            }
        } else {
            let run = page.cast::<FreeRun>();
            unsafe {
                ptr::write(
                    run,
                    FreeRun {
                        node: RbNode::new(),
                        pages,
                    },
                );
                self.insert_multi_run(run);
            }
        }
    }

    unsafe fn insert_multi_run(&mut self, run: *mut FreeRun) {
        self.multi_page_free.insert(&mut (*run).node, |a, b| unsafe {
            run_pages(a) < run_pages(b)
        });
        // Ties insert to the right, so a strict comparison keeps the cache
        // pointing at the leftmost minimal run.
        if self.smallest_run.is_null() || (*run).pages < (*self.smallest_run).pages {
            self.smallest_run = run;
        }
    }

    unsafe fn remove_multi_run(&mut self, run: *mut FreeRun) {
        if run == self.smallest_run {
            let next = RbTree::successor(&mut (*run).node);
            self.smallest_run = next.cast::<FreeRun>();
        }
        self.multi_page_free.remove(&mut (*run).node);
        debug_assert_eq!(self.smallest_run.is_null(), self.multi_page_free.is_empty());
    }

    /// Removes a free slab's in-page structures, given its record.
    unsafe fn remove_free_run(&mut self, slab: *mut Slab) {
        let start = (*slab).start();
        let page = self.page_start(start);
        if (*slab).pages() == 1 {
            self.single_page_free.remove(page.cast::<ListNode>());
        } else {
            self.remove_multi_run(page.cast::<FreeRun>());
        }
    }
}
