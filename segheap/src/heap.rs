//! The heap: public allocator surface and main dispatcher.
//!
//! `Heap` wraps the whole core (user region, slab map, slab manager,
//! metadata manager, small and large allocators) behind one spin lock,
//! initialized lazily on first use. Requests route by size on the way in
//! and by owning-slab type (from the slab map) on the way out:
//!
//!   malloc -> small (<= 128 B) or large
//!   free/realloc -> look up the page's slab, dispatch on its kind
//!
//! `malloc(0)` returns null, `free(null)` is a no-op, `realloc` treats a
//! null pointer as malloc and size zero as free. Failures of any kind
//! surface as null; partially applied work is rolled back first.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::layout::{
    align_down, PageId, DEFAULT_ALIGN, MAX_HEAP_SIZE, MAX_SMALL_SIZE, MIN_ALIGN, PAGE_SHIFT,
    PAGE_SIZE,
};
use crate::large::LargeAllocator;
use crate::metadata::MetadataManager;
use crate::size_class::SizeClass;
use crate::slab::SlabKind;
use crate::slab_manager::{SlabCtx, SlabManager};
use crate::slab_map::SlabMap;
use crate::small::SmallAllocator;
use crate::sys::{HeapSource, RawHeap};

/// Cap on the dedicated metadata region. Slab records and radix nodes for
/// a fully mapped 512 MiB user region fit with ample slack.
const META_REGION_SIZE: usize = 1 << 25;

pub struct Heap<P: HeapSource> {
    state: Mutex<HeapState<P>>,
    user_cap: usize,
}

enum HeapState<P: HeapSource> {
    /// Provider parked until the first allocation.
    Uninit(Option<P>),
    Ready(Core<P::Heap>),
}

impl<P: HeapSource> Heap<P> {
    /// A heap over `source`, capped at the architecture limit of 512 MiB.
    /// Regions are only requested from the provider on first use.
    pub const fn new(source: P) -> Self {
        Self::with_max_size(source, MAX_HEAP_SIZE)
    }

    /// A heap whose user region is capped at `max_size` bytes (rounded
    /// down to a page multiple, clamped to 512 MiB).
    pub const fn with_max_size(source: P, max_size: usize) -> Self {
        let cap = if max_size > MAX_HEAP_SIZE {
            MAX_HEAP_SIZE
        } else {
            align_down(max_size, PAGE_SIZE)
        };
        Self {
            state: Mutex::new(HeapState::Uninit(Some(source))),
            user_cap: cap,
        }
    }

    /// Allocates `size` bytes, aligned to 8 for requests of up to 8 bytes
    /// and to 16 beyond that. Null on failure; `malloc(0)` is null.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        self.with_core(|core| core.alloc(size))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Zero-filled allocation of `nmemb * size` bytes.
    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        let total = match nmemb.checked_mul(size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Resizes the allocation at `ptr` to `size` bytes, preserving the
    /// leading `min(old, new)` bytes. Null `ptr` behaves as `malloc`;
    /// `size == 0` frees and returns null. On failure the original
    /// allocation is untouched.
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.malloc(size);
        };
        if size == 0 {
            self.free(ptr.as_ptr());
            return ptr::null_mut();
        }
        self.with_core(|core| core.realloc(ptr, size))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocation aligned to `alignment` (a power of two).
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        if size == 0 || !alignment.is_power_of_two() || alignment > MAX_HEAP_SIZE {
            return ptr::null_mut();
        }
        if alignment <= MIN_ALIGN {
            return self.malloc(size);
        }

        // Small sizes with modest alignments ride a promoted size class:
        // slices of a class divisible by the alignment are themselves
        // aligned.
        if size <= MAX_SMALL_SIZE && alignment <= MAX_SMALL_SIZE {
            if let Some(class) = SizeClass::from_user_size_aligned(size, alignment) {
                return self
                    .with_core(|core| core.alloc_small_class(class))
                    .flatten()
                    .map_or(ptr::null_mut(), NonNull::as_ptr);
            }
        }

        if alignment <= DEFAULT_ALIGN {
            return self.malloc(size);
        }

        // Everything else takes a page-aligned slab of its own; coarser
        // than a page means an aligned carve.
        let align_pages = if alignment <= PAGE_SIZE {
            1
        } else {
            (alignment >> PAGE_SHIFT) as u32
        };
        self.with_core(|core| core.alloc_single(size, align_pages))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Frees the allocation at `ptr`. Null is a no-op. Freeing a pointer
    /// this heap does not own is undefined (checked in debug builds).
    pub fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        self.with_core(|core| core.free(ptr));
    }

    /// `free` with a size hint from the caller. The hint must match the
    /// allocation (checked in debug builds).
    pub fn free_sized(&self, ptr: *mut u8, size: usize) {
        debug_assert!(
            ptr.is_null() || size <= self.usable_size(ptr),
            "free_sized hint exceeds allocation"
        );
        self.free(ptr);
    }

    /// `free` with size and alignment hints from the caller.
    pub fn free_aligned_sized(&self, ptr: *mut u8, alignment: usize, size: usize) {
        debug_assert!(
            ptr.is_null() || ptr as usize % alignment == 0,
            "free_aligned_sized alignment hint mismatch"
        );
        self.free_sized(ptr, size);
    }

    /// Rounded-up size of the allocation at `ptr`; 0 for null.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        let Some(ptr) = NonNull::new(ptr) else {
            return 0;
        };
        self.with_core(|core| core.usable_size(ptr)).unwrap_or(0)
    }

    /// Counters gathered by walking the slab universe.
    pub fn stats(&self) -> HeapStats {
        self.with_core(Core::stats).unwrap_or_default()
    }

    /// Size class of the small allocation at `ptr`, if it is one. Used by
    /// the per-thread cache to bin freed slices without touching them.
    pub(crate) fn size_class_of(&self, ptr: NonNull<u8>) -> Option<SizeClass> {
        self.with_core(|core| core.size_class_of(ptr)).flatten()
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core<P::Heap>) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if let HeapState::Uninit(source) = &mut *state {
            let mut source = source.take()?;
            match Core::init(&mut source, self.user_cap) {
                Some(core) => *state = HeapState::Ready(core),
                None => {
                    // Leave the provider in place so a later call retries.
                    *state = HeapState::Uninit(Some(source));
                    return None;
                }
            }
        }
        match &mut *state {
            HeapState::Ready(core) => Some(f(core)),
            HeapState::Uninit(_) => None,
        }
    }
}

unsafe impl<P: HeapSource> GlobalAlloc for Heap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DEFAULT_ALIGN {
            self.aligned_alloc(layout.align(), layout.size())
        } else {
            self.malloc(layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.free_sized(ptr, layout.size());
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= DEFAULT_ALIGN {
            return Heap::realloc(self, ptr, new_size);
        }
        // Over-aligned reallocation: the move path must re-establish the
        // alignment, so do alloc-copy-free by hand.
        let new_ptr = self.aligned_alloc(layout.align(), new_size);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.free(ptr);
        }
        new_ptr
    }
}

/// Point-in-time allocator counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Pages mapped in the user region.
    pub heap_pages: u32,
    /// Pages sitting in free slabs.
    pub free_pages: u32,
    pub small_slabs: u32,
    pub blocked_slabs: u32,
    pub single_alloc_slabs: u32,
    /// Bytes held by live allocations, including block headers.
    pub allocated_bytes: u64,
    /// Bytes reserved for allocator metadata (never returned).
    pub metadata_bytes: usize,
}

pub(crate) struct Core<H: RawHeap> {
    heap: H,
    map: SlabMap,
    meta: MetadataManager<H>,
    mgr: SlabManager,
    small: SmallAllocator,
    large: LargeAllocator,
}

unsafe impl<H: RawHeap + Send> Send for Core<H> {}

impl<H: RawHeap> Core<H> {
    fn init<P: HeapSource<Heap = H>>(source: &mut P, user_cap: usize) -> Option<Self> {
        let user = match source.new_heap(user_cap) {
            Ok(heap) => heap,
            Err(err) => {
                log::warn!("user region unavailable: {}", err);
                return None;
            }
        };
        let meta_region = match source.new_heap(META_REGION_SIZE.min(user_cap)) {
            Ok(heap) => heap,
            Err(err) => {
                log::warn!("metadata region unavailable: {}", err);
                return None;
            }
        };
        log::debug!(
            "heap online: user region {:p} ({} pages max)",
            user.start(),
            user.max_size() >> PAGE_SHIFT
        );
        Some(Core {
            mgr: SlabManager::new(user.start()),
            map: SlabMap::new(),
            meta: MetadataManager::new(meta_region),
            small: SmallAllocator::new(),
            large: LargeAllocator::new(),
            heap: user,
        })
    }

    fn alloc(&mut self, user_size: usize) -> Option<NonNull<u8>> {
        // Nothing beyond the region cap can ever be satisfied; fail before
        // any size arithmetic can wrap.
        if user_size > MAX_HEAP_SIZE {
            return None;
        }
        let Core {
            heap,
            map,
            meta,
            mgr,
            small,
            large,
        } = self;
        let mut ctx = SlabCtx { heap, map, meta };
        if user_size <= MAX_SMALL_SIZE {
            small.alloc(mgr, &mut ctx, user_size)
        } else {
            large.alloc(mgr, &mut ctx, user_size)
        }
    }

    fn alloc_small_class(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let Core {
            heap,
            map,
            meta,
            mgr,
            small,
            ..
        } = self;
        let mut ctx = SlabCtx { heap, map, meta };
        small.alloc_class(mgr, &mut ctx, class)
    }

    fn alloc_single(&mut self, user_size: usize, align_pages: u32) -> Option<NonNull<u8>> {
        let Core {
            heap,
            map,
            meta,
            mgr,
            large,
            ..
        } = self;
        let mut ctx = SlabCtx { heap, map, meta };
        large.alloc_single(mgr, &mut ctx, user_size, align_pages)
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        let Core {
            heap,
            map,
            meta,
            mgr,
            small,
            large,
        } = self;
        let slab = map.find_slab(mgr.page_id(ptr.as_ptr()));
        debug_assert!(!slab.is_null(), "free of pointer outside any slab");
        if slab.is_null() {
            return;
        }
        let mut ctx = SlabCtx { heap, map, meta };
        match unsafe { (*slab).kind() } {
            SlabKind::Small => small.free(mgr, &mut ctx, slab, ptr),
            SlabKind::Blocked | SlabKind::SingleAlloc => large.free(mgr, &mut ctx, slab, ptr),
            SlabKind::Free | SlabKind::Unmapped => {
                debug_assert!(false, "free of unallocated pointer");
            }
        }
    }

    fn realloc(&mut self, ptr: NonNull<u8>, user_size: usize) -> Option<NonNull<u8>> {
        if user_size > MAX_HEAP_SIZE {
            return None;
        }
        let Core {
            heap,
            map,
            meta,
            mgr,
            small,
            large,
        } = self;
        let slab = map.find_slab(mgr.page_id(ptr.as_ptr()));
        debug_assert!(!slab.is_null(), "realloc of pointer outside any slab");
        if slab.is_null() {
            return None;
        }
        let mut ctx = SlabCtx { heap, map, meta };

        match unsafe { (*slab).kind() } {
            SlabKind::Small => {
                if user_size <= MAX_SMALL_SIZE {
                    return small.realloc(mgr, &mut ctx, slab, ptr, user_size);
                }
                // Small to large: the slice is always smaller than the new
                // region, so the whole slice is copied.
                let new_ptr = large.alloc(mgr, &mut ctx, user_size)?;
                unsafe {
                    let old_len = (*slab).class().slice_size();
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_len);
                }
                small.free(mgr, &mut ctx, slab, ptr);
                Some(new_ptr)
            }
            SlabKind::Blocked | SlabKind::SingleAlloc => {
                if user_size > MAX_SMALL_SIZE {
                    return large.realloc(mgr, &mut ctx, slab, ptr, user_size);
                }
                // Large to small: the new slice holds `user_size` bytes,
                // always fewer than the old region held.
                let new_ptr = small.alloc(mgr, &mut ctx, user_size)?;
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), user_size);
                }
                large.free(mgr, &mut ctx, slab, ptr);
                Some(new_ptr)
            }
            SlabKind::Free | SlabKind::Unmapped => {
                debug_assert!(false, "realloc of unallocated pointer");
                None
            }
        }
    }

    fn usable_size(&mut self, ptr: NonNull<u8>) -> usize {
        let slab = self.map.find_slab(self.mgr.page_id(ptr.as_ptr()));
        debug_assert!(!slab.is_null());
        if slab.is_null() {
            return 0;
        }
        match unsafe { (*slab).kind() } {
            SlabKind::Small => unsafe { (*slab).class().slice_size() },
            SlabKind::Blocked | SlabKind::SingleAlloc => self.large.usable_size(slab, ptr),
            SlabKind::Free | SlabKind::Unmapped => 0,
        }
    }

    fn size_class_of(&mut self, ptr: NonNull<u8>) -> Option<SizeClass> {
        let id = self.mgr.page_id(ptr.as_ptr());
        let slab = self.map.find_slab(id);
        if slab.is_null() {
            return None;
        }
        match unsafe { (*slab).kind() } {
            SlabKind::Small => {
                let class = self.map.find_size_class(id);
                debug_assert!(!class.is_nil());
                Some(class)
            }
            _ => None,
        }
    }

    /// Base address of the user region.
    #[cfg(test)]
    pub(crate) fn region_base(&self) -> *mut u8 {
        self.heap.start()
    }

    /// Asserts the cross-slab invariants over the whole region: full page
    /// coverage, extents consistent with the map, no two adjacent free
    /// slabs, and every blocked slab internally consistent.
    #[cfg(test)]
    pub(crate) fn check_invariants(&mut self) {
        let heap_pages = (self.heap.size() >> PAGE_SHIFT) as u32;
        let mut id = PageId(0);
        let mut prev_was_free = false;
        while id.0 < heap_pages {
            let slab = self.map.find_slab(id);
            assert!(!slab.is_null(), "page {} not mapped to a slab", id.0);
            let (kind, start, pages) =
                unsafe { ((*slab).kind(), (*slab).start(), (*slab).pages()) };
            assert_eq!(start, id, "slab extent does not begin where found");
            assert!(pages > 0 && id.0 + pages <= heap_pages);

            match kind {
                SlabKind::Free => {
                    assert!(!prev_was_free, "adjacent free slabs");
                    prev_was_free = true;
                }
                SlabKind::Blocked => {
                    LargeAllocator::check_blocked_slab(&self.mgr, slab);
                    prev_was_free = false;
                }
                SlabKind::Small | SlabKind::SingleAlloc => prev_was_free = false,
                SlabKind::Unmapped => unreachable!("unmapped slab in the map"),
            }
            id = PageId(id.0 + pages);
        }
    }

    /// Walks the slab universe front to back. Every page belongs to
    /// exactly one slab, so hopping by each slab's page count covers the
    /// region.
    fn stats(&mut self) -> HeapStats {
        let mut stats = HeapStats {
            heap_pages: (self.heap.size() >> PAGE_SHIFT) as u32,
            metadata_bytes: self.meta.reserved_bytes(),
            ..HeapStats::default()
        };

        let mut id = PageId(0);
        while id.0 < stats.heap_pages {
            let slab = self.map.find_slab(id);
            debug_assert!(!slab.is_null(), "unmapped page {} inside heap", id.0);
            if slab.is_null() {
                break;
            }
            let (kind, pages) = unsafe { ((*slab).kind(), (*slab).pages()) };
            match kind {
                SlabKind::Free => stats.free_pages += pages,
                SlabKind::Small => {
                    stats.small_slabs += 1;
                    stats.allocated_bytes += unsafe {
                        (*slab).allocated_slices() as u64 * (*slab).class().slice_size() as u64
                    };
                }
                SlabKind::Blocked => {
                    stats.blocked_slabs += 1;
                    stats.allocated_bytes += unsafe { (*slab).allocated_bytes() };
                }
                SlabKind::SingleAlloc => {
                    stats.single_alloc_slabs += 1;
                    stats.allocated_bytes += (pages as u64) << PAGE_SHIFT;
                }
                SlabKind::Unmapped => unreachable!("unmapped slab in the map"),
            }
            id = PageId(id.0 + pages);
        }
        stats
    }
}
