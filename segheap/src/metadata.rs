//! Metadata manager.
//!
//! Allocates all out-of-band allocator metadata (slab records, radix map
//! nodes) from a dedicated region the provider hands us, separate from the
//! user region. A bump pointer walks the current metadata page run; when a
//! request does not fit, a fresh run is mapped and the bump pointer
//! migrates to whichever run has more space left. Metadata memory is never
//! returned to the provider; freed slab records are pooled on a freelist
//! and reused.

use core::ptr;

use crate::layout::{align_up, is_aligned, PAGE_SHIFT, PAGE_SIZE};
use crate::slab::Slab;
use crate::sys::RawHeap;

pub struct MetadataManager<H: RawHeap> {
    region: H,
    /// Next free byte in the current metadata run.
    bump: *mut u8,
    /// Bytes left after `bump` in the current run.
    remaining: usize,
    /// Unmapped slab records, chained through their payload.
    free_records: *mut Slab,
}

impl<H: RawHeap> MetadataManager<H> {
    pub fn new(region: H) -> Self {
        Self {
            region,
            bump: ptr::null_mut(),
            remaining: 0,
            free_records: ptr::null_mut(),
        }
    }

    /// Total bytes reserved from the metadata region.
    pub fn reserved_bytes(&self) -> usize {
        self.region.size()
    }

    /// Allocates `size` bytes aligned to `align`. Returns null when the
    /// provider refuses to grow the metadata region. The memory cannot be
    /// freed.
    pub fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        debug_assert!(size > 0);

        let pad = align_up(self.bump as usize, align) - self.bump as usize;
        if pad + size <= self.remaining {
            let ptr = unsafe { self.bump.add(pad) };
            self.bump = unsafe { ptr.add(size) };
            self.remaining -= pad + size;
            return ptr;
        }

        // Current run exhausted for this request: map a fresh one. Runs are
        // page multiples, so any sub-page alignment holds at their start.
        let n_pages = (align_up(size, PAGE_SIZE)) >> PAGE_SHIFT;
        let run = match self.region.sbrk(n_pages << PAGE_SHIFT) {
            Some(run) => run,
            None => {
                log::warn!("metadata region exhausted ({} bytes requested)", size);
                return ptr::null_mut();
            }
        };
        debug_assert!(is_aligned(run as usize, PAGE_SIZE));

        // Keep bumping from whichever run has more room left over.
        let run_remaining = (n_pages << PAGE_SHIFT) - size;
        if run_remaining > self.remaining {
            self.bump = unsafe { run.add(size) };
            self.remaining = run_remaining;
        }

        run
    }

    /// Takes a slab record from the freelist, or carves a new one. The
    /// record comes back in the `Unmapped` state; the caller initializes it
    /// to its mapped state.
    pub fn alloc_slab_record(&mut self) -> *mut Slab {
        if !self.free_records.is_null() {
            let record = self.free_records;
            self.free_records = match unsafe { &*record } {
                Slab::Unmapped { next } => *next,
                _ => unreachable!("freelisted record not unmapped"),
            };
            return record;
        }
        let record = self
            .alloc(core::mem::size_of::<Slab>(), core::mem::align_of::<Slab>())
            .cast::<Slab>();
        if !record.is_null() {
            unsafe {
                ptr::write(
                    record,
                    Slab::Unmapped {
                        next: ptr::null_mut(),
                    },
                )
            };
        }
        record
    }

    /// Returns a record to the pool for reuse.
    pub fn free_slab_record(&mut self, record: *mut Slab) {
        unsafe { (*record).init_unmapped(self.free_records) };
        self.free_records = record;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PageId;
    use crate::sys::mock::MockHeap;

    fn manager(pages: usize) -> MetadataManager<MockHeap> {
        MetadataManager::new(MockHeap::new(pages * PAGE_SIZE).unwrap())
    }

    #[test]
    fn bump_allocations_are_disjoint() {
        let mut meta = manager(4);
        let a = meta.alloc(40, 8);
        let b = meta.alloc(40, 8);
        let c = meta.alloc(16, 16);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert!(b as usize >= a as usize + 40);
        assert!(c as usize >= b as usize + 40);
        assert!(is_aligned(c as usize, 16));
    }

    #[test]
    fn large_requests_get_their_own_run() {
        let mut meta = manager(8);
        let small = meta.alloc(64, 8);
        let big = meta.alloc(2 * PAGE_SIZE, 8);
        assert!(!small.is_null() && !big.is_null());
        assert!(is_aligned(big as usize, PAGE_SIZE));
        assert_eq!(meta.reserved_bytes(), 3 * PAGE_SIZE);
    }

    #[test]
    fn bump_migrates_to_roomier_run() {
        let mut meta = manager(8);
        // Nearly fill the first page.
        assert!(!meta.alloc(PAGE_SIZE - 64, 8).is_null());
        // Does not fit: a fresh page is mapped with far more room left, so
        // subsequent small allocations come from it.
        let big = meta.alloc(128, 8);
        let after = meta.alloc(8, 8);
        assert_eq!(after as usize, big as usize + 128);
    }

    #[test]
    fn record_freelist_reuses_memory() {
        let mut meta = manager(2);
        let a = meta.alloc_slab_record();
        let b = meta.alloc_slab_record();
        assert!(!a.is_null() && !b.is_null());
        unsafe {
            (*a).init_free(PageId(0), 1);
            (*b).init_free(PageId(1), 1);
        }
        meta.free_slab_record(a);
        meta.free_slab_record(b);
        // LIFO reuse.
        assert_eq!(meta.alloc_slab_record(), b);
        assert_eq!(meta.alloc_slab_record(), a);
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut meta = manager(1);
        assert!(!meta.alloc(PAGE_SIZE, 8).is_null());
        assert!(meta.alloc(16, 8).is_null());
    }
}
