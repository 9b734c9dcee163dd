//! System heap provider seam.
//!
//! The allocator consumes raw, page-aligned memory regions from a provider
//! it does not own the implementation of. A region starts empty and grows
//! monotonically by `sbrk`; it is released as a whole when dropped, and its
//! base address never changes for its lifetime.

use crate::error::AllocError;

/// A single growable memory region.
pub trait RawHeap {
    /// Base of the region. Page-aligned and stable for the region's life.
    fn start(&self) -> *mut u8;

    /// Bytes mapped so far (the current break minus the base).
    fn size(&self) -> usize;

    /// Upper bound the region may grow to.
    fn max_size(&self) -> usize;

    /// Grows the region by `increment` bytes (a multiple of the region
    /// granularity). Returns a pointer to the start of the newly mapped
    /// memory (the old break), or `None` when the provider refuses.
    fn sbrk(&mut self, increment: usize) -> Option<*mut u8>;

    /// One past the last mapped byte.
    fn end(&self) -> *mut u8 {
        unsafe { self.start().add(self.size()) }
    }
}

/// Hands out regions. The allocator asks for two: the user region and a
/// dedicated metadata region.
pub trait HeapSource {
    type Heap: RawHeap;

    fn new_heap(&mut self, max_size: usize) -> Result<Self::Heap, AllocError>;
}

#[cfg(any(test, feature = "mock-heap"))]
pub mod mock;
