//! Out-of-band slab metadata records.
//!
//! Every record is one `Slab` value living in the metadata region, never in
//! the pages it describes. A record is born `Unmapped` (on the metadata
//! manager's freelist), becomes one of the mapped states when a page run is
//! allocated, moves to `Free` when the run is freed, and returns to
//! `Unmapped` when the run is coalesced away. Rust enums give all variants
//! one size, which is what lets records be pooled and reused in place.

use crate::layout::PageId;
use crate::size_class::{SizeClass, SliceId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlabKind {
    Unmapped,
    Free,
    Small,
    Blocked,
    SingleAlloc,
}

pub enum Slab {
    /// Record on the metadata freelist; describes no pages.
    Unmapped { next: *mut Slab },

    /// A coalescable free page run held in the slab manager's structures.
    Free { start: PageId, pages: u32 },

    /// Pages split into equal slices of one size class. `free_head` tops the
    /// intrusive free-slice stack inside the page; the partial links thread
    /// this slab into its class's list of non-full slabs.
    Small {
        start: PageId,
        pages: u32,
        class: SizeClass,
        free_head: SliceId,
        allocated: u32,
        next_partial: PageId,
        prev_partial: PageId,
    },

    /// Pages holding a sequence of boundary-tagged blocks.
    Blocked {
        start: PageId,
        pages: u32,
        allocated_bytes: u64,
    },

    /// The whole page run is a single user allocation.
    SingleAlloc { start: PageId, pages: u32 },
}

impl Slab {
    pub fn kind(&self) -> SlabKind {
        match self {
            Slab::Unmapped { .. } => SlabKind::Unmapped,
            Slab::Free { .. } => SlabKind::Free,
            Slab::Small { .. } => SlabKind::Small,
            Slab::Blocked { .. } => SlabKind::Blocked,
            Slab::SingleAlloc { .. } => SlabKind::SingleAlloc,
        }
    }

    /// First page of the described run. Not meaningful for `Unmapped`.
    pub fn start(&self) -> PageId {
        match self {
            Slab::Free { start, .. }
            | Slab::Small { start, .. }
            | Slab::Blocked { start, .. }
            | Slab::SingleAlloc { start, .. } => *start,
            Slab::Unmapped { .. } => unreachable!("unmapped slab has no extent"),
        }
    }

    pub fn pages(&self) -> u32 {
        match self {
            Slab::Free { pages, .. }
            | Slab::Small { pages, .. }
            | Slab::Blocked { pages, .. }
            | Slab::SingleAlloc { pages, .. } => *pages,
            Slab::Unmapped { .. } => unreachable!("unmapped slab has no extent"),
        }
    }

    /// Last page of the described run.
    pub fn end(&self) -> PageId {
        PageId(self.start().0 + self.pages() - 1)
    }

    /// Rewrites the extent in place, preserving the variant's other fields.
    pub fn set_extent(&mut self, new_start: PageId, new_pages: u32) {
        match self {
            Slab::Free { start, pages }
            | Slab::Small { start, pages, .. }
            | Slab::Blocked { start, pages, .. }
            | Slab::SingleAlloc { start, pages } => {
                *start = new_start;
                *pages = new_pages;
            }
            Slab::Unmapped { .. } => unreachable!("unmapped slab has no extent"),
        }
    }

    // ---- Small accessors ----

    pub fn class(&self) -> SizeClass {
        match self {
            Slab::Small { class, .. } => *class,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn free_head(&self) -> SliceId {
        match self {
            Slab::Small { free_head, .. } => *free_head,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn set_free_head(&mut self, id: SliceId) {
        match self {
            Slab::Small { free_head, .. } => *free_head = id,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn allocated_slices(&self) -> u32 {
        match self {
            Slab::Small { allocated, .. } => *allocated,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn add_slice(&mut self) {
        match self {
            Slab::Small { allocated, .. } => *allocated += 1,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn remove_slice(&mut self) {
        match self {
            Slab::Small { allocated, .. } => {
                debug_assert!(*allocated > 0);
                *allocated -= 1;
            }
            _ => unreachable!("not a small slab"),
        }
    }

    /// No free slices left.
    pub fn is_full(&self) -> bool {
        self.free_head().is_nil()
    }

    /// Every slice is free.
    pub fn is_empty(&self) -> bool {
        self.allocated_slices() == 0
    }

    pub fn next_partial(&self) -> PageId {
        match self {
            Slab::Small { next_partial, .. } => *next_partial,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn prev_partial(&self) -> PageId {
        match self {
            Slab::Small { prev_partial, .. } => *prev_partial,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn set_next_partial(&mut self, id: PageId) {
        match self {
            Slab::Small { next_partial, .. } => *next_partial = id,
            _ => unreachable!("not a small slab"),
        }
    }

    pub fn set_prev_partial(&mut self, id: PageId) {
        match self {
            Slab::Small { prev_partial, .. } => *prev_partial = id,
            _ => unreachable!("not a small slab"),
        }
    }

    // ---- Blocked accessors ----

    pub fn allocated_bytes(&self) -> u64 {
        match self {
            Slab::Blocked {
                allocated_bytes, ..
            } => *allocated_bytes,
            _ => unreachable!("not a blocked slab"),
        }
    }

    pub fn add_allocation(&mut self, bytes: u64) {
        match self {
            Slab::Blocked {
                allocated_bytes, ..
            } => *allocated_bytes += bytes,
            _ => unreachable!("not a blocked slab"),
        }
    }

    pub fn remove_allocation(&mut self, bytes: u64) {
        match self {
            Slab::Blocked {
                allocated_bytes, ..
            } => {
                debug_assert!(*allocated_bytes >= bytes);
                *allocated_bytes -= bytes;
            }
            _ => unreachable!("not a blocked slab"),
        }
    }

    // ---- Initializers (records are reused in place) ----

    pub fn init_unmapped(&mut self, next: *mut Slab) {
        *self = Slab::Unmapped { next };
    }

    pub fn init_free(&mut self, start: PageId, pages: u32) {
        *self = Slab::Free { start, pages };
    }

    pub fn init_small(&mut self, start: PageId, pages: u32, class: SizeClass) {
        *self = Slab::Small {
            start,
            pages,
            class,
            free_head: SliceId::NIL,
            allocated: 0,
            next_partial: PageId::NIL,
            prev_partial: PageId::NIL,
        };
    }

    pub fn init_blocked(&mut self, start: PageId, pages: u32) {
        *self = Slab::Blocked {
            start,
            pages,
            allocated_bytes: 0,
        };
    }

    pub fn init_single_alloc(&mut self, start: PageId, pages: u32) {
        *self = Slab::SingleAlloc { start, pages };
    }
}

// Records are pooled with a fixed stride; keep the variant payloads lean.
static_assertions::const_assert!(core::mem::size_of::<Slab>() <= 40);

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;

    #[test]
    fn lifecycle_transitions() {
        let mut slab = Slab::Unmapped {
            next: ptr::null_mut(),
        };
        assert_eq!(slab.kind(), SlabKind::Unmapped);

        slab.init_small(PageId(4), 1, SizeClass::from_user_size(64));
        assert_eq!(slab.kind(), SlabKind::Small);
        assert_eq!(slab.start(), PageId(4));
        assert_eq!(slab.pages(), 1);
        assert_eq!(slab.end(), PageId(4));
        assert!(slab.is_empty());
        assert!(slab.is_full()); // free stack not built yet

        slab.init_free(PageId(4), 3);
        assert_eq!(slab.kind(), SlabKind::Free);
        assert_eq!(slab.end(), PageId(6));

        slab.init_unmapped(ptr::null_mut());
        assert_eq!(slab.kind(), SlabKind::Unmapped);
    }

    #[test]
    fn blocked_counter() {
        let mut slab = Slab::Unmapped {
            next: ptr::null_mut(),
        };
        slab.init_blocked(PageId(0), 2);
        assert_eq!(slab.allocated_bytes(), 0);
        slab.add_allocation(1040);
        slab.add_allocation(48);
        slab.remove_allocation(1040);
        assert_eq!(slab.allocated_bytes(), 48);
    }

    #[test]
    fn extent_rewrite() {
        let mut slab = Slab::Unmapped {
            next: ptr::null_mut(),
        };
        slab.init_single_alloc(PageId(10), 8);
        slab.set_extent(PageId(12), 6);
        assert_eq!(slab.start(), PageId(12));
        assert_eq!(slab.pages(), 6);
    }
}
