//! Intrusive data structures shared by the allocator's indices.
//!
//! All nodes live inside the memory they organize (slab pages, free block
//! bodies); nothing here allocates. Links are raw pointers, valid for as
//! long as the owning structure says they are.

pub mod bitset;
pub mod list;
pub mod rbtree;

pub use bitset::BitSet;
pub use list::{List, ListNode};
pub use rbtree::{RbNode, RbTree};
