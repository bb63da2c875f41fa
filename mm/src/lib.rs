#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod buddy;
pub mod buddy_tests;
pub mod error;
pub mod frame;
pub mod heap;
pub mod hhdm;
pub mod memmap;
pub mod paging;
pub mod paging_tests;
pub mod tlb;

pub use buddy::{BuddyAlloc, BuddyNode};
pub use error::MemError;
pub use frame::{alloc_page_frame, alloc_page_frame_zeroed, free_page_frame};
pub use heap::HeapAllocator;
pub use memmap::{FixedMemoryRange, MemoryMap};
pub use paging::defs::{Access, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB, PageFlags};
pub use paging::mapping::Mapping;
