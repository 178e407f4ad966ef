// ============================================================================
// IOVA allocation primitives: bitmap (C1), buddy allocator (C2), interval
// (red-black) allocator (C3), page table (C4), and the address space (C5)
// that combines all four.
// ============================================================================
pub mod address_space;
pub mod bitmap;
pub mod buddy_allocator;
pub mod interval_allocator;
pub mod page_table;

pub use address_space::{AddressSpace, AllocOptions, AllocSpec, DomainIdAllocator};
pub use bitmap::Bitmap;
pub use buddy_allocator::BuddyAllocator;
pub use interval_allocator::IntervalAllocator;
pub use page_table::{PageTable, Pte};
