//! Layout constants shared by the page allocator, the object allocator and the
//! side tables. Changing any of these changes the in-memory page layout.

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Log2 of [`PAGE_SIZE`]. Page lookup from any interior address is a mask with
/// this many low bits cleared.
pub const PAGE_SIZE_LOG2: usize = 18;
/// Size of a single normal page including both guard pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;
pub const PAGE_BASE_MASK: usize = !PAGE_OFFSET_MASK;

/// Inaccessible memory at the start and at the end of every page.
pub const GUARD_PAGE_SIZE: usize = 4 * KB;

/// Huge OS pages are carved into [`PAGES_PER_HUGE_PAGE`] logical pages.
pub const HUGE_PAGE_SIZE: usize = 2 * MB;
pub const PAGES_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Every allocation is aligned to this many bytes, the header included.
pub const ALLOCATION_GRANULARITY: usize = 8;
pub const ALLOCATION_MASK: usize = ALLOCATION_GRANULARITY - 1;

/// Objects of at least this size (header included) go to the large object space.
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = PAGE_SIZE / 2;

/// Smallest object the allocator hands out. A dead object of this size can
/// always be turned into a free-list entry.
pub const MIN_OBJECT_SIZE: usize = 2 * ALLOCATION_GRANULARITY;

/// GC info index reserved for free-list entries and fillers.
pub const FREE_LIST_GC_INFO_INDEX: u16 = 0;

/// Default amount of address space reserved for a heap.
pub const DEFAULT_HEAP_RESERVATION: usize = 512 * MB;

pub const NUM_NORMAL_SPACES: usize = 4;
pub const NUM_SPACES: usize = NUM_NORMAL_SPACES + 1;

#[cfg(debug_assertions)]
pub const ZAPPED_MEMORY_BYTE: u8 = 0xdc;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(HUGE_PAGE_SIZE % PAGE_SIZE == 0);
const _: () = assert!(PAGES_PER_HUGE_PAGE <= 8);
