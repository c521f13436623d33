//! Object allocation on top of the spaces of a [`RawHeap`].
//!
//! Normal objects are bump allocated from the linear allocation buffer of
//! their size bucket. When the buffer is exhausted it is refilled from the
//! space's free list or from a fresh page. Large objects get a page each.
//! Deciding when to collect garbage or sweep is left to the heap.

use std::ptr::NonNull;

use crate::{
    globals::{ALLOCATION_GRANULARITY, LARGE_OBJECT_SIZE_THRESHOLD, MIN_OBJECT_SIZE},
    header::{HeapObjectHeader, HEADER_SIZE},
    heap::HeapHandle,
    internal::{access_mode::NonAtomicAccess, gc_info::GCInfoIndex},
    page::{BasePage, LargePage, NormalPage},
    space::{PageRef, RawHeap, SpaceType},
    stats_collector::StatsCollector,
    util::align_up,
};

/// Bytes an allocation request of `size` payload bytes occupies, header included.
#[inline(always)]
pub const fn allocation_size(size: usize) -> usize {
    let size = align_up(size + HEADER_SIZE, ALLOCATION_GRANULARITY);
    if size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        size
    }
}

#[inline(always)]
pub const fn is_large_allocation(allocation_size: usize) -> bool {
    allocation_size >= LARGE_OBJECT_SIZE_THRESHOLD
}

pub struct ObjectAllocator<'a> {
    raw_heap: &'a mut RawHeap,
    heap: &'a HeapHandle,
    stats: &'a mut StatsCollector,
}

impl<'a> ObjectAllocator<'a> {
    pub fn new(raw_heap: &'a mut RawHeap, heap: &'a HeapHandle, stats: &'a mut StatsCollector) -> Self {
        Self {
            raw_heap,
            heap,
            stats,
        }
    }

    /// Fast path. Bumps `allocation_size` bytes off the space's buffer.
    #[inline]
    pub fn allocate_from_lab(
        &mut self,
        space: SpaceType,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<u8>> {
        let address = self
            .raw_heap
            .normal_space(space)
            .lab
            .allocate(allocation_size)?;
        Some(self.initialize_object(address, allocation_size, gc_info_index))
    }

    fn initialize_object(
        &mut self,
        address: usize,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> NonNull<u8> {
        let header = unsafe {
            core::ptr::write_bytes(
                (address + HEADER_SIZE) as *mut u8,
                0,
                allocation_size - HEADER_SIZE,
            );
            HeapObjectHeader::initialize(address as *mut u8, allocation_size, gc_info_index)
        };
        let page = unsafe { &*BasePage::from_payload(header.payload()) };
        page.as_normal()
            .object_start_bitmap()
            .set_bit::<NonAtomicAccess>(address);
        self.stats.notify_allocation(allocation_size);
        unsafe { NonNull::new_unchecked(header.payload()) }
    }

    /// Replaces the buffer of `space` with a free-list entry of at least
    /// `allocation_size` bytes.
    pub fn refill_lab_from_free_list(&mut self, space: SpaceType, allocation_size: usize) -> bool {
        let normal = self.raw_heap.normal_space(space);
        // Return the old buffer first so it can be coalesced into the search.
        normal.reset_lab();
        let Some((start, size)) = normal.free_list.allocate(allocation_size) else {
            return false;
        };
        debug_assert!(unsafe { !(*BasePage::from_payload(start as *const u8)).never_allocate() });
        normal.set_lab(start, size);
        true
    }

    /// Adds a fresh page to `space` and turns its whole payload into the buffer.
    pub fn refill_lab_from_new_page(&mut self, space: SpaceType) -> bool {
        let Some(page) = NormalPage::create(self.heap.backend(), self.heap, space) else {
            return false;
        };
        let page = unsafe { page.as_ref() };
        self.raw_heap
            .add_page(PageRef::new(unsafe { NonNull::new_unchecked(page.as_base_ptr()) }));
        log::trace!(
            "new normal page {:#x} for {:?}",
            page.base().address(),
            space
        );
        let normal = self.raw_heap.normal_space(space);
        normal.add_to_free_list(page.payload_start(), NormalPage::payload_size());
        let Some((start, size)) = normal.free_list.allocate(NormalPage::payload_size()) else {
            return false;
        };
        normal.set_lab(start, size);
        true
    }

    /// Allocates a large object on a page of its own. Large objects are
    /// initialized with size 0; the page records their real size.
    pub fn allocate_large(
        &mut self,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<u8>> {
        let page = LargePage::create(self.heap.backend(), self.heap, allocation_size)?;
        let page = unsafe { page.as_ref() };
        let header = unsafe {
            let header = page.object_header();
            core::ptr::write_bytes(
                (header as usize + HEADER_SIZE) as *mut u8,
                0,
                allocation_size - HEADER_SIZE,
            );
            HeapObjectHeader::initialize(header.cast(), 0, gc_info_index)
        };
        self.raw_heap
            .add_page(PageRef::new(unsafe { NonNull::new_unchecked(page.as_base_ptr()) }));
        log::trace!(
            "new large page {:#x} for {} bytes",
            page.base().address(),
            allocation_size
        );
        self.stats.notify_allocation(allocation_size);
        Some(unsafe { NonNull::new_unchecked(header.payload()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_size_rounding() {
        assert_eq!(allocation_size(0), MIN_OBJECT_SIZE);
        assert_eq!(allocation_size(1), 16);
        assert_eq!(allocation_size(8), 16);
        assert_eq!(allocation_size(9), 24);
        assert_eq!(allocation_size(24), 32);
        assert!(!is_large_allocation(allocation_size(LARGE_OBJECT_SIZE_THRESHOLD - 16)));
        assert!(is_large_allocation(allocation_size(LARGE_OBJECT_SIZE_THRESHOLD)));
    }
}
