//! Explicitly freeing and resizing objects the embedder knows to be unreferenced.
//!
//! Both operations refuse to run while a collection is in progress: while
//! marking, in the atomic pause and while sweeping.

use crate::{
    globals::MIN_OBJECT_SIZE,
    header::{HeapObjectHeader, HEADER_SIZE},
    heap::HeapHandle,
    internal::access_mode::NonAtomicAccess,
    object_allocator::allocation_size,
    page::BasePage,
    space::{PageRef, RawHeap},
    stats_collector::StatsCollector,
    util::zap_memory,
};

pub(crate) struct ExplicitManagement<'a> {
    pub raw_heap: &'a mut RawHeap,
    pub heap: &'a HeapHandle,
    pub stats: &'a mut StatsCollector,
}

impl<'a> ExplicitManagement<'a> {
    /// Finalizes and reclaims the object at `payload`. Returns false when
    /// the heap is not in a state that allows freeing.
    pub fn try_free(&mut self, payload: *mut u8) -> bool {
        if self.heap.in_atomic_pause() || self.heap.is_marking() || self.heap.is_sweeping() {
            return false;
        }
        let header = unsafe { &*HeapObjectHeader::from_payload(payload) };
        let page = unsafe { &*header.page() };
        debug_assert!(core::ptr::eq(page.heap_ptr(), self.heap));
        debug_assert!(!header.is_free::<NonAtomicAccess>());
        header.finalize();

        let size = header.allocated_size::<NonAtomicAccess>();
        if page.is_large() {
            let page_ref = PageRef::new(unsafe {
                core::ptr::NonNull::new_unchecked(page as *const BasePage as *mut BasePage)
            });
            self.raw_heap.remove_page(page_ref);
            unsafe { BasePage::destroy(page_ref.as_ptr(), self.heap.backend()) };
        } else {
            let address = header.address();
            let space = self.raw_heap.normal_space(page.space());
            let lab = space.lab();
            unsafe { zap_memory(address as *mut u8, size) };
            if lab.size() != 0 && lab.start() == address + size {
                // Directly in front of the buffer: grow the buffer backwards.
                page.as_normal()
                    .object_start_bitmap()
                    .clear_bit::<NonAtomicAccess>(address);
                space.lab.set(address, lab.size() + size);
            } else {
                space.add_to_free_list(address, size);
            }
        }
        // Allocation is counted per object, buffer merges included.
        self.stats.notify_explicit_free(size);
        true
    }

    /// Changes the payload size of the object at `payload` to
    /// `new_object_size` bytes without moving it.
    pub fn resize(&mut self, payload: *mut u8, new_object_size: usize) -> bool {
        if self.heap.in_atomic_pause() || self.heap.is_marking() || self.heap.is_sweeping() {
            return false;
        }
        let header = unsafe { &*HeapObjectHeader::from_payload(payload) };
        let page = unsafe { &*header.page() };
        if page.is_large() {
            return false;
        }
        let new_size = allocation_size(new_object_size);
        let old_size = header.allocated_size::<NonAtomicAccess>();
        if new_size > old_size {
            self.grow(header, old_size, new_size)
        } else if new_size < old_size {
            self.shrink(header, page, old_size, new_size)
        } else {
            true
        }
    }

    fn grow(&mut self, header: &HeapObjectHeader, old_size: usize, new_size: usize) -> bool {
        let page = unsafe { &*header.page() };
        let space = self.raw_heap.normal_space(page.space());
        let lab = space.lab();
        let delta = new_size - old_size;
        if lab.start() != header.address() + old_size || lab.size() < delta {
            return false;
        }
        unsafe { core::ptr::write_bytes(lab.start() as *mut u8, 0, delta) };
        space.lab.set(lab.start() + delta, lab.size() - delta);
        header.set_size(new_size);
        self.stats.notify_grow(delta);
        true
    }

    fn shrink(
        &mut self,
        header: &HeapObjectHeader,
        page: &BasePage,
        old_size: usize,
        new_size: usize,
    ) -> bool {
        debug_assert!(new_size >= HEADER_SIZE);
        let delta = old_size - new_size;
        let space = self.raw_heap.normal_space(page.space());
        let lab = space.lab();
        let tail = header.address() + new_size;
        if lab.size() != 0 && lab.start() == header.address() + old_size {
            header.set_size(new_size);
            unsafe { zap_memory(tail as *mut u8, delta) };
            space.lab.set(tail, lab.size() + delta);
        } else if delta >= MIN_OBJECT_SIZE && !page.never_allocate() {
            header.set_size(new_size);
            unsafe { zap_memory(tail as *mut u8, delta) };
            space.add_to_free_list(tail, delta);
        } else {
            // Too small to hold a free-list entry, or the page is being
            // evacuated. The object keeps its size.
            return true;
        }
        self.stats.notify_shrink(delta);
        true
    }
}
