use std::{
    marker::PhantomData,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::{
        access_mode::AccessMode,
        marking_bitmap::NULL_ADDRESS,
        trace_trait::{TraceCallback, TraceDescriptor},
        worklist::Local,
    },
    marking_worklists::{HeaderRef, WeakSlot},
    page::NormalPage,
    util::fatal_security_violation,
    visitor::{Visitor, VisitorTrait},
    write_barrier::record_slot_for_compaction,
};

/// Items processed between two checks of the yield predicate.
pub const DEADLINE_CHECK_INTERVAL: usize = 1250;

/// Per-thread marking state: local views of the shared worklists plus the
/// bytes marked by this thread. `M` selects atomic accesses when other
/// markers may run at the same time.
pub struct MarkingState<'a, M: AccessMode> {
    heap: &'a HeapHandle,
    marking: Local<'a, TraceDescriptor>,
    write_barrier: Local<'a, HeaderRef>,
    weak_slots: Local<'a, WeakSlot>,
    in_construction: Vec<HeaderRef>,
    marked_bytes: usize,
    objects_found_conservatively: usize,
    compacting: bool,
    marker: PhantomData<M>,
}

impl<'a, M: AccessMode> MarkingState<'a, M> {
    pub fn new(heap: &'a HeapHandle) -> Self {
        let worklists = heap.worklists();
        Self {
            heap,
            marking: worklists.marking().local(),
            write_barrier: worklists.write_barrier().local(),
            weak_slots: worklists.weak_slots().local(),
            in_construction: Vec::new(),
            marked_bytes: 0,
            objects_found_conservatively: 0,
            compacting: heap.is_compacting(),
            marker: PhantomData,
        }
    }

    pub fn heap(&self) -> &'a HeapHandle {
        self.heap
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub fn objects_found_conservatively(&self) -> usize {
        self.objects_found_conservatively
    }

    #[inline(always)]
    fn check_cage(&self, address: usize) {
        if !self.heap.backend().is_within_cage(address) {
            fatal_security_violation(address);
        }
    }

    /// Sets the mark bit and the page's mark bitmap bit. Returns false if
    /// the object was marked already.
    #[inline]
    pub fn mark_no_push(&self, header: &HeapObjectHeader) -> bool {
        if !header.try_mark::<M>() {
            return false;
        }
        let page = unsafe { &*header.page() };
        if !page.is_large() {
            page.as_normal()
                .marking_bitmap()
                .set_bit::<M>(header.address());
        }
        true
    }

    #[inline]
    pub fn mark_and_push(&mut self, header: &HeapObjectHeader, descriptor: TraceDescriptor) {
        if !self.mark_no_push(header) {
            return;
        }
        if header.is_in_construction::<M>() {
            self.heap.worklists().push_not_fully_constructed(header);
        } else {
            self.marking.push(descriptor);
        }
    }

    /// Queues an already marked object for tracing.
    pub fn push_marked(&mut self, header: &HeapObjectHeader) {
        debug_assert!(header.is_marked::<M>());
        self.marking.push(TraceDescriptor {
            base_object_payload: header.payload(),
            callback: header.gc_info().trace,
        });
    }

    #[inline]
    pub fn account_marked_bytes(&mut self, header: &HeapObjectHeader) {
        let size = header.allocated_size::<M>();
        self.marked_bytes += size;
        unsafe { (*header.page()).increment_live_bytes(size) };
    }

    fn record_slot(&self, slot: &AtomicPtr<u8>, value: *mut u8) {
        if self.compacting {
            record_slot_for_compaction(self.heap, slot as *const _ as usize, value);
        }
    }

    /// Marks the object spanning `address`, if any. Used for ranges that may
    /// hold arbitrary words such as native stacks.
    pub fn mark_conservatively(&mut self, address: usize) {
        let page = self.heap.backend().lookup(address);
        if page.is_null() {
            return;
        }
        let page = unsafe { &*page };
        if !page.is_large() && Self::is_marked_via_bitmap(page.as_normal(), address) {
            return;
        }
        let header = page.object_header_from_inner_address::<M>(address);
        if header.is_null() {
            return;
        }
        let header = unsafe { &*header };
        self.objects_found_conservatively += 1;
        if self.compacting && page.is_evacuation_candidate() {
            // Conservative references cannot be updated. Keep the page in place.
            page.set_evacuation_candidate(false);
        }
        if header.is_in_construction::<M>() {
            if self.mark_no_push(header) {
                self.in_construction.push(HeaderRef::new(header));
            }
        } else {
            self.mark_and_push(
                header,
                TraceDescriptor {
                    base_object_payload: header.payload(),
                    callback: header.gc_info().trace,
                },
            );
        }
    }

    /// Fast path for inner pointers into objects that are marked already.
    fn is_marked_via_bitmap(page: &NormalPage, address: usize) -> bool {
        if address < page.payload_start() || address >= page.payload_end() {
            return false;
        }
        let previous = page.marking_bitmap().find_previous_marked_object(address);
        if previous == NULL_ADDRESS {
            return true;
        }
        if previous < page.payload_start() {
            return false;
        }
        let header = unsafe { &*(previous as *const HeapObjectHeader) };
        address < header.object_end::<M>()
    }

    /// Scans the payload of `header` word by word. The object must be marked.
    pub fn trace_conservatively(&mut self, header: &HeapObjectHeader) {
        let start = header.payload() as usize;
        let end = header.object_end::<M>();
        self.account_marked_bytes(header);
        self.scan_range(start, end);
    }

    fn scan_range(&mut self, start: usize, end: usize) {
        let mut current = start;
        while current + core::mem::size_of::<usize>() <= end {
            let word = unsafe { (current as *const usize).read() };
            self.mark_conservatively(word);
            current += core::mem::size_of::<usize>();
        }
    }

    fn trace_marked_object(&mut self, payload: *const u8, callback: TraceCallback) {
        let header = unsafe { &*HeapObjectHeader::from_payload(payload) };
        self.account_marked_bytes(header);
        let mut visitor = Visitor::new(self);
        callback(&mut visitor, payload);
    }

    /// Drains the worklists until they are empty or `should_yield` asks to
    /// stop. The predicate is consulted every [`DEADLINE_CHECK_INTERVAL`]
    /// items with the bytes marked so far. Returns true when no work is left.
    pub fn drain_worklists_with_predicate(
        &mut self,
        mut should_yield: impl FnMut(usize) -> bool,
    ) -> bool {
        let mut processed = 0usize;
        loop {
            let mut did_work = false;
            while let Some(header) = self.in_construction.pop() {
                self.trace_conservatively(header.get());
                did_work = true;
            }
            if let Some(header) = self.write_barrier.pop() {
                let header = header.get();
                self.trace_marked_object(header.payload(), header.gc_info().trace);
                did_work = true;
            } else if let Some(item) = self.marking.pop() {
                self.trace_marked_object(item.base_object_payload, item.callback);
                did_work = true;
            }
            if !did_work {
                return true;
            }
            processed += 1;
            if processed % DEADLINE_CHECK_INTERVAL == 0 && should_yield(self.marked_bytes) {
                return false;
            }
        }
    }

    pub fn drain_worklists(&mut self) {
        self.drain_worklists_with_predicate(|_| false);
    }

    /// Makes every locally queued item visible to other threads.
    pub fn publish(&mut self) {
        for header in self.in_construction.drain(..) {
            self.heap.worklists().push_not_fully_constructed(header.get());
        }
        self.marking.publish();
        self.write_barrier.publish();
        self.weak_slots.publish();
    }

    pub fn is_local_empty(&self) -> bool {
        self.in_construction.is_empty()
            && self.marking.is_local_empty()
            && self.write_barrier.is_local_empty()
    }
}

impl<'a, M: AccessMode> VisitorTrait for MarkingState<'a, M> {
    fn visit(&mut self, this: *const u8, descriptor: TraceDescriptor) {
        self.check_cage(this as usize);
        let header = unsafe { &*HeapObjectHeader::from_payload(descriptor.base_object_payload) };
        self.mark_and_push(header, descriptor);
    }

    fn visit_member(&mut self, slot: &AtomicPtr<u8>) {
        let value = slot.load(Ordering::Acquire);
        if value.is_null() {
            return;
        }
        self.check_cage(value as usize);
        let header = unsafe { &*HeapObjectHeader::from_payload(value) };
        self.mark_and_push(
            header,
            TraceDescriptor {
                base_object_payload: value,
                callback: header.gc_info().trace,
            },
        );
        self.record_slot(slot, value);
    }

    fn visit_weak_member(&mut self, slot: &AtomicPtr<u8>) {
        let value = slot.load(Ordering::Acquire);
        if value.is_null() {
            return;
        }
        self.check_cage(value as usize);
        self.weak_slots.push(WeakSlot::new(slot));
        self.record_slot(slot, value);
    }

    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8) {
        self.scan_range(from as usize, to as usize);
    }
}
