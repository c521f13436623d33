//! Barriers executed on every store of a managed pointer into the heap.
//!
//! While any heap is marking, stores shade their target (Dijkstra insertion
//! barrier): the target is marked and queued for tracing, so a black object
//! can never end up pointing at a white one. While a heap is compacting, the
//! stored-to slot is additionally remembered when its target will move.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::{
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::access_mode::AtomicAccess,
    marking_worklists::HeaderRef,
    page::BasePage,
    util::fatal_security_violation,
};

/// Number of heaps that currently run incremental or concurrent marking.
static MARKING_HEAPS: AtomicUsize = AtomicUsize::new(0);

pub struct WriteBarrier;

impl WriteBarrier {
    pub(crate) fn flag_entered_marking() {
        MARKING_HEAPS.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn flag_exited_marking() {
        let previous = MARKING_HEAPS.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Cheap global check every barrier starts with.
    #[inline(always)]
    pub fn is_any_marking() -> bool {
        MARKING_HEAPS.load(Ordering::Relaxed) > 0
    }

    /// Full barrier for a store of `target` into `slot` of the object whose
    /// payload starts at `object`. Entry point for generated code.
    #[inline]
    pub fn record_slot(object: *const u8, slot: &AtomicPtr<u8>, target: *mut u8) {
        debug_assert!(object as usize <= slot as *const _ as usize);
        Self::dijkstra_marking_barrier(slot, target);
    }

    #[inline(always)]
    pub fn dijkstra_marking_barrier(slot: &AtomicPtr<u8>, value: *mut u8) {
        if value.is_null() || !Self::is_any_marking() {
            return;
        }
        unsafe { Self::dijkstra_marking_barrier_slow(slot, value) }
    }

    #[cold]
    #[inline(never)]
    unsafe fn dijkstra_marking_barrier_slow(slot: &AtomicPtr<u8>, value: *mut u8) {
        let page = &*BasePage::from_payload(value);
        let heap = page.heap_ptr();
        if heap.is_null() {
            return;
        }
        let heap = &*heap;
        if !heap.is_marking() {
            return;
        }
        if !heap.backend().is_within_cage(value as usize) {
            fatal_security_violation(value as usize);
        }
        let header = &*HeapObjectHeader::from_payload(value);
        Self::mark_value(heap, page, header);
        if heap.is_compacting() {
            record_slot_for_compaction(heap, slot as *const _ as usize, value);
        }
    }

    fn mark_value(heap: &HeapHandle, page: &BasePage, header: &HeapObjectHeader) {
        if !header.try_mark::<AtomicAccess>() {
            return;
        }
        if !page.is_large() {
            page.as_normal()
                .marking_bitmap()
                .set_bit::<AtomicAccess>(header.address());
        }
        if header.is_in_construction::<AtomicAccess>() {
            heap.worklists().push_not_fully_constructed(header);
        } else {
            heap.worklists().write_barrier().push(HeaderRef::new(header));
        }
    }

    /// Barrier for stores that must not keep their target alive. Only the slot
    /// is remembered for compaction.
    #[inline]
    pub fn record_slot_if_needed(slot: &AtomicPtr<u8>, value: *mut u8) {
        if value.is_null() || !Self::is_any_marking() {
            return;
        }
        unsafe {
            let page = &*BasePage::from_payload(value);
            let heap = page.heap_ptr();
            if heap.is_null() || !(*heap).is_compacting() {
                return;
            }
            record_slot_for_compaction(&*heap, slot as *const _ as usize, value);
        }
    }
}

/// Remembers `slot` if `value` lives on an evacuation candidate. Slots outside
/// of the heap are roots and updated separately. Slots on candidates are
/// recorded as well since a candidate may still get pinned.
pub(crate) fn record_slot_for_compaction(heap: &HeapHandle, slot: usize, value: *mut u8) {
    let target = unsafe { &*BasePage::from_payload(value) };
    if !target.is_evacuation_candidate() {
        return;
    }
    let slot_page = heap.backend().lookup(slot);
    if slot_page.is_null() {
        return;
    }
    unsafe { (*slot_page).record_slot(slot) };
}
