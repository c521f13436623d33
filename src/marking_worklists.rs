use std::{
    collections::HashSet,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

use parking_lot::Mutex;

use crate::{
    header::HeapObjectHeader,
    internal::{trace_trait::TraceDescriptor, worklist::Worklist},
};

/// Header pointer that may be handed between marking threads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HeaderRef(NonNull<HeapObjectHeader>);

unsafe impl Send for HeaderRef {}
unsafe impl Sync for HeaderRef {}

impl HeaderRef {
    pub fn new(header: &HeapObjectHeader) -> Self {
        Self(NonNull::from(header))
    }

    pub fn as_ptr(self) -> *mut HeapObjectHeader {
        self.0.as_ptr()
    }

    #[inline(always)]
    pub fn get<'a>(self) -> &'a HeapObjectHeader {
        unsafe { &*self.0.as_ptr() }
    }
}

/// Address of a weak slot inside a marked object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WeakSlot(NonNull<AtomicPtr<u8>>);

unsafe impl Send for WeakSlot {}
unsafe impl Sync for WeakSlot {}

impl WeakSlot {
    pub fn new(slot: &AtomicPtr<u8>) -> Self {
        Self(NonNull::from(slot))
    }

    pub fn get<'a>(self) -> &'a AtomicPtr<u8> {
        unsafe { &*self.0.as_ptr() }
    }

    /// Clears the slot if its target did not survive marking.
    pub fn clear_if_dead(self) -> bool {
        let slot = self.get();
        let value = slot.load(Ordering::Relaxed);
        if value.is_null() {
            return false;
        }
        let header = unsafe { &*HeapObjectHeader::from_payload(value) };
        if header.is_marked::<crate::internal::access_mode::NonAtomicAccess>() {
            return false;
        }
        slot.store(core::ptr::null_mut(), Ordering::Relaxed);
        true
    }
}

/// Worklists shared by the mutator thread and all concurrent markers.
///
/// Every header pushed to `marking` or `write_barrier` has its mark bit set
/// already.
#[derive(Default)]
pub struct MarkingWorklists {
    marking: Worklist<TraceDescriptor>,
    write_barrier: Worklist<HeaderRef>,
    not_fully_constructed: Mutex<HashSet<HeaderRef>>,
    weak_slots: Worklist<WeakSlot>,
}

impl MarkingWorklists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marking(&self) -> &Worklist<TraceDescriptor> {
        &self.marking
    }

    pub fn write_barrier(&self) -> &Worklist<HeaderRef> {
        &self.write_barrier
    }

    pub fn weak_slots(&self) -> &Worklist<WeakSlot> {
        &self.weak_slots
    }

    pub fn push_not_fully_constructed(&self, header: &HeapObjectHeader) {
        self.not_fully_constructed.lock().insert(HeaderRef::new(header));
    }

    pub fn take_not_fully_constructed(&self) -> Vec<HeaderRef> {
        self.not_fully_constructed.lock().drain().collect()
    }

    pub fn not_fully_constructed_len(&self) -> usize {
        self.not_fully_constructed.lock().len()
    }

    /// Whether no marking work is left anywhere. Only meaningful once every
    /// local view has been published.
    pub fn is_empty(&self) -> bool {
        self.marking.is_empty()
            && self.write_barrier.is_empty()
            && self.not_fully_constructed.lock().is_empty()
    }

    pub fn clear(&self) {
        self.marking.clear();
        self.write_barrier.clear();
        self.weak_slots.clear();
        self.not_fully_constructed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::access_mode::NonAtomicAccess;

    #[test]
    fn test_not_fully_constructed_deduplicates() {
        let worklists = MarkingWorklists::new();
        let mut memory = vec![0u64; 4];
        let header = unsafe { HeapObjectHeader::initialize(memory.as_mut_ptr().cast(), 32, 1) };
        worklists.push_not_fully_constructed(header);
        worklists.push_not_fully_constructed(header);
        assert_eq!(worklists.not_fully_constructed_len(), 1);
        assert!(!worklists.is_empty());
        let taken = worklists.take_not_fully_constructed();
        assert_eq!(taken, vec![HeaderRef::new(header)]);
        assert!(worklists.is_empty());
    }

    #[test]
    fn test_weak_slot_cleared_when_target_unmarked() {
        let mut memory = vec![0u64; 8];
        let live = unsafe { HeapObjectHeader::initialize(memory.as_mut_ptr().cast(), 16, 1) };
        live.try_mark::<NonAtomicAccess>();
        let live_payload = live.payload();
        let dead =
            unsafe { HeapObjectHeader::initialize(memory.as_mut_ptr().add(2).cast(), 16, 1) };
        let dead_payload = dead.payload();

        let strong = AtomicPtr::new(live_payload);
        let weak = AtomicPtr::new(dead_payload);
        assert!(!WeakSlot::new(&strong).clear_if_dead());
        assert!(WeakSlot::new(&weak).clear_if_dead());
        assert!(weak.load(Ordering::Relaxed).is_null());
        assert_eq!(strong.load(Ordering::Relaxed), live_payload);
    }
}
