use std::sync::atomic::{AtomicPtr, Ordering};

use crate::{
    gcref::{GcRef, Member, UntypedGcRef, WeakMember},
    header::HeapObjectHeader,
    internal::trace_trait::{TraceDescriptor, TraceTrait},
};

/// Backend of a [`Visitor`]. Marking, verification and pointer updating each
/// provide their own implementation.
pub trait VisitorTrait {
    /// Visits a managed object reachable through a strong reference.
    fn visit(&mut self, this: *const u8, descriptor: TraceDescriptor) {
        let _ = this;
        let _ = descriptor;
    }

    /// Visits a strong slot. The default implementation forwards the current
    /// value to [`visit`](VisitorTrait::visit).
    fn visit_member(&mut self, slot: &AtomicPtr<u8>) {
        let value = slot.load(Ordering::Acquire);
        if value.is_null() {
            return;
        }
        let header = unsafe { &*HeapObjectHeader::from_payload(value) };
        self.visit(
            value,
            TraceDescriptor {
                base_object_payload: value,
                callback: header.gc_info().trace,
            },
        );
    }

    /// Visits a weak slot. Weak slots do not keep their target alive.
    fn visit_weak_member(&mut self, slot: &AtomicPtr<u8>) {
        let _ = slot;
    }

    /// Visits a range of words that may or may not contain pointers into the heap.
    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8) {
        let _ = from;
        let _ = to;
    }
}

/// Handle passed to trace callbacks.
#[repr(C)]
pub struct Visitor<'a> {
    pub(crate) vis: &'a mut dyn VisitorTrait,
}

impl<'a> Visitor<'a> {
    pub fn new(vis: &'a mut dyn VisitorTrait) -> Self {
        Self { vis }
    }

    /// Trace method for raw pointers. Prefer the versions for managed pointers.
    ///
    /// # Safety
    /// `t` must be null or the payload of a live managed object of type `T`.
    pub unsafe fn trace<T: TraceTrait>(&mut self, t: *const T) {
        if t.is_null() {
            return;
        }

        self.vis
            .visit(t.cast(), <T as TraceTrait>::get_trace_descriptor(t.cast()))
    }

    /// Trace method for inlined objects that are not allocated themselves but
    /// otherwise follow managed heap layout and have a trace() method.
    pub fn trace_ref<T: TraceTrait>(&mut self, object: &T) {
        <T as TraceTrait>::trace(object, self);
    }

    pub fn trace_gcref<T: TraceTrait>(&mut self, object: GcRef<T>) {
        unsafe {
            self.trace(object.as_ptr() as *const T);
        }
    }

    pub fn trace_untyped(&mut self, object: UntypedGcRef) {
        let header = unsafe { &*object.header.as_ptr() };
        self.vis.visit(
            object.get(),
            TraceDescriptor {
                base_object_payload: object.get(),
                callback: header.gc_info().trace,
            },
        )
    }

    pub fn trace_member<T>(&mut self, member: &Member<T>) {
        self.vis.visit_member(member.slot());
    }

    pub fn trace_weak_member<T>(&mut self, member: &WeakMember<T>) {
        self.vis.visit_weak_member(member.slot());
    }

    pub fn trace_conservatively(&mut self, from: *const u8, to: *const u8) {
        self.vis.visit_conservative(from.cast(), to.cast());
    }
}
