//! Debugging aid: recomputes reachability with a plain stop-the-world trace
//! and compares the result against the mark bits.

use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::{access_mode::NonAtomicAccess, trace_trait::TraceDescriptor},
    roots::{Root, RootSet, RootVisitor},
    space::{RawHeap, SpaceType},
    stack::StackState,
    visitor::{Visitor, VisitorTrait},
};

/// Differences between the naive trace and the mark bits.
#[derive(Default, Debug)]
pub struct VerificationReport {
    pub reachable_objects: usize,
    /// Reachable objects the marker missed.
    pub unmarked_reachable: Vec<usize>,
    /// Spaces whose free list failed its accounting check.
    pub corrupted_free_lists: Vec<SpaceType>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.unmarked_reachable.is_empty() && self.corrupted_free_lists.is_empty()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reachable objects, {} of them unmarked",
            self.reachable_objects,
            self.unmarked_reachable.len()
        )?;
        for address in self.unmarked_reachable.iter().take(8) {
            let header = unsafe { &*(*address as *const HeapObjectHeader) };
            write!(f, "\n  unmarked {} at {:#x}", header.name(), address)?;
        }
        for space in self.corrupted_free_lists.iter() {
            write!(f, "\n  corrupted free list in {:?}", space)?;
        }
        Ok(())
    }
}

struct Tracer<'a> {
    heap: &'a HeapHandle,
    visited: HashSet<usize>,
    pending: Vec<*const HeapObjectHeader>,
}

impl<'a> Tracer<'a> {
    fn push(&mut self, header: *const HeapObjectHeader) {
        if self.visited.insert(header as usize) {
            self.pending.push(header);
        }
    }

    fn push_conservatively(&mut self, address: usize) {
        let page = self.heap.backend().lookup(address);
        if page.is_null() {
            return;
        }
        let header = unsafe { (*page).object_header_from_inner_address::<NonAtomicAccess>(address) };
        if !header.is_null() {
            self.push(header);
        }
    }

    fn scan(&mut self, start: usize, end: usize) {
        let mut current = start;
        while current + core::mem::size_of::<usize>() <= end {
            self.push_conservatively(unsafe { (current as *const usize).read() });
            current += core::mem::size_of::<usize>();
        }
    }
}

impl<'a> VisitorTrait for Tracer<'a> {
    fn visit(&mut self, _this: *const u8, descriptor: TraceDescriptor) {
        self.push(HeapObjectHeader::from_payload(descriptor.base_object_payload));
    }

    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8) {
        self.scan(from as usize, to as usize);
    }
}

impl<'a> RootVisitor for Tracer<'a> {
    fn visit_root_pointers(&mut self, _root: Root, _description: &str, slots: &[AtomicPtr<u8>]) {
        for slot in slots {
            let value = slot.load(Ordering::Relaxed);
            if !value.is_null() {
                self.push(HeapObjectHeader::from_payload(value));
            }
        }
    }

    fn visit_conservative_range(
        &mut self,
        _root: Root,
        _description: &str,
        start: *const usize,
        end: *const usize,
    ) {
        self.scan(start as usize, end as usize);
    }
}

pub struct MarkingVerifier<'a> {
    heap: &'a HeapHandle,
}

impl<'a> MarkingVerifier<'a> {
    pub fn new(heap: &'a HeapHandle) -> Self {
        Self { heap }
    }

    /// Must run after marking finished and before anything is swept.
    pub fn verify(&self, raw_heap: &RawHeap, roots: &mut RootSet, stack_state: StackState) -> VerificationReport {
        let mut tracer = Tracer {
            heap: self.heap,
            visited: HashSet::new(),
            pending: Vec::new(),
        };
        roots.visit_strong(&mut tracer, stack_state);

        let mut report = VerificationReport::default();
        while let Some(header) = tracer.pending.pop() {
            let header = unsafe { &*header };
            report.reachable_objects += 1;
            if !header.is_marked::<NonAtomicAccess>() {
                report.unmarked_reachable.push(header.address());
            }
            if header.is_in_construction::<NonAtomicAccess>()
                && stack_state == StackState::MayContainHeapPointers
            {
                tracer.scan(header.payload() as usize, header.object_end::<NonAtomicAccess>());
            } else {
                let mut visitor = Visitor::new(&mut tracer);
                header.trace(&mut visitor);
            }
        }

        for space in SpaceType::NORMAL {
            if !raw_heap.normal_space_ref(space).free_list().verify() {
                report.corrupted_free_lists.push(space);
            }
        }
        log::debug!(
            "verified {} reachable objects",
            report.reachable_objects
        );
        report
    }
}
