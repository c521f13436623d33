//! Drives one marking cycle from the roots to the end of the atomic pause.
//!
//! ```text
//! NotStarted --start--> Incremental --advance*--> AtomicPause --finish--> NotStarted
//! ```
//!
//! Atomic marking runs `start` and `finish` back to back. Incremental marking
//! interleaves bounded `advance` steps with the mutator, optionally helped by
//! concurrent markers.

use std::{
    sync::{atomic::AtomicPtr, atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use crate::{
    concurrent_marker::ConcurrentMarker,
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::{
        access_mode::{AccessMode, AtomicAccess, NonAtomicAccess},
        trace_trait::TraceDescriptor,
    },
    marking_visitor::MarkingState,
    roots::{Root, RootSet, RootVisitor},
    space::RawHeap,
    stack::StackState,
    stats_collector::MarkingType,
    util::fatal_security_violation,
    verifier::MarkingVerifier,
    write_barrier::WriteBarrier,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkingPhase {
    NotStarted,
    Incremental,
    AtomicPause,
}

#[derive(Clone, Copy, Debug)]
pub struct MarkingConfig {
    pub marking_type: MarkingType,
    pub concurrent_tasks: usize,
    pub verify: bool,
}

/// Outcome of a finished marking cycle.
#[derive(Clone, Copy, Default, Debug)]
pub struct MarkingResult {
    pub marked_bytes: usize,
    pub objects_found_conservatively: usize,
    pub cleared_weak_slots: usize,
    pub cleared_weak_persistents: usize,
}

/// Marks whatever roots point at.
pub struct MarkingRootVisitor<'s, 'a, M: AccessMode> {
    state: &'s mut MarkingState<'a, M>,
}

impl<'s, 'a, M: AccessMode> MarkingRootVisitor<'s, 'a, M> {
    pub fn new(state: &'s mut MarkingState<'a, M>) -> Self {
        Self { state }
    }
}

impl<'s, 'a, M: AccessMode> RootVisitor for MarkingRootVisitor<'s, 'a, M> {
    fn visit_root_pointers(&mut self, _root: Root, _description: &str, slots: &[AtomicPtr<u8>]) {
        for slot in slots {
            let value = slot.load(Ordering::Acquire);
            if value.is_null() {
                continue;
            }
            if !self.state.heap().backend().is_within_cage(value as usize) {
                fatal_security_violation(value as usize);
            }
            let header = unsafe { &*HeapObjectHeader::from_payload(value) };
            self.state.mark_and_push(
                header,
                TraceDescriptor {
                    base_object_payload: value,
                    callback: header.gc_info().trace,
                },
            );
        }
    }

    fn visit_conservative_range(
        &mut self,
        _root: Root,
        _description: &str,
        start: *const usize,
        end: *const usize,
    ) {
        let mut current = start;
        while current < end {
            let word = unsafe { current.read_volatile() };
            self.state.mark_conservatively(word);
            current = unsafe { current.add(1) };
        }
    }
}

pub struct Marker {
    heap: Arc<HeapHandle>,
    config: MarkingConfig,
    phase: MarkingPhase,
    marked_bytes: usize,
    objects_found_conservatively: usize,
    concurrent: Option<ConcurrentMarker>,
}

impl Marker {
    pub fn new(heap: Arc<HeapHandle>) -> Self {
        Self {
            heap,
            config: MarkingConfig {
                marking_type: MarkingType::Atomic,
                concurrent_tasks: 0,
                verify: false,
            },
            phase: MarkingPhase::NotStarted,
            marked_bytes: 0,
            objects_found_conservatively: 0,
            concurrent: None,
        }
    }

    pub fn phase(&self) -> MarkingPhase {
        self.phase
    }

    pub fn is_marking(&self) -> bool {
        self.phase != MarkingPhase::NotStarted
    }

    pub fn config(&self) -> MarkingConfig {
        self.config
    }

    /// Bytes marked so far, concurrent markers included.
    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes + self.concurrent.as_ref().map_or(0, |marker| marker.marked_bytes())
    }

    fn absorb<M: AccessMode>(&mut self, state: &mut MarkingState<'_, M>) {
        state.publish();
        self.marked_bytes += state.marked_bytes();
        self.objects_found_conservatively += state.objects_found_conservatively();
    }

    /// Enters marking and marks everything directly reachable from roots
    /// other than the stack.
    pub fn start(&mut self, raw_heap: &RawHeap, roots: &mut RootSet, config: MarkingConfig) {
        debug_assert_eq!(self.phase, MarkingPhase::NotStarted);
        debug_assert!(self.heap.worklists().is_empty());
        self.config = config;
        self.marked_bytes = 0;
        self.objects_found_conservatively = 0;
        for page in raw_heap.pages() {
            page.get().reset_live_bytes();
        }
        self.heap.set_marking(true);
        WriteBarrier::flag_entered_marking();
        self.phase = MarkingPhase::Incremental;
        log::debug!("marking started ({:?})", config.marking_type);

        let heap = self.heap.clone();
        if config.marking_type == MarkingType::Atomic {
            let mut state = MarkingState::<NonAtomicAccess>::new(&heap);
            roots.visit_strong(&mut MarkingRootVisitor::new(&mut state), StackState::NoHeapPointers);
            self.absorb(&mut state);
            return;
        }
        let mut state = MarkingState::<AtomicAccess>::new(&heap);
        roots.visit_strong(&mut MarkingRootVisitor::new(&mut state), StackState::NoHeapPointers);
        self.absorb(&mut state);
        drop(state);

        if config.marking_type == MarkingType::IncrementalAndConcurrent && config.concurrent_tasks > 0 {
            self.concurrent = Some(ConcurrentMarker::start(heap, config.concurrent_tasks));
        }
    }

    /// Runs one incremental step bounded by `deadline`. Returns true when no
    /// marking work is left.
    pub fn advance(&mut self, deadline: Duration) -> bool {
        debug_assert_eq!(self.phase, MarkingPhase::Incremental);
        let heap = self.heap.clone();
        let start = Instant::now();
        let mut state = MarkingState::<AtomicAccess>::new(&heap);
        let done = state.drain_worklists_with_predicate(|_| start.elapsed() >= deadline);
        self.absorb(&mut state);
        drop(state);
        log::trace!(
            "incremental marking step took {:?}, {} bytes marked so far",
            start.elapsed(),
            self.marked_bytes()
        );
        done && heap.worklists().is_empty()
    }

    /// Completes marking in the atomic pause: rescans all roots including
    /// the stack, drains every worklist and clears dead weak references.
    /// The heap must be flagged as being in the atomic pause.
    pub fn finish(&mut self, raw_heap: &RawHeap, roots: &mut RootSet, stack_state: StackState) -> MarkingResult {
        debug_assert!(self.is_marking());
        debug_assert!(self.heap.in_atomic_pause());
        self.phase = MarkingPhase::AtomicPause;
        if let Some(concurrent) = self.concurrent.take() {
            let (marked, conservative) = concurrent.join();
            self.marked_bytes += marked;
            self.objects_found_conservatively += conservative;
        }

        let heap = self.heap.clone();
        if self.config.marking_type == MarkingType::Atomic {
            self.mark_atomic_pause::<NonAtomicAccess>(&heap, roots, stack_state);
        } else {
            self.mark_atomic_pause::<AtomicAccess>(&heap, roots, stack_state);
        }

        if self.config.verify {
            let verifier = MarkingVerifier::new(&heap);
            let report = verifier.verify(raw_heap, roots, stack_state);
            if !report.is_ok() {
                log::error!("marking verification failed: {}", report);
            }
            debug_assert!(report.is_ok(), "{}", report);
        }

        let mut result = MarkingResult {
            marked_bytes: self.marked_bytes,
            objects_found_conservatively: self.objects_found_conservatively,
            ..Default::default()
        };
        {
            let mut weak_slots = heap.worklists().weak_slots().local();
            while let Some(slot) = weak_slots.pop() {
                if slot.clear_if_dead() {
                    result.cleared_weak_slots += 1;
                }
            }
        }
        result.cleared_weak_persistents = roots.process_weak_persistents();

        debug_assert!(heap.worklists().is_empty());
        heap.set_marking(false);
        WriteBarrier::flag_exited_marking();
        self.phase = MarkingPhase::NotStarted;
        log::debug!(
            "marking finished: {} bytes marked, {} weak slots and {} weak persistents cleared",
            result.marked_bytes,
            result.cleared_weak_slots,
            result.cleared_weak_persistents
        );
        result
    }

    fn mark_atomic_pause<M: AccessMode>(&mut self, heap: &HeapHandle, roots: &mut RootSet, stack_state: StackState) {
        let mut state = MarkingState::<M>::new(heap);
        roots.visit_strong(&mut MarkingRootVisitor::new(&mut state), stack_state);
        loop {
            state.drain_worklists();
            let pending = heap.worklists().take_not_fully_constructed();
            if pending.is_empty() {
                state.publish();
                if heap.worklists().is_empty() {
                    break;
                }
                continue;
            }
            for header in pending {
                let header = header.get();
                let page = unsafe { &*header.page() };
                if heap.is_compacting() && page.is_evacuation_candidate() {
                    page.set_evacuation_candidate(false);
                }
                if stack_state == StackState::MayContainHeapPointers {
                    state.trace_conservatively(header);
                } else {
                    state.push_marked(header);
                }
            }
        }
        self.absorb(&mut state);
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        if let Some(concurrent) = self.concurrent.take() {
            concurrent.join();
        }
        if self.phase != MarkingPhase::NotStarted {
            self.heap.worklists().clear();
            self.heap.set_marking(false);
            WriteBarrier::flag_exited_marking();
        }
    }
}
