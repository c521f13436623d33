//! Evacuation of sparsely populated normal pages.
//!
//! Candidates are picked when marking starts. While marking, every slot that
//! points into a candidate is recorded in the slot set of the page holding
//! it. In the atomic pause the live objects of every candidate are copied to
//! fresh pages, recorded slots, roots and the moved objects themselves are
//! updated, and the candidates are released.

use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::{access_mode::NonAtomicAccess, trace_trait::TraceDescriptor},
    invalidated_slots::InvalidatedSlotsFilter,
    page::{BasePage, NormalPage},
    roots::{Root, RootSet, RootVisitor},
    space::{PageRef, RawHeap, SpaceType},
    stack::StackState,
    util::fatal_out_of_memory,
    visitor::{Visitor, VisitorTrait},
};

/// When to evacuate pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub enum Compaction {
    Never,
    /// Evacuate pages that are less than half full once a space has
    /// accumulated enough free memory.
    WhenFragmented,
    /// Evacuate every normal page that is not completely full.
    Always,
}

/// Share of free memory in a space above which it counts as fragmented.
const FRAGMENTATION_THRESHOLD: f64 = 0.3;

type ForwardingTable = HashMap<usize, usize>;

#[inline]
fn update_slot(forwarding: &ForwardingTable, slot: &AtomicPtr<u8>) {
    let value = slot.load(Ordering::Relaxed);
    if value.is_null() {
        return;
    }
    if let Some(&new_value) = forwarding.get(&(value as usize)) {
        slot.store(new_value as *mut u8, Ordering::Relaxed);
    }
}

/// Rewrites slots holding old addresses of moved objects.
struct UpdatingVisitor<'a> {
    forwarding: &'a ForwardingTable,
}

impl<'a> VisitorTrait for UpdatingVisitor<'a> {
    fn visit(&mut self, _this: *const u8, _descriptor: TraceDescriptor) {}

    fn visit_member(&mut self, slot: &AtomicPtr<u8>) {
        update_slot(self.forwarding, slot);
    }

    fn visit_weak_member(&mut self, slot: &AtomicPtr<u8>) {
        update_slot(self.forwarding, slot);
    }
}

impl<'a> RootVisitor for UpdatingVisitor<'a> {
    fn visit_root_pointers(&mut self, _root: Root, _description: &str, slots: &[AtomicPtr<u8>]) {
        for slot in slots {
            update_slot(self.forwarding, slot);
        }
    }
}

/// Bump allocator over fresh pages of one space.
struct Evacuator<'a> {
    raw_heap: &'a RawHeap,
    heap: &'a HeapHandle,
    space: SpaceType,
    cursor: usize,
    limit: usize,
}

impl<'a> Evacuator<'a> {
    fn new(raw_heap: &'a RawHeap, heap: &'a HeapHandle, space: SpaceType) -> Self {
        Self {
            raw_heap,
            heap,
            space,
            cursor: 0,
            limit: 0,
        }
    }

    fn allocate(&mut self, size: usize) -> usize {
        if self.limit - self.cursor < size {
            self.seal();
            let Some(page) = NormalPage::create(self.heap.backend(), self.heap, self.space) else {
                fatal_out_of_memory("no page left to evacuate into");
            };
            let page = unsafe { page.as_ref() };
            self.raw_heap
                .add_page(PageRef::new(unsafe { NonNull::new_unchecked(page.as_base_ptr()) }));
            self.cursor = page.payload_start();
            self.limit = page.payload_end();
        }
        let result = self.cursor;
        self.cursor += size;
        result
    }

    /// Covers the unused tail of the current page with a free header.
    fn seal(&mut self) {
        if self.cursor < self.limit {
            let size = self.limit - self.cursor;
            unsafe {
                HeapObjectHeader::initialize(
                    self.cursor as *mut u8,
                    size,
                    crate::globals::FREE_LIST_GC_INFO_INDEX,
                );
                (*BasePage::from_payload(self.cursor as *const u8))
                    .as_normal()
                    .object_start_bitmap()
                    .set_bit::<NonAtomicAccess>(self.cursor);
            }
        }
        self.cursor = 0;
        self.limit = 0;
    }
}

pub struct Compactor {
    policy: Compaction,
    candidates: Vec<PageRef>,
    is_compacting: bool,
}

impl Compactor {
    pub fn new(policy: Compaction) -> Self {
        Self {
            policy,
            candidates: Vec::new(),
            is_compacting: false,
        }
    }

    pub fn is_compacting(&self) -> bool {
        self.is_compacting
    }

    pub fn set_policy(&mut self, policy: Compaction) {
        self.policy = policy;
    }

    /// Bytes of objects and fillers on `page`. Linear allocation buffers must be reset.
    fn used_bytes(page: &NormalPage) -> usize {
        let mut used = 0;
        page.for_each_header::<NonAtomicAccess>(|header| {
            if !header.is_free::<NonAtomicAccess>() {
                used += header.get_size::<NonAtomicAccess>();
            }
        });
        used
    }

    /// Picks evacuation candidates at the start of marking. Returns whether
    /// this cycle compacts.
    pub fn initialize_if_should_compact(
        &mut self,
        raw_heap: &mut RawHeap,
        stack_state: StackState,
    ) -> bool {
        debug_assert!(!self.is_compacting);
        if self.policy == Compaction::Never || stack_state == StackState::MayContainHeapPointers {
            return false;
        }
        let payload = NormalPage::payload_size();
        for space in SpaceType::NORMAL {
            let pages = raw_heap.base_space(space).pages();
            let usage = pages
                .iter()
                .map(|page| (*page, Self::used_bytes(page.get().as_normal())))
                .collect::<Vec<_>>();
            let mut selected = match self.policy {
                Compaction::Always => usage
                    .into_iter()
                    .filter(|(_, used)| *used < payload)
                    .collect::<Vec<_>>(),
                Compaction::WhenFragmented => {
                    let total = payload * usage.len();
                    let free = total - usage.iter().map(|(_, used)| used).sum::<usize>();
                    if usage.len() < 2 || (free as f64) < total as f64 * FRAGMENTATION_THRESHOLD {
                        continue;
                    }
                    usage
                        .into_iter()
                        .filter(|(_, used)| *used < payload / 2)
                        .collect()
                }
                Compaction::Never => unreachable!(),
            };
            selected.sort_by_key(|(_, used)| *used);
            let normal = raw_heap.normal_space(space);
            for (page, _) in selected {
                let base = page.get();
                base.set_evacuation_candidate(true);
                base.set_never_allocate(true);
                normal
                    .free_list
                    .evict_range(base.payload_start(), base.payload_end());
                self.candidates.push(page);
            }
        }
        if self.candidates.is_empty() {
            return false;
        }
        log::debug!("compaction selected {} candidate pages", self.candidates.len());
        self.is_compacting = true;
        true
    }

    fn release_candidates(&mut self, raw_heap: &RawHeap) {
        for page in self.candidates.drain(..) {
            page.get().set_evacuation_candidate(false);
            page.get().set_never_allocate(false);
        }
        for page in raw_heap.pages() {
            page.get().clear_remembered_slots();
        }
        self.is_compacting = false;
    }

    /// Gives up on compacting in this cycle, e.g. because the stack turned
    /// out to hold heap pointers.
    pub fn cancel(&mut self, raw_heap: &RawHeap) {
        if !self.is_compacting {
            return;
        }
        log::debug!("compaction cancelled");
        self.release_candidates(raw_heap);
    }

    /// Evacuates all candidates that were not pinned. Must run in the atomic
    /// pause after marking and weak processing. Returns the number of
    /// evacuated pages.
    pub fn compact(&mut self, raw_heap: &mut RawHeap, heap: &HeapHandle, roots: &mut RootSet) -> usize {
        if !self.is_compacting {
            return 0;
        }
        let evacuated = self
            .candidates
            .iter()
            .copied()
            .filter(|page| page.get().is_evacuation_candidate())
            .collect::<Vec<_>>();

        let mut forwarding = ForwardingTable::new();
        let mut moved = Vec::new();
        for space in SpaceType::NORMAL {
            let mut evacuator = Evacuator::new(raw_heap, heap, space);
            for page in evacuated.iter().filter(|page| page.get().space() == space) {
                page.get().as_normal().for_each_header::<NonAtomicAccess>(|header| {
                    if header.is_free::<NonAtomicAccess>() || !header.is_marked::<NonAtomicAccess>() {
                        return;
                    }
                    let size = header.get_size::<NonAtomicAccess>();
                    let destination = evacuator.allocate(size);
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            header.address() as *const u8,
                            destination as *mut u8,
                            size,
                        );
                        let target = &*BasePage::from_payload(destination as *const u8);
                        let normal = target.as_normal();
                        normal
                            .object_start_bitmap()
                            .set_bit::<NonAtomicAccess>(destination);
                        normal.marking_bitmap().set_bit::<NonAtomicAccess>(destination);
                        target.increment_live_bytes(size);
                    }
                    let new_header = destination as *const HeapObjectHeader;
                    forwarding.insert(header.payload() as usize, unsafe {
                        (*new_header).payload() as usize
                    });
                    moved.push(new_header);
                });
            }
            evacuator.seal();
        }

        let mut updater = UpdatingVisitor {
            forwarding: &forwarding,
        };

        // Recorded slots of pages that stay in place.
        for page in raw_heap.pages() {
            let page = page.get();
            if page.is_evacuation_candidate() {
                continue;
            }
            let slots = page.slot_set().lock().take();
            if slots.is_empty() {
                continue;
            }
            Self::invalidate_dead_objects(page);
            let invalidated = page.invalidated_slots().lock();
            let mut filter = InvalidatedSlotsFilter::new(&invalidated);
            for slot in slots {
                if !filter.is_valid(slot) {
                    continue;
                }
                update_slot(&forwarding, unsafe { &*(slot as *const AtomicPtr<u8>) });
            }
        }

        // Slots inside of moved objects.
        for header in moved.iter() {
            let header = unsafe { &**header };
            let mut visitor = Visitor::new(&mut updater);
            header.trace(&mut visitor);
        }

        roots.visit_strong(&mut updater, StackState::NoHeapPointers);
        roots.visit_weak(&mut updater);

        for page in evacuated.iter() {
            let base = page.get();
            base.as_normal().for_each_header::<NonAtomicAccess>(|header| {
                if !header.is_free::<NonAtomicAccess>() && !header.is_marked::<NonAtomicAccess>() {
                    header.finalize();
                }
            });
            raw_heap.remove_page(*page);
            log::trace!("evacuated page {:#x}", base.address());
            unsafe { BasePage::destroy(page.as_ptr(), heap.backend()) };
        }
        self.candidates.retain(|page| !evacuated.contains(page));
        self.release_candidates(raw_heap);
        log::debug!(
            "compaction moved {} objects off {} pages",
            moved.len(),
            evacuated.len()
        );
        evacuated.len()
    }

    /// Slots recorded in objects that died since they were recorded must not
    /// be written. Free-list entries count as dead objects.
    fn invalidate_dead_objects(page: &BasePage) {
        if page.is_large() {
            let header = unsafe { &*page.as_large().object_header() };
            if !header.is_marked::<NonAtomicAccess>() {
                page.register_invalidated_object(header, header.allocated_size::<NonAtomicAccess>());
            }
            return;
        }
        page.as_normal().for_each_header::<NonAtomicAccess>(|header| {
            if !header.is_marked::<NonAtomicAccess>() {
                page.register_invalidated_object(header, header.get_size::<NonAtomicAccess>());
            }
        });
    }
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(Compaction::Never)
    }
}
