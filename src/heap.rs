//! The heap: owns all spaces and drives garbage collection cycles.
//!
//! A cycle moves through [`GcPhase::Marking`] (possibly spread over many
//! incremental steps), a short [`GcPhase::AtomicPause`] in which marking is
//! completed and pages may be compacted, and [`GcPhase::Sweeping`], which may
//! continue on a background thread while the mutator allocates.

use std::{
    mem::{align_of, size_of},
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    compactor::Compactor,
    explicit_management::ExplicitManagement,
    gcref::{GcRef, UntypedGcRef},
    heap_growing::{GcTrigger, HeapGrowing},
    internal::{
        finalize_trait::FinalizeTrait, gc_info::GCInfoIndex, gc_info::GCInfoTrait,
        trace_trait::TraceTrait,
    },
    local_heap::LocalHeap,
    marker::{Marker, MarkingConfig},
    marking_worklists::MarkingWorklists,
    object_allocator::{allocation_size, is_large_allocation, ObjectAllocator},
    page::BasePage,
    page_backend::PageBackend,
    persistent::PersistentRegion,
    roots::{RootSet, RootSource},
    safepoint::{GlobalSafepoint, SafepointScope},
    space::{RawHeap, SpaceType},
    stack::StackState,
    stats_collector::{HeapStatistics, MarkingType, StatsCollector, SweepingType},
    sweeper::Sweeper,
    util::{fatal_out_of_memory, formatted_size},
    Config,
};

/// State shared between the heap, its pages, write barriers and marking
/// threads. Every page points back to the handle of its heap.
pub struct HeapHandle {
    backend: PageBackend,
    worklists: MarkingWorklists,
    marking: AtomicBool,
    compacting: AtomicBool,
    in_atomic_pause: AtomicBool,
    sweeping: AtomicBool,
    no_gc_scopes: AtomicUsize,
}

unsafe impl Send for HeapHandle {}
unsafe impl Sync for HeapHandle {}

impl HeapHandle {
    pub(crate) fn new(backend: PageBackend) -> Self {
        Self {
            backend,
            worklists: MarkingWorklists::new(),
            marking: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            in_atomic_pause: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            no_gc_scopes: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn backend(&self) -> &PageBackend {
        &self.backend
    }

    #[inline(always)]
    pub fn worklists(&self) -> &MarkingWorklists {
        &self.worklists
    }

    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub(crate) fn set_marking(&self, value: bool) {
        self.marking.store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub(crate) fn set_compacting(&self, value: bool) {
        self.compacting.store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn in_atomic_pause(&self) -> bool {
        self.in_atomic_pause.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_atomic_pause(&self, value: bool) {
        self.in_atomic_pause.store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    pub(crate) fn set_sweeping(&self, value: bool) {
        self.sweeping.store(value, Ordering::Release);
    }

    pub fn is_gc_forbidden(&self) -> bool {
        self.no_gc_scopes.load(Ordering::Acquire) > 0
    }
}

/// Forbids garbage collections started by allocation while alive.
/// Explicit [`Heap::collect_garbage`] calls are ignored as well.
pub struct NoGarbageCollectionScope {
    handle: Arc<HeapHandle>,
}

impl NoGarbageCollectionScope {
    pub fn new(heap: &Heap) -> Self {
        heap.handle.no_gc_scopes.fetch_add(1, Ordering::AcqRel);
        Self {
            handle: heap.handle.clone(),
        }
    }
}

impl Drop for NoGarbageCollectionScope {
    fn drop(&mut self) {
        self.handle.no_gc_scopes.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    NotStarted,
    Marking,
    AtomicPause,
    Sweeping,
}

pub struct Heap {
    config: Config,
    handle: Arc<HeapHandle>,
    raw_heap: RawHeap,
    marker: Marker,
    sweeper: Sweeper,
    compactor: Compactor,
    roots: RootSet,
    stats: StatsCollector,
    growing: HeapGrowing,
    safepoint: Arc<GlobalSafepoint>,
}

impl Heap {
    /// Creates a heap owned by the calling thread. Its stack is the one
    /// scanned conservatively.
    pub fn new(config: Config) -> Box<Self> {
        let Some(backend) = PageBackend::new(config.heap_reservation) else {
            fatal_out_of_memory("could not reserve the heap cage");
        };
        let handle = Arc::new(HeapHandle::new(backend));
        let this = Box::new(Self {
            raw_heap: RawHeap::new(),
            marker: Marker::new(handle.clone()),
            sweeper: Sweeper::new(),
            compactor: Compactor::new(config.compaction),
            roots: RootSet::new(),
            stats: StatsCollector::new(),
            growing: HeapGrowing::new(&config),
            safepoint: Arc::new(GlobalSafepoint::new()),
            handle,
            config,
        });
        log::debug!(
            "heap created: {} reserved, marking {:?}, sweeping {:?}, compaction {:?}",
            formatted_size(this.handle.backend().reserved_bytes()),
            this.config.marking_type,
            this.config.sweeping_type,
            this.config.compaction
        );
        this
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handle(&self) -> &HeapHandle {
        &self.handle
    }

    pub fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    /// Registers a new local heap for a background thread. It starts parked.
    pub fn create_local_heap(&self) -> LocalHeap {
        LocalHeap::new(self.safepoint.clone())
    }

    pub fn add_root_source(&mut self, source: impl RootSource + 'static) {
        self.roots.add_source(Box::new(source));
    }

    pub fn strong_persistent_region(&self) -> &Arc<PersistentRegion> {
        self.roots.strong_persistents()
    }

    pub fn weak_persistent_region(&self) -> &Arc<PersistentRegion> {
        self.roots.weak_persistents()
    }

    pub fn cross_thread_persistent_region(&self) -> &Arc<PersistentRegion> {
        self.roots.cross_thread_persistents()
    }

    pub fn phase(&self) -> GcPhase {
        if self.handle.in_atomic_pause() {
            GcPhase::AtomicPause
        } else if self.marker.is_marking() {
            GcPhase::Marking
        } else if self.sweeper.is_in_progress() {
            GcPhase::Sweeping
        } else {
            GcPhase::NotStarted
        }
    }

    pub fn is_marking(&self) -> bool {
        self.marker.is_marking()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_in_progress()
    }

    /// Allocates and constructs a `T`.
    pub fn allocate<T: GCInfoTrait<T> + TraceTrait + FinalizeTrait<T> + 'static>(
        &mut self,
        value: T,
    ) -> GcRef<T> {
        debug_assert!(align_of::<T>() <= crate::globals::ALLOCATION_GRANULARITY);
        let object = self.allocate_raw(size_of::<T>(), <T as GCInfoTrait<T>>::index());
        unsafe {
            object.get().cast::<T>().write(value);
            object.header().mark_as_fully_constructed();
            object.cast_unchecked()
        }
    }

    /// Allocates `size` zeroed payload bytes for an object of type
    /// `gc_info_index`. The object stays in construction until
    /// [`HeapObjectHeader::mark_as_fully_constructed`](crate::header::HeapObjectHeader::mark_as_fully_constructed)
    /// is called. Aborts the process when no memory can be found.
    pub fn allocate_raw(&mut self, size: usize, gc_info_index: GCInfoIndex) -> UntypedGcRef {
        match self.try_allocate_raw(size, gc_info_index) {
            Some(object) => object,
            None => fatal_out_of_memory("allocation failed after garbage collection"),
        }
    }

    /// Like [`allocate_raw`](Heap::allocate_raw) but returns `None` when no
    /// memory can be found.
    pub fn try_allocate_raw(&mut self, size: usize, gc_info_index: GCInfoIndex) -> Option<UntypedGcRef> {
        let allocation_size = allocation_size(size);
        let payload = if is_large_allocation(allocation_size) {
            self.allocate_large(allocation_size, gc_info_index)?
        } else {
            let space = SpaceType::for_normal_size(allocation_size);
            match ObjectAllocator::new(&mut self.raw_heap, &self.handle, &mut self.stats)
                .allocate_from_lab(space, allocation_size, gc_info_index)
            {
                Some(payload) => payload,
                None => self.allocate_slow(space, allocation_size, gc_info_index)?,
            }
        };
        Some(unsafe { UntypedGcRef::from_payload(payload.as_ptr()) })
    }

    fn allocate_large(&mut self, allocation_size: usize, gc_info_index: GCInfoIndex) -> Option<NonNull<u8>> {
        self.on_allocation_slow_path();
        if let Some(payload) = ObjectAllocator::new(&mut self.raw_heap, &self.handle, &mut self.stats)
            .allocate_large(allocation_size, gc_info_index)
        {
            return Some(payload);
        }
        if !self.collect_for_allocation() {
            return None;
        }
        ObjectAllocator::new(&mut self.raw_heap, &self.handle, &mut self.stats)
            .allocate_large(allocation_size, gc_info_index)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(
        &mut self,
        space: SpaceType,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<u8>> {
        self.on_allocation_slow_path();

        if self.sweeper.is_in_progress()
            && self
                .sweeper
                .sweep_for_allocation(&mut self.raw_heap, &self.handle, space, allocation_size)
        {
            if let Some(payload) = self.allocate_from_free_list(space, allocation_size, gc_info_index) {
                return Some(payload);
            }
        }
        if let Some(payload) = self.allocate_from_free_list(space, allocation_size, gc_info_index) {
            return Some(payload);
        }
        if self.sweeper.is_in_progress() {
            self.finish_sweeping();
            if let Some(payload) = self.allocate_from_free_list(space, allocation_size, gc_info_index) {
                return Some(payload);
            }
        }
        if let Some(payload) = self.allocate_from_new_page(space, allocation_size, gc_info_index) {
            return Some(payload);
        }
        if !self.collect_for_allocation() {
            return None;
        }
        if let Some(payload) = self.allocate_from_free_list(space, allocation_size, gc_info_index) {
            return Some(payload);
        }
        self.allocate_from_new_page(space, allocation_size, gc_info_index)
    }

    fn allocate_from_free_list(
        &mut self,
        space: SpaceType,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<u8>> {
        let mut allocator = ObjectAllocator::new(&mut self.raw_heap, &self.handle, &mut self.stats);
        if !allocator.refill_lab_from_free_list(space, allocation_size) {
            return None;
        }
        allocator.allocate_from_lab(space, allocation_size, gc_info_index)
    }

    fn allocate_from_new_page(
        &mut self,
        space: SpaceType,
        allocation_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<u8>> {
        let mut allocator = ObjectAllocator::new(&mut self.raw_heap, &self.handle, &mut self.stats);
        if !allocator.refill_lab_from_new_page(space) {
            return None;
        }
        allocator.allocate_from_lab(space, allocation_size, gc_info_index)
    }

    /// Last resort of the allocation slow path. Returns whether a collection ran.
    fn collect_for_allocation(&mut self) -> bool {
        if self.handle.is_gc_forbidden() {
            return false;
        }
        log::debug!("allocation failed, collecting garbage");
        self.collect(StackState::MayContainHeapPointers, false);
        self.finish_sweeping();
        true
    }

    /// Consults the growing heuristics and makes progress on a running cycle.
    fn on_allocation_slow_path(&mut self) {
        if self.handle.is_gc_forbidden() || self.handle.in_atomic_pause() {
            return;
        }
        if self.sweeper.is_in_progress() {
            self.sweeper
                .finalize_concurrently_swept(&mut self.raw_heap, &self.handle);
            if self.sweeper.is_concurrent_sweeping_done() {
                self.finish_sweeping();
            }
        }
        let supports_incremental = self.config.marking_type != MarkingType::Atomic;
        match self
            .growing
            .check(self.stats.allocated_object_size(), supports_incremental)
        {
            GcTrigger::Atomic => {
                self.collect(StackState::MayContainHeapPointers, false);
                return;
            }
            GcTrigger::StartIncremental if !self.marker.is_marking() => {
                self.start_marking(self.config.marking_type, false);
            }
            _ => {}
        }
        if self.marker.is_marking() {
            let step = Duration::from_micros(self.config.incremental_step_duration_us);
            if self.marker.advance(step) {
                self.finalize_marking(StackState::MayContainHeapPointers);
            }
        }
        self.stats.notify_safepoint();
    }

    /// Runs a full garbage collection cycle. A cycle that is already marking
    /// is finished instead. Returns without collecting inside of a
    /// [`NoGarbageCollectionScope`]. Sweeping is completed before returning.
    pub fn collect_garbage(&mut self, stack_state: StackState) {
        if self.handle.is_gc_forbidden() {
            log::debug!("garbage collection requested in a no-GC scope, ignoring");
            return;
        }
        self.collect(stack_state, true);
        self.finish_sweeping();
    }

    fn collect(&mut self, stack_state: StackState, forced: bool) {
        if !self.marker.is_marking() {
            self.finish_sweeping();
            self.prepare_cycle(MarkingType::Atomic, stack_state, forced);
            let config = self.marking_config(MarkingType::Atomic);
            self.marker.start(&self.raw_heap, &mut self.roots, config);
        }
        self.finalize_marking(stack_state);
    }

    fn marking_config(&self, marking_type: MarkingType) -> MarkingConfig {
        MarkingConfig {
            marking_type,
            concurrent_tasks: self.config.concurrent_marking_tasks,
            verify: self.config.verify_heap,
        }
    }

    fn prepare_cycle(&mut self, marking_type: MarkingType, stack_state: StackState, forced: bool) {
        debug_assert!(!self.sweeper.is_in_progress());
        self.raw_heap.reset_labs();
        let compacting = self
            .compactor
            .initialize_if_should_compact(&mut self.raw_heap, stack_state);
        self.handle.set_compacting(compacting);
        self.stats
            .notify_marking_started(marking_type, self.config.sweeping_type, forced);
    }

    fn start_marking(&mut self, marking_type: MarkingType, forced: bool) {
        self.finish_sweeping();
        // The final pause decides whether the stack holds heap pointers.
        // Compaction is cancelled there if it does.
        self.prepare_cycle(marking_type, StackState::NoHeapPointers, forced);
        let config = self.marking_config(marking_type);
        self.marker.start(&self.raw_heap, &mut self.roots, config);
    }

    /// Starts an incremental cycle unless one is running already. Returns
    /// whether marking is in progress afterwards.
    pub fn start_incremental_marking(&mut self) -> bool {
        if self.marker.is_marking() {
            return true;
        }
        if self.handle.is_gc_forbidden() {
            return false;
        }
        let marking_type = match self.config.marking_type {
            MarkingType::Atomic => MarkingType::Incremental,
            marking_type => marking_type,
        };
        self.start_marking(marking_type, true);
        true
    }

    /// Runs one marking step bounded by `deadline`. Returns true when all
    /// marking work is done and the cycle can be finalized.
    pub fn advance_incremental_marking(&mut self, deadline: Duration) -> bool {
        if !self.marker.is_marking() {
            return true;
        }
        self.marker.advance(deadline)
    }

    pub fn finalize_incremental_marking(&mut self, stack_state: StackState) {
        if self.marker.is_marking() {
            self.finalize_marking(stack_state);
        }
    }

    fn finalize_marking(&mut self, stack_state: StackState) {
        let safepoint = self.safepoint.clone();
        let _scope = SafepointScope::new(&safepoint);
        self.handle.set_in_atomic_pause(true);
        let pause_start = self.stats.notify_atomic_pause_started();
        log::debug!("entering atomic pause ({:?})", stack_state);

        self.raw_heap.reset_labs();
        if stack_state == StackState::MayContainHeapPointers && self.compactor.is_compacting() {
            self.compactor.cancel(&self.raw_heap);
            self.handle.set_compacting(false);
        }
        let result = self.marker.finish(&self.raw_heap, &mut self.roots, stack_state);
        let compacted = self
            .compactor
            .compact(&mut self.raw_heap, &self.handle, &mut self.roots);
        self.handle.set_compacting(false);

        self.stats.notify_marking_completed(
            result.marked_bytes,
            result.objects_found_conservatively,
            pause_start,
        );
        self.stats.notify_compaction(compacted);
        self.stats
            .notify_memory_before_sweep(self.handle.backend().committed_bytes());
        self.growing.configure_limits(result.marked_bytes);
        self.handle.set_in_atomic_pause(false);

        self.handle.set_sweeping(true);
        self.sweeper.start(&mut self.raw_heap, self.config.sweeping_type);
        if self.config.sweeping_type == SweepingType::Atomic {
            self.finish_sweeping();
        }
    }

    /// Completes a running sweep on the calling thread.
    pub fn finish_sweeping(&mut self) {
        if !self.sweeper.is_in_progress() {
            return;
        }
        let swept = self.sweeper.finish(&mut self.raw_heap, &self.handle);
        self.stats.notify_swept(swept);
        let event = self.stats.notify_sweeping_completed();
        self.handle.set_sweeping(false);
        if self.config.verbose {
            log::info!(
                "GC #{}{}: marked {} ({} conservative), swept {}, compacted {} pages, committed {}, pause {:?}, marking {:?}, sweeping {:?}",
                event.epoch,
                if event.is_forced { " (forced)" } else { "" },
                formatted_size(event.marked_bytes),
                event.objects_found_conservatively,
                formatted_size(event.swept_bytes),
                event.compacted_pages,
                formatted_size(event.memory_size_before_sweep),
                event.atomic_pause_time,
                event.marking_time,
                event.sweeping_time
            );
        } else {
            log::debug!(
                "GC #{} done: marked {}, swept {}",
                event.epoch,
                formatted_size(event.marked_bytes),
                formatted_size(event.swept_bytes)
            );
        }
    }

    /// Immediately reclaims `object`. The caller guarantees that nothing
    /// references it anymore. Returns false when the heap is marking or
    /// sweeping, in which case nothing happens.
    pub fn try_free(&mut self, object: UntypedGcRef) -> bool {
        ExplicitManagement {
            raw_heap: &mut self.raw_heap,
            heap: &self.handle,
            stats: &mut self.stats,
        }
        .try_free(object.get())
    }

    /// Grows or shrinks `object` in place to hold `new_size` payload bytes.
    /// Returns false when the object could not be resized.
    pub fn resize(&mut self, object: UntypedGcRef, new_size: usize) -> bool {
        ExplicitManagement {
            raw_heap: &mut self.raw_heap,
            heap: &self.handle,
            stats: &mut self.stats,
        }
        .resize(object.get(), new_size)
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut normal_pages = 0;
        let mut large_pages = 0;
        for space in SpaceType::ALL {
            let count = self.raw_heap.base_space(space).len();
            if space.is_large() {
                large_pages += count;
            } else {
                normal_pages += count;
            }
        }
        let previous = self.stats.previous_event();
        HeapStatistics {
            committed_memory: self.handle.backend().committed_bytes(),
            reserved_memory: self.handle.backend().reserved_bytes(),
            allocated_object_size: self.stats.allocated_object_size(),
            free_list_size: self.raw_heap.free_list_bytes(),
            normal_pages,
            large_pages,
            total_gc_cycles_count: previous.map_or(0, |event| event.epoch),
            total_allocated_bytes: self.stats.total_allocated_bytes(),
            total_allocated_objects: self.stats.total_allocated_objects(),
            total_explicitly_freed_bytes: self.stats.total_explicitly_freed_bytes(),
            total_swept_bytes: self.stats.total_swept_bytes(),
            last_marked_bytes: previous.map_or(0, |event| event.marked_bytes),
            last_objects_found_conservatively: previous
                .map_or(0, |event| event.objects_found_conservatively),
            heap_limit: self.growing.limit_for_atomic_gc(),
        }
    }

    /// Free bytes of the space objects of `size` payload bytes are allocated in.
    pub fn free_list_size_for_testing(&self, size: usize) -> usize {
        let space = SpaceType::for_normal_size(allocation_size(size));
        self.raw_heap.normal_space_ref(space).free_list().available()
    }

    /// Whether `object` lies in a free-list entry of its space.
    pub fn is_on_free_list_for_testing(&self, address: usize) -> bool {
        let page = self.handle.backend().lookup(address);
        if page.is_null() {
            return false;
        }
        let page = unsafe { &*page };
        !page.is_large()
            && self
                .raw_heap
                .normal_space_ref(page.space())
                .free_list()
                .contains(address)
    }

    pub fn set_in_atomic_pause_for_testing(&mut self, value: bool) {
        self.handle.set_in_atomic_pause(value);
    }

    pub fn page_count_for_testing(&self) -> usize {
        self.raw_heap.page_count()
    }

    /// Runs the accounting check of every normal space's free list.
    pub fn verify_free_lists_for_testing(&self) -> bool {
        SpaceType::NORMAL
            .into_iter()
            .all(|space| self.raw_heap.normal_space_ref(space).free_list().verify())
    }

    /// Releases every page. Remaining objects are finalized without any
    /// further marking.
    fn terminate(&mut self) {
        if self.marker.is_marking() {
            self.finalize_marking(StackState::NoHeapPointers);
        }
        self.finish_sweeping();
        self.roots.strong_persistents().clear_all();
        self.roots.weak_persistents().clear_all();
        self.roots.cross_thread_persistents().clear_all();
        self.raw_heap.reset_labs();
        self.raw_heap.for_each_object(|header| {
            if !header.is_in_construction::<crate::internal::access_mode::NonAtomicAccess>() {
                header.finalize();
            }
        });
        for page in self.raw_heap.pages() {
            self.raw_heap.remove_page(page);
            unsafe { BasePage::destroy(page.as_ptr(), self.handle.backend()) };
        }
        log::debug!("heap terminated");
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.terminate();
    }
}
