//! Nebula: a garbage collected heap for embedding in language runtimes.
//!
//! Objects live on 256KiB pages grouped into size-bucketed spaces and carry
//! an 8 byte [`HeapObjectHeader`](header::HeapObjectHeader). Collection is
//! mark-sweep with optional compaction. Marking may run atomically,
//! incrementally or concurrently behind a Dijkstra insertion barrier, and
//! sweeping may continue on a background thread.
//!
//! ```ignore
//! let mut heap = Heap::new(Config::default());
//! let node = heap.allocate(Node::default());
//! let root = Persistent::new(&heap, Some(node));
//! heap.collect_garbage(StackState::NoHeapPointers);
//! ```

pub mod compactor;
pub mod concurrent_marker;
pub mod explicit_management;
pub mod free_list;
pub mod gc_info_table;
pub mod gcref;
pub mod globals;
pub mod header;
pub mod heap;
pub mod heap_growing;
pub mod internal;
pub mod invalidated_slots;
pub mod local_heap;
pub mod marker;
pub mod marking_visitor;
pub mod marking_worklists;
pub mod mmap;
pub mod object_allocator;
pub mod page;
pub mod page_backend;
pub mod persistent;
pub mod roots;
pub mod safepoint;
pub mod slot_set;
pub mod space;
pub mod stack;
pub mod stats_collector;
pub mod sweeper;
pub mod util;
pub mod verifier;
pub mod visitor;
pub mod write_barrier;

#[cfg(test)]
mod tests;

use compactor::Compaction;
use gc_info_table::GCInfoTable;
use globals::{DEFAULT_HEAP_RESERVATION, MB};
use stats_collector::{MarkingType, SweepingType};

pub struct GCPlatform;

impl GCPlatform {
    /// Initializes global state for GC. Calling it is optional, the
    /// state is created lazily otherwise.
    pub fn initialize() {
        let table = GCInfoTable::global();
        log::trace!(
            "GC platform initialized, {} reserved for type info",
            util::formatted_size(table.reserved_bytes())
        );
    }
}

/// Configuration for heap constructor.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the virtual address range all pages are carved from.
    pub heap_reservation: usize,
    /// Allocated object size that triggers the first collection.
    pub initial_heap_limit: usize,
    /// How fast heap threshold should grow relative to the live size
    pub heap_growth_factor: f64,
    /// Fraction of the atomic limit at which incremental marking starts.
    pub incremental_start_ratio: f64,
    pub marking_type: MarkingType,
    pub sweeping_type: SweepingType,
    pub compaction: Compaction,
    /// Background marking threads used by [`MarkingType::IncrementalAndConcurrent`].
    pub concurrent_marking_tasks: usize,
    /// Time budget of a single incremental marking step.
    pub incremental_step_duration_us: u64,
    /// Cross-check marking results after every cycle. Slow.
    pub verify_heap: bool,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heap_reservation: DEFAULT_HEAP_RESERVATION,
            initial_heap_limit: 4 * MB,
            heap_growth_factor: 1.5,
            incremental_start_ratio: 0.8,
            marking_type: MarkingType::Atomic,
            sweeping_type: SweepingType::Atomic,
            compaction: Compaction::Never,
            concurrent_marking_tasks: 2,
            incremental_step_duration_us: 500,
            verify_heap: false,
            verbose: false,
        }
    }
}

pub mod c_api {

    use std::{
        ptr::null_mut,
        sync::atomic::AtomicPtr,
    };

    use crate::{
        gc_info_table::{GCInfo, GCInfoTable},
        gcref::UntypedGcRef,
        header::HeapObjectHeader,
        heap::Heap,
        internal::{
            finalize_trait::FinalizationCallback, gc_info::GCInfoIndex,
            trace_trait::TraceCallback,
        },
        stack::StackState,
        visitor::Visitor,
        write_barrier::WriteBarrier,
        Config, GCPlatform,
    };

    fn any_slot_is_valid(_payload: *const u8, _offset: usize) -> bool {
        true
    }

    #[no_mangle]
    pub extern "C" fn nebula_default_config() -> Config {
        Config::default()
    }

    #[no_mangle]
    pub extern "C" fn nebula_init() {
        GCPlatform::initialize();
    }

    #[no_mangle]
    pub extern "C" fn nebula_heap_create(config: Config) -> *mut Heap {
        Box::into_raw(Heap::new(config))
    }

    /// Free nebula heap. Every remaining object is finalized.
    #[no_mangle]
    pub extern "C" fn nebula_heap_free(heap: *mut Heap) {
        if heap.is_null() {
            return;
        }
        unsafe {
            drop(Box::from_raw(heap));
        }
    }

    /// Allocates an object and returns its payload. NULL is returned if no
    /// memory is available. The object stays in construction until
    /// [`nebula_mark_fully_constructed`] is called.
    #[no_mangle]
    pub extern "C" fn nebula_heap_allocate(heap: *mut Heap, size: usize, index: GCInfoIndex) -> *mut u8 {
        unsafe {
            match (*heap).try_allocate_raw(size, index) {
                Some(object) => object.get(),
                None => null_mut(),
            }
        }
    }

    /// Allocates an object and returns its payload. When no memory is left
    /// process is aborted.
    #[no_mangle]
    pub extern "C" fn nebula_heap_allocate_or_fail(
        heap: *mut Heap,
        size: usize,
        index: GCInfoIndex,
    ) -> *mut u8 {
        unsafe { (*heap).allocate_raw(size, index).get() }
    }

    #[no_mangle]
    pub extern "C" fn nebula_mark_fully_constructed(payload: *mut u8) {
        unsafe { (*HeapObjectHeader::from_payload(payload)).mark_as_fully_constructed() }
    }

    /// Runs a full collection. `stack_may_contain_pointers` selects whether
    /// the calling thread's stack is scanned conservatively.
    #[no_mangle]
    pub extern "C" fn nebula_heap_collect(heap: *mut Heap, stack_may_contain_pointers: bool) {
        let stack_state = if stack_may_contain_pointers {
            StackState::MayContainHeapPointers
        } else {
            StackState::NoHeapPointers
        };
        unsafe { (*heap).collect_garbage(stack_state) }
    }

    /// Freeing NULL succeeds and does nothing.
    #[no_mangle]
    pub extern "C" fn nebula_heap_try_free(heap: *mut Heap, payload: *mut u8) -> bool {
        if payload.is_null() {
            return true;
        }
        unsafe { (*heap).try_free(UntypedGcRef::from_payload(payload)) }
    }

    #[no_mangle]
    pub extern "C" fn nebula_heap_resize(heap: *mut Heap, payload: *mut u8, new_size: usize) -> bool {
        if payload.is_null() {
            return false;
        }
        unsafe { (*heap).resize(UntypedGcRef::from_payload(payload), new_size) }
    }

    /// Stores `value` into `slot` of the object at `object` and runs the
    /// write barrier.
    #[no_mangle]
    pub extern "C" fn nebula_write_member(object: *const u8, slot: *const AtomicPtr<u8>, value: *mut u8) {
        unsafe {
            (*slot).store(value, std::sync::atomic::Ordering::Relaxed);
            WriteBarrier::record_slot(object, &*slot, value);
        }
    }

    #[no_mangle]
    pub extern "C" fn nebula_trace(vis: *mut Visitor, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        unsafe { (*vis).trace_untyped(UntypedGcRef::from_payload(payload)) }
    }

    #[no_mangle]
    pub extern "C" fn nebula_trace_conservatively(vis: *mut Visitor, from: *const u8, to: *const u8) {
        unsafe { (*vis).trace_conservatively(from, to) }
    }

    /// Registers a foreign type. Every slot recorded in its objects is
    /// considered valid.
    #[no_mangle]
    pub extern "C" fn nebula_add_gc_info(
        trace: TraceCallback,
        finalize: Option<FinalizationCallback>,
    ) -> GCInfoIndex {
        GCInfoTable::global().add_gc_info(GCInfo {
            finalize,
            trace,
            is_valid_slot: any_slot_is_valid,
            name: "<foreign>",
        })
    }
}
