use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    time::Duration,
};

use crate::{
    compactor::Compaction,
    gcref::{GcRef, Member, WeakMember},
    heap::{GcPhase, Heap, NoGarbageCollectionScope},
    internal::{access_mode::NonAtomicAccess, finalize_trait::FinalizeTrait, trace_trait::TraceTrait},
    persistent::{Persistent, WeakPersistent},
    stack::StackState,
    stats_collector::{MarkingType, SweepingType},
    visitor::Visitor,
    Config,
};

struct Node {
    next: Member<Node>,
    weak: WeakMember<Node>,
    value: usize,
    drops: Arc<AtomicUsize>,
}

impl Node {
    fn new(value: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            next: Member::null(),
            weak: WeakMember::null(),
            value,
            drops: drops.clone(),
        }
    }
}

impl TraceTrait for Node {
    fn trace(&self, vis: &mut Visitor) {
        self.next.trace(vis);
        self.weak.trace(vis);
    }
}

impl FinalizeTrait<Node> for Node {}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

struct Buffer(#[allow(dead_code)] [u64; 8]);

impl TraceTrait for Buffer {}
impl FinalizeTrait<Buffer> for Buffer {}

struct Blob {
    data: [u64; 20_000],
}

impl TraceTrait for Blob {}
impl FinalizeTrait<Blob> for Blob {}

fn heap_with(config: Config) -> Box<Heap> {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(config)
}

fn atomic_heap() -> Box<Heap> {
    heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        ..Default::default()
    })
}

fn chain(heap: &mut Heap, length: usize, drops: &Arc<AtomicUsize>) -> GcRef<Node> {
    let head = heap.allocate(Node::new(0, drops));
    let mut tail = head;
    for value in 1..length {
        let node = heap.allocate(Node::new(value, drops));
        tail.next.set(Some(node));
        tail = node;
    }
    head
}

fn chain_length(head: Option<GcRef<Node>>) -> usize {
    let mut length = 0;
    let mut current = head;
    while let Some(node) = current {
        assert_eq!(node.value, length);
        length += 1;
        current = node.next.get();
    }
    length
}

#[test]
fn test_unreachable_objects_are_finalized() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 10, &drops);
    let root = Persistent::new(&heap, Some(head));
    chain(&mut heap, 5, &drops);

    heap.collect_garbage(StackState::NoHeapPointers);
    assert_eq!(drops.load(Ordering::Relaxed), 5);
    assert_eq!(chain_length(root.get()), 10);
    assert_eq!(heap.phase(), GcPhase::NotStarted);

    root.clear();
    heap.collect_garbage(StackState::NoHeapPointers);
    assert_eq!(drops.load(Ordering::Relaxed), 15);
}

#[test]
fn test_dead_small_objects_end_up_on_the_free_list() {
    let mut heap = atomic_heap();
    let objects = [
        heap.allocate(1u64),
        heap.allocate(2u64),
        heap.allocate(3u64),
        heap.allocate(4u64),
    ];
    for object in objects.iter() {
        assert_eq!(object.header().allocated_size::<NonAtomicAccess>(), 16);
    }
    let first = Persistent::new(&heap, Some(objects[0]));
    let third = Persistent::new(&heap, Some(objects[2]));

    heap.collect_garbage(StackState::NoHeapPointers);

    assert!(heap.is_on_free_list_for_testing(objects[1].header().address()));
    assert!(heap.is_on_free_list_for_testing(objects[3].header().address()));
    assert!(heap.free_list_size_for_testing(8) >= 32);
    for (root, value) in [(&first, 1u64), (&third, 3u64)] {
        let object = root.get().unwrap();
        assert_eq!(*object, value);
        assert_eq!(object.header().allocated_size::<NonAtomicAccess>(), 16);
        assert!(!heap.is_on_free_list_for_testing(object.header().address()));
    }
}

#[test]
fn test_try_free_is_refused_in_atomic_pause() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let node = heap.allocate(Node::new(7, &drops));
    let size = node.header().allocated_size::<NonAtomicAccess>();
    let marked = node.header().is_marked::<NonAtomicAccess>();

    heap.set_in_atomic_pause_for_testing(true);
    assert!(!heap.try_free(node.downcast()));
    heap.set_in_atomic_pause_for_testing(false);

    assert_eq!(node.header().allocated_size::<NonAtomicAccess>(), size);
    assert_eq!(node.header().is_marked::<NonAtomicAccess>(), marked);
    assert!(!node.header().is_free::<NonAtomicAccess>());
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    assert!(heap.try_free(node.downcast()));
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn test_freed_object_in_front_of_buffer_is_reused() {
    let mut heap = atomic_heap();
    let first = heap.allocate(Buffer([1; 8]));
    let second = heap.allocate(Buffer([2; 8]));
    let address = second.as_ptr();
    assert!(heap.try_free(second.downcast()));
    let third = heap.allocate(Buffer([3; 8]));
    assert_eq!(third.as_ptr(), address);
    assert_ne!(first.as_ptr(), third.as_ptr());
    let statistics = heap.statistics();
    assert_eq!(statistics.total_explicitly_freed_bytes, 72);
    assert_eq!(statistics.allocated_object_size, 2 * 72);
}

#[test]
fn test_free_list_accounting_after_explicit_management() {
    let mut heap = atomic_heap();
    let objects = (0..8)
        .map(|value| heap.allocate(Buffer([value; 8])))
        .collect::<Vec<_>>();
    let _roots = [0, 1, 3, 4, 5]
        .iter()
        .map(|&index| Persistent::new(&heap, Some(objects[index])))
        .collect::<Vec<_>>();

    // The last object sits in front of the buffer and merges into it.
    let last = objects[7].header().address();
    assert!(heap.try_free(objects[7].downcast()));
    assert!(!heap.is_on_free_list_for_testing(last));
    assert!(heap.try_free(objects[2].downcast()));
    assert!(heap.is_on_free_list_for_testing(objects[2].header().address()));

    let shrunk = objects[4].header();
    assert!(heap.resize(objects[4].downcast(), 16));
    assert_eq!(shrunk.allocated_size::<NonAtomicAccess>(), 24);
    assert!(heap.is_on_free_list_for_testing(shrunk.address() + 24));
    assert_eq!(heap.free_list_size_for_testing(64), 72 + 48);
    assert!(heap.verify_free_lists_for_testing());

    heap.collect_garbage(StackState::NoHeapPointers);
    assert!(heap.is_on_free_list_for_testing(objects[6].header().address()));
    assert!(heap.verify_free_lists_for_testing());
    assert_eq!(shrunk.allocated_size::<NonAtomicAccess>(), 24);
}

#[test]
fn test_resize_is_refused_while_marking() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        marking_type: MarkingType::Incremental,
        ..Default::default()
    });
    let buffer = heap.allocate(Buffer([0; 8]));
    let root = Persistent::new(&heap, Some(buffer));
    heap.allocate(Buffer([1; 8]));

    assert!(heap.start_incremental_marking());
    while !heap.advance_incremental_marking(Duration::from_millis(10)) {}
    assert!(buffer.header().is_marked::<NonAtomicAccess>());
    assert!(!heap.resize(buffer.downcast(), 8));
    assert!(!heap.resize(buffer.downcast(), 128));
    assert!(!heap.try_free(buffer.downcast()));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 72);
    assert!(buffer.header().is_marked::<NonAtomicAccess>());

    heap.finalize_incremental_marking(StackState::NoHeapPointers);
    heap.finish_sweeping();
    assert!(GcRef::ptr_eq(root.get().unwrap(), buffer));
    assert!(heap.resize(buffer.downcast(), 8));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 16);
}

#[test]
fn test_try_free_while_sweeping_is_refused() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        sweeping_type: SweepingType::IncrementalAndConcurrent,
        ..Default::default()
    });
    let object = heap.allocate(5u64);
    let root = Persistent::new(&heap, Some(object));
    assert!(heap.start_incremental_marking());
    while !heap.advance_incremental_marking(Duration::from_millis(10)) {}
    heap.finalize_incremental_marking(StackState::NoHeapPointers);
    assert_eq!(heap.phase(), GcPhase::Sweeping);
    assert!(!heap.try_free(object.downcast()));
    heap.finish_sweeping();
    assert_eq!(heap.phase(), GcPhase::NotStarted);
    root.clear();
    assert!(heap.try_free(object.downcast()));
}

#[test]
fn test_resize_in_place() {
    let mut heap = atomic_heap();
    let buffer = heap.allocate(Buffer([0; 8]));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 72);

    assert!(heap.resize(buffer.downcast(), 128));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 136);
    assert!(heap.resize(buffer.downcast(), 8));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 16);

    let _blocker = heap.allocate(Buffer([0; 8]));
    assert!(!heap.resize(buffer.downcast(), 128));
    assert_eq!(buffer.header().allocated_size::<NonAtomicAccess>(), 16);
}

#[test]
fn test_weak_references_are_cleared() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let holder = heap.allocate(Node::new(0, &drops));
    let target = heap.allocate(Node::new(1, &drops));
    holder.weak.set(Some(target));
    let root = Persistent::new(&heap, Some(holder));
    let weak = WeakPersistent::new(&heap, Some(target));
    let weak_holder = WeakPersistent::new(&heap, Some(holder));

    heap.collect_garbage(StackState::NoHeapPointers);

    assert!(root.get().unwrap().weak.is_null());
    assert!(weak.is_empty());
    assert!(!weak_holder.is_empty());
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn test_weak_reference_to_live_object_survives() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let holder = heap.allocate(Node::new(0, &drops));
    let target = heap.allocate(Node::new(1, &drops));
    holder.weak.set(Some(target));
    let _root = Persistent::new(&heap, Some(holder));
    let _strong = Persistent::new(&heap, Some(target));

    heap.collect_garbage(StackState::NoHeapPointers);

    assert!(GcRef::ptr_eq(holder.weak.get().unwrap(), target));
    assert_eq!(drops.load(Ordering::Relaxed), 0);
}

#[test]
fn test_incremental_marking_write_barrier() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        marking_type: MarkingType::Incremental,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let holder = heap.allocate(Node::new(0, &drops));
    let hidden = heap.allocate(Node::new(1, &drops));
    let root = Persistent::new(&heap, Some(holder));

    assert!(heap.start_incremental_marking());
    assert_eq!(heap.phase(), GcPhase::Marking);
    while !heap.advance_incremental_marking(Duration::from_millis(10)) {}

    // The holder is already black. Only the barrier can save the target.
    holder.next.set(Some(hidden));
    {
        // Keeps the allocation slow path from finishing the cycle itself.
        let _scope = NoGarbageCollectionScope::new(&heap);
        let garbage = heap.allocate(Node::new(2, &drops));
        assert!(!garbage.header().is_marked::<NonAtomicAccess>());
    }
    assert_eq!(heap.phase(), GcPhase::Marking);

    heap.finalize_incremental_marking(StackState::NoHeapPointers);
    heap.finish_sweeping();

    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert_eq!(chain_length(root.get()), 2);
}

#[test]
fn test_concurrent_marking_keeps_long_chain_alive() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        marking_type: MarkingType::IncrementalAndConcurrent,
        concurrent_marking_tasks: 2,
        sweeping_type: SweepingType::IncrementalAndConcurrent,
        verify_heap: true,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 2000, &drops);
    let root = Persistent::new(&heap, Some(head));
    chain(&mut heap, 500, &drops);

    assert!(heap.start_incremental_marking());
    heap.advance_incremental_marking(Duration::from_micros(50));
    heap.finalize_incremental_marking(StackState::NoHeapPointers);
    heap.finish_sweeping();

    assert_eq!(drops.load(Ordering::Relaxed), 500);
    assert_eq!(chain_length(root.get()), 2000);
    let statistics = heap.statistics();
    assert_eq!(statistics.total_gc_cycles_count, 1);
    assert!(statistics.last_marked_bytes >= 2000 * 40);
}

#[test]
fn test_concurrent_marking_with_mutator_writes() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        marking_type: MarkingType::IncrementalAndConcurrent,
        concurrent_marking_tasks: 2,
        verify_heap: true,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 1000, &drops);
    let root = Persistent::new(&heap, Some(head));
    let spare_head = chain(&mut heap, 200, &drops);
    let spare = Persistent::new(&heap, Some(spare_head));
    chain(&mut heap, 300, &drops);

    assert!(heap.start_incremental_marking());
    // Moves every spare node into the main chain while the markers run. Each
    // node is only reachable through edges written after marking started.
    let mut position = root.get().unwrap();
    while let Some(node) = spare.get() {
        spare.set(node.next.get());
        node.next.set(position.next.get());
        position.next.set(Some(node));
        for _ in 0..5 {
            match node.next.get() {
                Some(next) => position = next,
                None => break,
            }
        }
    }
    assert_eq!(heap.phase(), GcPhase::Marking);
    heap.finalize_incremental_marking(StackState::NoHeapPointers);
    heap.finish_sweeping();

    assert_eq!(drops.load(Ordering::Relaxed), 300);
    let mut length = 0;
    let mut current = root.get();
    while let Some(node) = current {
        assert!(node.value < 1000);
        length += 1;
        current = node.next.get();
    }
    assert_eq!(length, 1200);
}

#[test]
fn test_compaction_moves_objects_and_updates_references() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        compaction: Compaction::Always,
        verify_heap: true,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 100, &drops);
    for value in 0..1000 {
        heap.allocate(Node::new(value, &drops));
    }
    let before = head.as_ptr();
    let root = Persistent::new(&heap, Some(head));

    heap.collect_garbage(StackState::NoHeapPointers);

    let moved = root.get().unwrap();
    assert_ne!(moved.as_ptr(), before);
    assert_eq!(chain_length(Some(moved)), 100);
    assert_eq!(drops.load(Ordering::Relaxed), 1000);
    assert!(heap.statistics().normal_pages >= 1);
}

#[test]
fn test_compaction_is_skipped_with_conservative_stack() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        compaction: Compaction::Always,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 10, &drops);
    let before = head.as_ptr();
    let root = Persistent::new(&heap, Some(head));

    heap.collect_garbage(StackState::MayContainHeapPointers);

    assert_eq!(root.get().unwrap().as_ptr(), before);
    assert_eq!(chain_length(root.get()), 10);
}

#[test]
fn test_conservative_stack_scan_keeps_local_alive() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let local = std::hint::black_box(heap.allocate(Node::new(0, &drops)));
    heap.collect_garbage(StackState::MayContainHeapPointers);
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    assert_eq!(std::hint::black_box(local).value, 0);
    assert!(heap.statistics().last_objects_found_conservatively >= 1);
}

#[test]
fn test_large_objects_get_their_own_page() {
    let mut heap = atomic_heap();
    let pages = heap.page_count_for_testing();
    let blob = heap.allocate(Blob { data: [7; 20_000] });
    assert_eq!(heap.page_count_for_testing(), pages + 1);
    assert_eq!(heap.statistics().large_pages, 1);
    assert_eq!(blob.data[19_999], 7);
    assert!(blob.header().allocated_size::<NonAtomicAccess>() >= 160_000);

    heap.collect_garbage(StackState::NoHeapPointers);
    assert_eq!(heap.statistics().large_pages, 0);
}

#[test]
fn test_no_gc_scope_defers_collection() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    chain(&mut heap, 3, &drops);
    {
        let _scope = NoGarbageCollectionScope::new(&heap);
        heap.collect_garbage(StackState::NoHeapPointers);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        assert_eq!(heap.statistics().total_gc_cycles_count, 0);
        assert!(!heap.start_incremental_marking());
    }
    heap.collect_garbage(StackState::NoHeapPointers);
    assert_eq!(drops.load(Ordering::Relaxed), 3);
}

#[test]
fn test_allocation_triggers_collection() {
    let mut heap = heap_with(Config {
        heap_reservation: 64 * crate::globals::MB,
        initial_heap_limit: 256 * 1024,
        ..Default::default()
    });
    let drops = Arc::new(AtomicUsize::new(0));
    for value in 0..50_000 {
        heap.allocate(Node::new(value, &drops));
    }
    heap.finish_sweeping();
    let statistics = heap.statistics();
    assert!(statistics.total_gc_cycles_count >= 1);
    assert!(drops.load(Ordering::Relaxed) > 0);
    assert!(statistics.committed_memory < 50_000 * 40);
}

#[test]
fn test_statistics_track_allocations_and_cycles() {
    let mut heap = atomic_heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let head = chain(&mut heap, 4, &drops);
    let _root = Persistent::new(&heap, Some(head));
    let statistics = heap.statistics();
    assert_eq!(statistics.total_allocated_objects, 4);
    assert_eq!(statistics.total_allocated_bytes, 4 * 40);
    assert_eq!(statistics.total_gc_cycles_count, 0);

    heap.collect_garbage(StackState::NoHeapPointers);
    heap.collect_garbage(StackState::NoHeapPointers);
    let statistics = heap.statistics();
    assert_eq!(statistics.total_gc_cycles_count, 2);
    assert_eq!(statistics.last_marked_bytes, 4 * 40);
    assert_eq!(statistics.allocated_object_size, 4 * 40);
    assert!(statistics.to_string().contains("Total GC cycles count: 2"));
}

#[test]
fn test_heap_drop_finalizes_everything() {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let mut heap = atomic_heap();
        let head = chain(&mut heap, 8, &drops);
        let _root = Persistent::new(&heap, Some(head));
        chain(&mut heap, 2, &drops);
        heap.allocate(Blob { data: [0; 20_000] });
    }
    assert_eq!(drops.load(Ordering::Relaxed), 10);
}

#[test]
fn test_collection_stops_running_local_heaps() {
    let mut heap = atomic_heap();
    let local = heap.create_local_heap();
    let started = Arc::new(Barrier::new(2));
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let started = started.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            local.unpark();
            started.wait();
            while !stop.load(Ordering::Acquire) {
                local.safepoint();
            }
            local.park();
        })
    };
    started.wait();
    assert_eq!(heap.safepoint().local_heap_count(), 1);
    let drops = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        chain(&mut heap, 4, &drops);
        heap.collect_garbage(StackState::NoHeapPointers);
    }
    stop.store(true, Ordering::Release);
    worker.join().unwrap();
    assert_eq!(drops.load(Ordering::Relaxed), 12);
    assert_eq!(heap.safepoint().local_heap_count(), 0);
}

#[test]
fn test_c_api_free_of_null_succeeds() {
    use crate::c_api::*;

    let heap = nebula_heap_create(Config {
        heap_reservation: 64 * crate::globals::MB,
        ..Default::default()
    });
    assert!(nebula_heap_try_free(heap, std::ptr::null_mut()));
    assert!(!nebula_heap_resize(heap, std::ptr::null_mut(), 16));
    nebula_heap_free(heap);
}
