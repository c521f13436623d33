//! Off-heap handles that keep managed objects alive.
//!
//! Every handle owns a node in a [`PersistentRegion`]. Nodes are boxed so
//! their address never changes; the region only stores them in an
//! index-stable table behind a mutex.

use std::{
    marker::PhantomData,
    ptr::{null_mut, NonNull},
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    gcref::GcRef,
    header::HeapObjectHeader,
    heap::Heap,
    internal::access_mode::NonAtomicAccess,
    roots::{Root, RootVisitor},
};

pub struct PersistentNode {
    value: AtomicPtr<u8>,
    index: usize,
}

#[derive(Default)]
struct NodeTable {
    nodes: Vec<Option<Box<PersistentNode>>>,
    free: Vec<usize>,
    used: usize,
}

unsafe impl Send for NodeTable {}

pub struct PersistentRegion {
    root: Root,
    table: Mutex<NodeTable>,
}

impl PersistentRegion {
    pub fn new(root: Root) -> Self {
        Self {
            root,
            table: Mutex::new(NodeTable::default()),
        }
    }

    pub fn root(&self) -> Root {
        self.root
    }

    fn allocate(&self, value: *mut u8) -> NonNull<PersistentNode> {
        let mut table = self.table.lock();
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                table.nodes.push(None);
                table.nodes.len() - 1
            }
        };
        let mut node = Box::new(PersistentNode {
            value: AtomicPtr::new(value),
            index,
        });
        let pointer = NonNull::from(&mut *node);
        table.nodes[index] = Some(node);
        table.used += 1;
        pointer
    }

    fn free(&self, node: NonNull<PersistentNode>) {
        let mut table = self.table.lock();
        let index = unsafe { node.as_ref().index };
        debug_assert!(table.nodes[index]
            .as_deref()
            .map_or(false, |slot| core::ptr::eq(slot, node.as_ptr())));
        table.nodes[index] = None;
        table.free.push(index);
        table.used -= 1;
    }

    pub fn node_count(&self) -> usize {
        self.table.lock().used
    }

    /// Reports every non-empty node to `visitor`.
    pub fn trace(&self, visitor: &mut dyn RootVisitor) {
        let table = self.table.lock();
        for node in table.nodes.iter().flatten() {
            if !node.value.load(Ordering::Relaxed).is_null() {
                visitor.visit_root_pointer(self.root, self.root.name(), &node.value);
            }
        }
    }

    /// Clears nodes whose target was not marked. Only valid in the atomic pause.
    pub fn clear_unmarked(&self) -> usize {
        let table = self.table.lock();
        let mut cleared = 0;
        for node in table.nodes.iter().flatten() {
            let value = node.value.load(Ordering::Relaxed);
            if value.is_null() {
                continue;
            }
            let header = unsafe { &*HeapObjectHeader::from_payload(value) };
            if !header.is_marked::<NonAtomicAccess>() {
                node.value.store(null_mut(), Ordering::Relaxed);
                cleared += 1;
            }
        }
        cleared
    }

    /// Drops every reference held by this region.
    pub fn clear_all(&self) {
        let table = self.table.lock();
        for node in table.nodes.iter().flatten() {
            node.value.store(null_mut(), Ordering::Relaxed);
        }
    }
}

pub trait PersistentPolicy {
    fn region(heap: &Heap) -> &Arc<PersistentRegion>;
}

pub struct StrongPersistentPolicy;
pub struct WeakPersistentPolicy;
pub struct CrossThreadPersistentPolicy;

impl PersistentPolicy for StrongPersistentPolicy {
    fn region(heap: &Heap) -> &Arc<PersistentRegion> {
        heap.strong_persistent_region()
    }
}

impl PersistentPolicy for WeakPersistentPolicy {
    fn region(heap: &Heap) -> &Arc<PersistentRegion> {
        heap.weak_persistent_region()
    }
}

impl PersistentPolicy for CrossThreadPersistentPolicy {
    fn region(heap: &Heap) -> &Arc<PersistentRegion> {
        heap.cross_thread_persistent_region()
    }
}

pub struct BasicPersistent<T, P: PersistentPolicy> {
    node: NonNull<PersistentNode>,
    region: Arc<PersistentRegion>,
    marker: PhantomData<(GcRef<T>, P)>,
}

/// Keeps its target alive until dropped or cleared.
pub type Persistent<T> = BasicPersistent<T, StrongPersistentPolicy>;
/// Observes its target without keeping it alive. Cleared when the target dies.
pub type WeakPersistent<T> = BasicPersistent<T, WeakPersistentPolicy>;
/// Strong handle that may be moved to and used from other threads.
pub type CrossThreadPersistent<T> = BasicPersistent<T, CrossThreadPersistentPolicy>;

unsafe impl<T: Send + Sync> Send for BasicPersistent<T, CrossThreadPersistentPolicy> {}
unsafe impl<T: Send + Sync> Sync for BasicPersistent<T, CrossThreadPersistentPolicy> {}

impl<T, P: PersistentPolicy> BasicPersistent<T, P> {
    pub fn new(heap: &Heap, value: Option<GcRef<T>>) -> Self {
        let region = P::region(heap).clone();
        Self::in_region(region, value)
    }

    fn in_region(region: Arc<PersistentRegion>, value: Option<GcRef<T>>) -> Self {
        let raw = value.map_or(null_mut(), |value| value.as_ptr());
        let node = region.allocate(raw);
        Self {
            node,
            region,
            marker: PhantomData,
        }
    }

    #[inline]
    fn node(&self) -> &PersistentNode {
        unsafe { self.node.as_ref() }
    }

    pub fn get(&self) -> Option<GcRef<T>> {
        let value = self.node().value.load(Ordering::Acquire);
        if value.is_null() {
            None
        } else {
            Some(unsafe { GcRef::from_payload(value) })
        }
    }

    pub fn set(&self, value: Option<GcRef<T>>) {
        let raw = value.map_or(null_mut(), |value| value.as_ptr());
        self.node().value.store(raw, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn is_empty(&self) -> bool {
        self.node().value.load(Ordering::Relaxed).is_null()
    }
}

impl<T, P: PersistentPolicy> Clone for BasicPersistent<T, P> {
    fn clone(&self) -> Self {
        Self::in_region(self.region.clone(), self.get())
    }
}

impl<T, P: PersistentPolicy> Drop for BasicPersistent<T, P> {
    fn drop(&mut self) {
        self.region.free(self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting(usize);

    impl RootVisitor for Counting {
        fn visit_root_pointers(&mut self, _root: Root, _description: &str, slots: &[AtomicPtr<u8>]) {
            self.0 += slots.len();
        }
    }

    #[test]
    fn test_region_reuses_freed_slots() {
        let region = PersistentRegion::new(Root::Persistent);
        let first = region.allocate(0x10 as *mut u8);
        let second = region.allocate(null_mut());
        assert_eq!(region.node_count(), 2);
        let mut counting = Counting(0);
        region.trace(&mut counting);
        assert_eq!(counting.0, 1, "empty nodes are skipped");
        region.free(first);
        let third = region.allocate(0x20 as *mut u8);
        assert_eq!(unsafe { third.as_ref().index }, 0);
        region.free(second);
        region.free(third);
        assert_eq!(region.node_count(), 0);
    }
}
