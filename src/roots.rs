use std::sync::{atomic::AtomicPtr, Arc};

use crate::{
    persistent::PersistentRegion,
    stack::{Stack, StackState},
};

/// Kinds of root sources reported to a [`RootVisitor`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Root {
    Persistent,
    WeakPersistent,
    CrossThreadPersistent,
    Stack,
    Handles,
    Globals,
    Custom,
}

impl Root {
    pub fn name(self) -> &'static str {
        match self {
            Root::Persistent => "persistent handles",
            Root::WeakPersistent => "weak persistent handles",
            Root::CrossThreadPersistent => "cross-thread persistent handles",
            Root::Stack => "stack",
            Root::Handles => "handles",
            Root::Globals => "globals",
            Root::Custom => "custom",
        }
    }
}

/// Receives the root slots of a subsystem once per collection.
pub trait RootVisitor {
    /// Visits a run of slots each holding a payload pointer or null.
    fn visit_root_pointers(&mut self, root: Root, description: &str, slots: &[AtomicPtr<u8>]);

    fn visit_root_pointer(&mut self, root: Root, description: &str, slot: &AtomicPtr<u8>) {
        self.visit_root_pointers(root, description, std::slice::from_ref(slot));
    }

    /// Visits words that may or may not be pointers into the heap. Objects
    /// found this way are kept alive but never moved.
    fn visit_conservative_range(
        &mut self,
        root: Root,
        description: &str,
        start: *const usize,
        end: *const usize,
    ) {
        let _ = (root, description, start, end);
    }
}

/// A subsystem holding roots, registered with [`Heap::add_root_source`](crate::heap::Heap::add_root_source).
pub trait RootSource {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor);
}

impl<F: FnMut(&mut dyn RootVisitor)> RootSource for F {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        self(visitor)
    }
}

/// Every root of a heap: registered root sources, persistent handles and
/// the native stack of the owning thread.
pub struct RootSet {
    sources: Vec<Box<dyn RootSource>>,
    strong_persistents: Arc<PersistentRegion>,
    weak_persistents: Arc<PersistentRegion>,
    cross_thread_persistents: Arc<PersistentRegion>,
    stack: Stack,
}

impl RootSet {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            strong_persistents: Arc::new(PersistentRegion::new(Root::Persistent)),
            weak_persistents: Arc::new(PersistentRegion::new(Root::WeakPersistent)),
            cross_thread_persistents: Arc::new(PersistentRegion::new(Root::CrossThreadPersistent)),
            stack: Stack::current(),
        }
    }

    pub fn add_source(&mut self, source: Box<dyn RootSource>) {
        self.sources.push(source);
    }

    pub fn strong_persistents(&self) -> &Arc<PersistentRegion> {
        &self.strong_persistents
    }

    pub fn weak_persistents(&self) -> &Arc<PersistentRegion> {
        &self.weak_persistents
    }

    pub fn cross_thread_persistents(&self) -> &Arc<PersistentRegion> {
        &self.cross_thread_persistents
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Reports every root that keeps objects alive. The native stack is only
    /// scanned when it may hold heap pointers.
    pub fn visit_strong(&mut self, visitor: &mut dyn RootVisitor, stack_state: StackState) {
        self.strong_persistents.trace(visitor);
        self.cross_thread_persistents.trace(visitor);
        for source in self.sources.iter_mut() {
            source.visit_roots(visitor);
        }
        if stack_state == StackState::MayContainHeapPointers {
            self.stack.iterate_pointers(&mut |start, end| {
                visitor.visit_conservative_range(Root::Stack, Root::Stack.name(), start, end);
            });
        }
    }

    /// Reports roots that do not keep their targets alive.
    pub fn visit_weak(&mut self, visitor: &mut dyn RootVisitor) {
        self.weak_persistents.trace(visitor);
    }

    /// Clears weak persistents whose target was not marked.
    pub fn process_weak_persistents(&self) -> usize {
        self.weak_persistents.clear_unmarked()
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}
