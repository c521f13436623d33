use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{lock_api::RawMutex as _, Condvar, Mutex, RawMutex};

use crate::local_heap::{LocalHeapState, ThreadState};

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    local_heaps: UnsafeCell<Vec<Arc<LocalHeapState>>>,
    local_heaps_mutex: RawMutex,
    barrier: Barrier,
    active_safepoint_scopes: AtomicUsize,
}

unsafe impl Send for GlobalSafepoint {}
unsafe impl Sync for GlobalSafepoint {}

#[derive(Default)]
struct BarrierState {
    armed: bool,
    stopped: usize,
}

#[derive(Default)]
struct Barrier {
    state: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn arm(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.armed);
        state.armed = true;
        state.stopped = 0;
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.armed);
        state.armed = false;
        state.stopped = 0;
        self.cv_resume.notify_all();
    }

    fn wait_until_running_threads_in_safepoint(&self, running: usize) {
        let mut state = self.state.lock();
        while state.stopped < running {
            self.cv_stopped.wait(&mut state);
        }
        debug_assert_eq!(state.stopped, running);
    }

    /// A thread that was asked to stop reports that it did.
    fn notify_park(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.armed);
        state.stopped += 1;
        self.cv_stopped.notify_one();
    }

    fn wait_in_safepoint(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.armed);
        state.stopped += 1;
        self.cv_stopped.notify_one();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
    }

    fn wait_in_unpark(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            local_heaps: UnsafeCell::new(Vec::new()),
            local_heaps_mutex: RawMutex::INIT,
            barrier: Barrier::default(),
            active_safepoint_scopes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add_local_heap(&self, local_heap: Arc<LocalHeapState>) {
        self.local_heaps_mutex.lock();
        unsafe { (*self.local_heaps.get()).push(local_heap) };
        unsafe { self.local_heaps_mutex.unlock() };
    }

    pub(crate) fn remove_local_heap(&self, local_heap: &Arc<LocalHeapState>) {
        self.local_heaps_mutex.lock();
        unsafe {
            (*self.local_heaps.get()).retain(|heap| !Arc::ptr_eq(heap, local_heap));
            self.local_heaps_mutex.unlock();
        }
    }

    pub fn local_heap_count(&self) -> usize {
        self.local_heaps_mutex.lock();
        let count = unsafe { (*self.local_heaps.get()).len() };
        unsafe { self.local_heaps_mutex.unlock() };
        count
    }

    /// Stops every running local heap. Blocks until all of them reached a
    /// safepoint. Registration of new local heaps blocks until the scope is
    /// left again.
    pub fn enter_safepoint_scope(&self) {
        if self.active_safepoint_scopes.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }
        self.local_heaps_mutex.lock();
        self.barrier.arm();

        let mut running = 0;
        for local_heap in unsafe { (*self.local_heaps.get()).iter() } {
            loop {
                let state = local_heap.state();
                let requested = match state {
                    ThreadState::Running => ThreadState::SafepointRequested,
                    ThreadState::Parked => ThreadState::ParkedSafepointRequested,
                    _ => unreachable!("local heap already in {:?}", state),
                };
                if local_heap.compare_exchange_state(state, requested) {
                    if state == ThreadState::Running {
                        running += 1;
                    }
                    break;
                }
            }
        }
        log::trace!("waiting for {} running local heaps", running);
        self.barrier.wait_until_running_threads_in_safepoint(running);
    }

    pub fn leave_safepoint_scope(&self) {
        let previous = self.active_safepoint_scopes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        if previous > 1 {
            return;
        }
        for local_heap in unsafe { (*self.local_heaps.get()).iter() } {
            let resumed = match local_heap.state() {
                ThreadState::Safepoint => ThreadState::Running,
                ThreadState::ParkedSafepointRequested => ThreadState::Parked,
                state => unreachable!("local heap in {:?} inside of a safepoint", state),
            };
            local_heap.set_state(resumed);
        }
        self.barrier.disarm();
        unsafe { self.local_heaps_mutex.unlock() };
    }

    pub fn is_active(&self) -> bool {
        self.active_safepoint_scopes.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn assert_active(&self) {
        debug_assert!(self.is_active(), "operation requires an active safepoint");
    }

    pub(crate) fn notify_park(&self) {
        self.barrier.notify_park();
    }

    pub(crate) fn wait_in_safepoint(&self) {
        self.barrier.wait_in_safepoint();
    }

    pub(crate) fn wait_in_unpark(&self) {
        self.barrier.wait_in_unpark();
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps all local heaps stopped while alive.
pub struct SafepointScope<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl<'a> SafepointScope<'a> {
    pub fn new(safepoint: &'a GlobalSafepoint) -> Self {
        safepoint.enter_safepoint_scope();
        Self { safepoint }
    }
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.safepoint.leave_safepoint_scope();
    }
}
