use std::sync::Arc;

use atomic::{Atomic, Ordering};

use crate::safepoint::GlobalSafepoint;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Threads in this state are allowed to access the heap.
    Running,
    /// Thread was parked, which means that the thread is not allowed to access
    /// or manipulate the heap in any way. This is considered to be a safepoint.
    Parked,
    /// SafepointRequested is used for Running threads to force Safepoint() and
    /// Park() into the slow path.
    SafepointRequested,
    /// A thread transitions into this state from SafepointRequested when it
    /// enters a safepoint.
    Safepoint,
    /// This state is used for Parked background threads and forces Unpark() into
    /// the slow path. It prevents Unpark() to succeed before the safepoint
    /// operation is finished.
    ParkedSafepointRequested,
}

/// The part of a [`LocalHeap`] the safepoint registry sees.
pub struct LocalHeapState {
    state: Atomic<ThreadState>,
}

impl LocalHeapState {
    pub(crate) fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) fn compare_exchange_state(&self, current: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// LocalHeap is used by the GC to track all threads with heap access in order to
/// stop them before performing a collection. LocalHeaps can be either Parked or
/// Running and are in Parked mode when initialized.
///   Running: Thread is allowed to access the heap but needs to give the GC the
///            chance to run regularly by manually invoking safepoint(). The
///            thread can be parked using ParkedScope.
///   Parked:  Heap access is not allowed, so the GC will not stop this thread
///            for a collection. Useful when threads do not need heap access for
///            some time or for blocking operations like locking a mutex.
pub struct LocalHeap {
    state: Arc<LocalHeapState>,
    safepoint: Arc<GlobalSafepoint>,
}

impl LocalHeap {
    pub(crate) fn new(safepoint: Arc<GlobalSafepoint>) -> Self {
        let state = Arc::new(LocalHeapState {
            state: Atomic::new(ThreadState::Parked),
        });
        safepoint.add_local_heap(state.clone());
        Self { state, safepoint }
    }

    pub fn thread_state(&self) -> ThreadState {
        self.state.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.thread_state(),
            ThreadState::Running | ThreadState::SafepointRequested
        )
    }

    pub fn is_parked(&self) -> bool {
        matches!(
            self.thread_state(),
            ThreadState::Parked | ThreadState::ParkedSafepointRequested
        )
    }

    /// Gives a pending garbage collection the chance to run.
    #[inline]
    pub fn safepoint(&self) {
        if self.state.state() == ThreadState::SafepointRequested {
            self.safepoint_slow_path();
        }
    }

    #[cold]
    fn safepoint_slow_path(&self) {
        if self
            .state
            .compare_exchange_state(ThreadState::SafepointRequested, ThreadState::Safepoint)
        {
            self.safepoint.wait_in_safepoint();
        }
    }

    pub fn park(&self) {
        if self
            .state
            .compare_exchange_state(ThreadState::Running, ThreadState::Parked)
        {
            return;
        }
        self.park_slow_path();
    }

    #[cold]
    fn park_slow_path(&self) {
        loop {
            match self.state.state() {
                ThreadState::Running => {
                    if self
                        .state
                        .compare_exchange_state(ThreadState::Running, ThreadState::Parked)
                    {
                        return;
                    }
                }
                ThreadState::SafepointRequested => {
                    if self.state.compare_exchange_state(
                        ThreadState::SafepointRequested,
                        ThreadState::ParkedSafepointRequested,
                    ) {
                        self.safepoint.notify_park();
                        return;
                    }
                }
                state => {
                    debug_assert!(false, "cannot park from {:?}", state);
                    return;
                }
            }
        }
    }

    pub fn unpark(&self) {
        if self
            .state
            .compare_exchange_state(ThreadState::Parked, ThreadState::Running)
        {
            return;
        }
        self.unpark_slow_path();
    }

    #[cold]
    fn unpark_slow_path(&self) {
        loop {
            match self.state.state() {
                ThreadState::Parked => {
                    if self
                        .state
                        .compare_exchange_state(ThreadState::Parked, ThreadState::Running)
                    {
                        return;
                    }
                }
                ThreadState::ParkedSafepointRequested => {
                    self.safepoint.wait_in_unpark();
                }
                state => {
                    debug_assert!(false, "cannot unpark from {:?}", state);
                    return;
                }
            }
        }
    }

    /// Runs `f` with the heap parked.
    pub fn parked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = ParkedScope::new(self);
        f()
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        if self.is_running() {
            self.park();
        }
        self.safepoint.remove_local_heap(&self.state);
    }
}

/// Parks a running local heap for its lifetime.
pub struct ParkedScope<'a> {
    local_heap: &'a LocalHeap,
}

impl<'a> ParkedScope<'a> {
    pub fn new(local_heap: &'a LocalHeap) -> Self {
        local_heap.park();
        Self { local_heap }
    }
}

impl Drop for ParkedScope<'_> {
    fn drop(&mut self) {
        self.local_heap.unpark();
    }
}

/// Unparks a parked local heap for its lifetime.
pub struct UnparkedScope<'a> {
    local_heap: &'a LocalHeap,
}

impl<'a> UnparkedScope<'a> {
    pub fn new(local_heap: &'a LocalHeap) -> Self {
        local_heap.unpark();
        Self { local_heap }
    }
}

impl Drop for UnparkedScope<'_> {
    fn drop(&mut self) {
        self.local_heap.park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafepointScope;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize},
        Barrier,
    };

    #[test]
    fn test_local_heap_starts_parked() {
        let safepoint = Arc::new(GlobalSafepoint::new());
        let local = LocalHeap::new(safepoint.clone());
        assert!(local.is_parked());
        local.unpark();
        assert!(local.is_running());
        local.safepoint();
        local.park();
        assert!(local.is_parked());
        assert_eq!(safepoint.local_heap_count(), 1);
        drop(local);
        assert_eq!(safepoint.local_heap_count(), 0);
    }

    #[test]
    fn test_safepoint_scope_with_parked_heap() {
        let safepoint = Arc::new(GlobalSafepoint::new());
        let local = LocalHeap::new(safepoint.clone());
        {
            let _scope = SafepointScope::new(&safepoint);
            safepoint.assert_active();
            assert_eq!(local.thread_state(), ThreadState::ParkedSafepointRequested);
        }
        assert_eq!(local.thread_state(), ThreadState::Parked);
        assert!(!safepoint.is_active());
    }

    #[test]
    fn test_safepoint_stops_running_thread() {
        let safepoint = Arc::new(GlobalSafepoint::new());
        let started = Arc::new(Barrier::new(2));
        let stop = Arc::new(AtomicBool::new(false));
        let in_scope = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let worker = {
            let safepoint = safepoint.clone();
            let started = started.clone();
            let stop = stop.clone();
            let in_scope = in_scope.clone();
            let violations = violations.clone();
            std::thread::spawn(move || {
                let local = LocalHeap::new(safepoint);
                local.unpark();
                started.wait();
                while !stop.load(std::sync::atomic::Ordering::Acquire) {
                    local.safepoint();
                    if in_scope.load(std::sync::atomic::Ordering::Acquire) {
                        violations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                local.park();
            })
        };

        started.wait();
        for _ in 0..10 {
            let scope = SafepointScope::new(&safepoint);
            in_scope.store(true, std::sync::atomic::Ordering::Release);
            std::thread::sleep(std::time::Duration::from_millis(1));
            in_scope.store(false, std::sync::atomic::Ordering::Release);
            drop(scope);
        }
        stop.store(true, std::sync::atomic::Ordering::Release);
        worker.join().unwrap();
        assert_eq!(violations.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
