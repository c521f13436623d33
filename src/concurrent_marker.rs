//! Background threads draining the marking worklists while the mutator runs.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{heap::HeapHandle, internal::access_mode::AtomicAccess, marking_visitor::MarkingState};

struct Shared {
    heap: Arc<HeapHandle>,
    stop: AtomicBool,
    marked_bytes: CachePadded<AtomicUsize>,
    objects_found_conservatively: CachePadded<AtomicUsize>,
}

fn run(shared: Arc<Shared>) {
    let mut state = MarkingState::<AtomicAccess>::new(&shared.heap);
    let backoff = Backoff::new();
    let mut reported = 0;
    let mut rounds = 0usize;
    while !shared.stop.load(Ordering::Acquire) {
        let done = state.drain_worklists_with_predicate(|marked| {
            shared
                .marked_bytes
                .fetch_add(marked - reported, Ordering::Relaxed);
            reported = marked;
            shared.stop.load(Ordering::Acquire)
        });
        if !done {
            backoff.reset();
            continue;
        }
        state.publish();
        rounds += 1;
        if backoff.is_completed() {
            // Nothing to steal. Wait for the mutator's barriers to produce work.
            std::thread::sleep(Duration::from_micros(100));
        } else {
            backoff.snooze();
        }
    }
    state.publish();
    shared
        .marked_bytes
        .fetch_add(state.marked_bytes() - reported, Ordering::Relaxed);
    shared
        .objects_found_conservatively
        .fetch_add(state.objects_found_conservatively(), Ordering::Relaxed);
    log::trace!(
        "concurrent marker {:?} stopped after {} idle rounds",
        std::thread::current().name(),
        rounds
    );
}

/// A set of marking threads that run until [`ConcurrentMarker::join`].
pub struct ConcurrentMarker {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ConcurrentMarker {
    pub fn start(heap: Arc<HeapHandle>, tasks: usize) -> Self {
        let shared = Arc::new(Shared {
            heap,
            stop: AtomicBool::new(false),
            marked_bytes: CachePadded::new(AtomicUsize::new(0)),
            objects_found_conservatively: CachePadded::new(AtomicUsize::new(0)),
        });
        let mut threads = Vec::with_capacity(tasks);
        for index in 0..tasks {
            let shared = shared.clone();
            match std::thread::Builder::new()
                .name(format!("nebula-marker-{}", index))
                .spawn(move || run(shared))
            {
                Ok(handle) => threads.push(handle),
                Err(error) => log::debug!("could not start concurrent marker: {}", error),
            }
        }
        log::debug!("started {} concurrent markers", threads.len());
        Self { shared, threads }
    }

    pub fn task_count(&self) -> usize {
        self.threads.len()
    }

    /// Bytes marked by the background threads so far.
    pub fn marked_bytes(&self) -> usize {
        self.shared.marked_bytes.load(Ordering::Relaxed)
    }

    /// Stops all threads and waits for them. Work they hold locally is
    /// published before they exit. Returns the bytes they marked and the
    /// number of objects they found conservatively.
    pub fn join(mut self) -> (usize, usize) {
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("concurrent marker panicked");
            }
        }
        (
            self.shared.marked_bytes.load(Ordering::Relaxed),
            self.shared
                .objects_found_conservatively
                .load(Ordering::Relaxed),
        )
    }
}

impl Drop for ConcurrentMarker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
