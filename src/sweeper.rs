//! Reclaims the memory of unmarked objects after marking.
//!
//! Sweeping a page is split in two steps. The first step walks the page,
//! unmarks survivors, rebuilds the object start bitmap and collects dead
//! ranges into a page local free list; it may run on a background thread.
//! Finalizers are never run there: dead objects that need one are kept
//! intact and handed to the second step, which always runs on the thread
//! owning the heap. That step runs the finalizers, merges the page's free
//! list into its space and releases pages that have no survivors.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::{
    free_list::FreeList,
    globals::NUM_SPACES,
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::access_mode::{AccessMode, AtomicAccess, NonAtomicAccess},
    marking_worklists::HeaderRef,
    page::{BasePage, LargePage, NormalPage},
    space::{PageRef, RawHeap, SpaceType},
    stats_collector::SweepingType,
    util::zap_memory,
};

/// Result of the first sweeping step for one page.
pub struct SweptPageState {
    page: PageRef,
    free_list: FreeList,
    unfinalized: Vec<HeaderRef>,
    is_empty: bool,
    largest_free_entry: usize,
    swept_bytes: usize,
}

unsafe impl Send for SweptPageState {}

#[derive(Default)]
struct SpaceState {
    unswept: Mutex<Vec<PageRef>>,
    swept: Mutex<Vec<SweptPageState>>,
}

#[derive(Default)]
struct SweepingState {
    spaces: [SpaceState; NUM_SPACES],
    stop: AtomicBool,
}

impl SweepingState {
    fn pop_unswept(&self) -> Option<PageRef> {
        self.spaces
            .iter()
            .find_map(|space| space.unswept.lock().pop())
    }

    fn has_unswept(&self) -> bool {
        self.spaces
            .iter()
            .any(|space| !space.unswept.lock().is_empty())
    }
}

fn add_gap<M: AccessMode>(page: &NormalPage, free_list: &mut FreeList, start: usize, end: usize) -> usize {
    if end <= start {
        return 0;
    }
    let size = end - start;
    unsafe {
        zap_memory(start as *mut u8, size);
        free_list.add(start, size);
    }
    page.object_start_bitmap().set_bit::<M>(start);
    size
}

fn sweep_normal_page<M: AccessMode>(page: &NormalPage) -> SweptPageState {
    let bitmap = page.object_start_bitmap();
    bitmap.clear::<M>();
    let mut free_list = FreeList::new();
    let mut unfinalized = Vec::new();
    let mut live_bytes = 0;
    let mut swept_bytes = 0;
    let mut largest_free_entry = 0;

    let end = page.payload_end();
    let mut gap_start = page.payload_start();
    let mut current = gap_start;
    while current < end {
        let header = unsafe { &*(current as *const HeapObjectHeader) };
        let size = header.get_size::<M>();
        debug_assert!(size != 0, "corrupted header at {:#x}", current);
        if header.is_free::<M>() {
            current += size;
            continue;
        }
        if header.is_marked::<M>() {
            let gap = add_gap::<M>(page, &mut free_list, gap_start, current);
            largest_free_entry = largest_free_entry.max(gap);
            header.unmark::<M>();
            header.set_old::<M>();
            bitmap.set_bit::<M>(current);
            live_bytes += size;
            current += size;
            gap_start = current;
            continue;
        }
        swept_bytes += size;
        if header.gc_info().finalize.is_some() {
            let gap = add_gap::<M>(page, &mut free_list, gap_start, current);
            largest_free_entry = largest_free_entry.max(gap);
            bitmap.set_bit::<M>(current);
            unfinalized.push(HeaderRef::new(header));
            current += size;
            gap_start = current;
            continue;
        }
        current += size;
    }
    let gap = add_gap::<M>(page, &mut free_list, gap_start, end);
    largest_free_entry = largest_free_entry.max(gap);
    page.marking_bitmap().clear::<M>();
    page.base().set_live_bytes(live_bytes);

    SweptPageState {
        page: PageRef::new(unsafe { NonNull::new_unchecked(page.as_base_ptr()) }),
        free_list,
        unfinalized,
        is_empty: live_bytes == 0,
        largest_free_entry,
        swept_bytes,
    }
}

fn sweep_large_page<M: AccessMode>(page: &LargePage) -> SweptPageState {
    let header = unsafe { &*page.object_header() };
    let mut unfinalized = Vec::new();
    let mut swept_bytes = 0;
    let is_empty = if header.is_marked::<M>() {
        header.unmark::<M>();
        header.set_old::<M>();
        false
    } else {
        swept_bytes = page.object_size();
        if header.gc_info().finalize.is_some() {
            unfinalized.push(HeaderRef::new(header));
        }
        true
    };
    SweptPageState {
        page: PageRef::new(unsafe { NonNull::new_unchecked(page.as_base_ptr()) }),
        free_list: FreeList::new(),
        unfinalized,
        is_empty,
        largest_free_entry: 0,
        swept_bytes,
    }
}

fn sweep_page<M: AccessMode>(page: PageRef) -> SweptPageState {
    let page = page.get();
    if page.is_large() {
        sweep_large_page::<M>(page.as_large())
    } else {
        sweep_normal_page::<M>(page.as_normal())
    }
}

fn background_sweep(state: Arc<SweepingState>) {
    let mut pages = 0usize;
    while !state.stop.load(Ordering::Acquire) {
        let Some(page) = state.pop_unswept() else {
            break;
        };
        let space = page.get().space();
        let swept = sweep_page::<AtomicAccess>(page);
        state.spaces[space.index()].swept.lock().push(swept);
        pages += 1;
    }
    log::trace!("background sweeper processed {} pages", pages);
}

pub struct Sweeper {
    state: Arc<SweepingState>,
    background: Option<JoinHandle<()>>,
    in_progress: bool,
    swept_bytes: usize,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sweeper {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SweepingState::default()),
            background: None,
            in_progress: false,
            swept_bytes: 0,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Takes a snapshot of all pages and starts sweeping them. Linear
    /// allocation buffers must be reset.
    pub fn start(&mut self, raw_heap: &mut RawHeap, sweeping_type: SweepingType) {
        debug_assert!(!self.in_progress);
        raw_heap.reset_labs();
        raw_heap.clear_free_lists();
        let mut count = 0;
        for space in SpaceType::ALL {
            let pages = raw_heap.base_space(space).pages();
            count += pages.len();
            *self.state.spaces[space.index()].unswept.lock() = pages;
        }
        self.state.stop.store(false, Ordering::Release);
        self.in_progress = true;
        self.swept_bytes = 0;
        log::debug!("sweeping started for {} pages ({:?})", count, sweeping_type);

        if sweeping_type == SweepingType::IncrementalAndConcurrent && count > 0 {
            let state = self.state.clone();
            match std::thread::Builder::new()
                .name("nebula-sweeper".to_string())
                .spawn(move || background_sweep(state))
            {
                Ok(handle) => self.background = Some(handle),
                Err(error) => log::debug!("could not start background sweeper: {}", error),
            }
        }
    }

    /// Runs the second sweeping step for one page.
    fn finalize_page(&mut self, raw_heap: &mut RawHeap, heap: &HeapHandle, mut swept: SweptPageState) {
        for header in swept.unfinalized.iter() {
            header.get().finalize();
        }
        self.swept_bytes += swept.swept_bytes;
        let page = swept.page.get();
        if swept.is_empty {
            raw_heap.remove_page(swept.page);
            log::trace!("releasing empty page {:#x}", page.address());
            unsafe { BasePage::destroy(swept.page.as_ptr(), heap.backend()) };
            return;
        }
        if page.is_large() {
            return;
        }
        let space = raw_heap.normal_space(page.space());
        for header in swept.unfinalized.drain(..) {
            let header = header.get();
            let address = header.address();
            let size = header.get_size::<NonAtomicAccess>();
            unsafe { zap_memory(address as *mut u8, size) };
            space.add_to_free_list(address, size);
        }
        space.free_list.append(&mut swept.free_list);
    }

    /// Finalizes pages the background thread has swept for `space`. Returns
    /// the largest free-list entry these pages contributed.
    fn finalize_swept_pages(&mut self, raw_heap: &mut RawHeap, heap: &HeapHandle, space: SpaceType) -> usize {
        let swept = std::mem::take(&mut *self.state.spaces[space.index()].swept.lock());
        let mut largest = 0;
        for page in swept {
            largest = largest.max(page.largest_free_entry);
            self.finalize_page(raw_heap, heap, page);
        }
        largest
    }

    /// Sweeps pages of `space` until one of them provides a free-list entry
    /// of at least `size` bytes. Returns whether such an entry was found.
    pub fn sweep_for_allocation(
        &mut self,
        raw_heap: &mut RawHeap,
        heap: &HeapHandle,
        space: SpaceType,
        size: usize,
    ) -> bool {
        if !self.in_progress {
            return false;
        }
        if self.finalize_swept_pages(raw_heap, heap, space) >= size {
            return true;
        }
        loop {
            let page = self.state.spaces[space.index()].unswept.lock().pop();
            let Some(page) = page else {
                return false;
            };
            let swept = sweep_page::<NonAtomicAccess>(page);
            let largest = swept.largest_free_entry;
            self.finalize_page(raw_heap, heap, swept);
            if largest >= size {
                return true;
            }
        }
    }

    /// Finalizes whatever the background thread produced so far without blocking.
    pub fn finalize_concurrently_swept(&mut self, raw_heap: &mut RawHeap, heap: &HeapHandle) {
        if !self.in_progress {
            return;
        }
        for space in SpaceType::ALL {
            self.finalize_swept_pages(raw_heap, heap, space);
        }
    }

    /// Whether every page has been swept and only finalization is left.
    pub fn is_concurrent_sweeping_done(&self) -> bool {
        !self.state.has_unswept()
    }

    /// Completes sweeping on the current thread. Returns the bytes of dead
    /// objects reclaimed during this cycle.
    pub fn finish(&mut self, raw_heap: &mut RawHeap, heap: &HeapHandle) -> usize {
        if !self.in_progress {
            return 0;
        }
        self.state.stop.store(true, Ordering::Release);
        if let Some(handle) = self.background.take() {
            if handle.join().is_err() {
                log::error!("background sweeper panicked");
            }
        }
        while let Some(page) = self.state.pop_unswept() {
            let swept = sweep_page::<NonAtomicAccess>(page);
            self.finalize_page(raw_heap, heap, swept);
        }
        for space in SpaceType::ALL {
            self.finalize_swept_pages(raw_heap, heap, space);
        }
        self.in_progress = false;
        log::debug!("sweeping finished, {} bytes reclaimed", self.swept_bytes);
        self.swept_bytes
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
    }
}
