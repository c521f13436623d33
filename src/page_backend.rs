//! Carves one large virtual memory reservation into pages.
//!
//! The reservation is aligned to [`HUGE_PAGE_SIZE`] and split into huge page
//! ranges. Each [`HugePageRange`] tracks which of its [`PAGES_PER_HUGE_PAGE`]
//! page slots are in use. Normal pages take one slot, large pages take a run of
//! consecutive slots that may span several ranges.
//!
//! The whole reservation doubles as the heap's cage: every pointer the
//! collector follows must lie inside of it.

use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    globals::{GUARD_PAGE_SIZE, HUGE_PAGE_SIZE, PAGES_PER_HUGE_PAGE, PAGE_SIZE, PAGE_SIZE_LOG2},
    mmap::Mmap,
    page::BasePage,
    util::align_up,
};

const FULL_MASK: u8 = ((1u16 << PAGES_PER_HUGE_PAGE) - 1) as u8;

/// Sub-allocator for the page slots of a single huge page.
///
/// Bitmap and count are updated with atomic read-modify-write operations, so a
/// slot may be released from any thread. Allocation is additionally serialized
/// by the owning [`PageBackend`].
pub struct HugePageRange {
    bitmap: AtomicU8,
    count: AtomicU8,
}

impl Default for HugePageRange {
    fn default() -> Self {
        Self::new()
    }
}

impl HugePageRange {
    pub const fn new() -> Self {
        Self {
            bitmap: AtomicU8::new(0),
            count: AtomicU8::new(0),
        }
    }

    /// Claims the first free slot.
    pub fn allocate_first_fit(&self) -> Option<usize> {
        let mut bits = self.bitmap.load(Ordering::Acquire);
        loop {
            if bits & FULL_MASK == FULL_MASK {
                return None;
            }
            let slot = (!bits).trailing_zeros() as usize;
            debug_assert!(slot < PAGES_PER_HUGE_PAGE);
            match self.bitmap.compare_exchange_weak(
                bits,
                bits | (1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::AcqRel);
                    return Some(slot);
                }
                Err(current) => bits = current,
            }
        }
    }

    fn run_mask(start: usize, len: usize) -> u8 {
        debug_assert!(start + len <= PAGES_PER_HUGE_PAGE);
        (((1u16 << len) - 1) << start) as u8
    }

    /// Claims `len` consecutive slots starting at `start`. Fails without side
    /// effects if any of them is taken.
    pub fn allocate_run(&self, start: usize, len: usize) -> bool {
        let mask = Self::run_mask(start, len);
        let mut bits = self.bitmap.load(Ordering::Acquire);
        loop {
            if bits & mask != 0 {
                return false;
            }
            match self.bitmap.compare_exchange_weak(
                bits,
                bits | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.count.fetch_add(len as u8, Ordering::AcqRel);
                    return true;
                }
                Err(current) => bits = current,
            }
        }
    }

    pub fn free(&self, start: usize, len: usize) {
        let mask = Self::run_mask(start, len);
        let previous = self.bitmap.fetch_and(!mask, Ordering::AcqRel);
        debug_assert_eq!(previous & mask, mask, "freeing slots that are not in use");
        self.count.fetch_sub(len as u8, Ordering::AcqRel);
    }

    pub fn is_free(&self, slot: usize) -> bool {
        self.bitmap.load(Ordering::Acquire) & (1 << slot) == 0
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.count() == PAGES_PER_HUGE_PAGE
    }
}

pub struct PageBackend {
    reservation: Mmap,
    cage_start: usize,
    cage_size: usize,
    ranges: Box<[HugePageRange]>,
    page_table: Box<[AtomicPtr<BasePage>]>,
    allocation_mutex: Mutex<()>,
    committed: AtomicUsize,
}

impl PageBackend {
    /// Reserves `size` bytes of address space, rounded up to whole huge pages.
    pub fn new(size: usize) -> Option<Self> {
        let size = align_up(size.max(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        let reservation = Mmap::reserve(size, HUGE_PAGE_SIZE)?;
        let cage_start = reservation.aligned() as usize;
        let slots = size / PAGE_SIZE;
        let ranges = (0..size / HUGE_PAGE_SIZE)
            .map(|_| HugePageRange::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let page_table = (0..slots)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        log::debug!(
            "reserved heap cage {:#x}..{:#x} ({} page slots)",
            cage_start,
            cage_start + size,
            slots
        );
        Some(Self {
            reservation,
            cage_start,
            cage_size: size,
            ranges,
            page_table,
            allocation_mutex: Mutex::new(()),
            committed: AtomicUsize::new(0),
        })
    }

    #[inline(always)]
    pub fn is_within_cage(&self, address: usize) -> bool {
        address.wrapping_sub(self.cage_start) < self.cage_size
    }

    pub fn cage_start(&self) -> usize {
        self.cage_start
    }

    pub fn cage_size(&self) -> usize {
        self.cage_size
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.size()
    }

    #[inline(always)]
    fn slot_index(&self, address: usize) -> usize {
        (address - self.cage_start) >> PAGE_SIZE_LOG2
    }

    #[inline(always)]
    fn slot_address(&self, slot: usize) -> usize {
        self.cage_start + (slot << PAGE_SIZE_LOG2)
    }

    fn commit(&self, base: usize, slots: usize) -> bool {
        let start = base + GUARD_PAGE_SIZE;
        let size = slots * PAGE_SIZE - 2 * GUARD_PAGE_SIZE;
        if !self.reservation.commit(start as *mut u8, size) {
            return false;
        }
        self.committed.fetch_add(size, Ordering::Relaxed);
        true
    }

    fn decommit(&self, base: usize, slots: usize) {
        let start = base + GUARD_PAGE_SIZE;
        let size = slots * PAGE_SIZE - 2 * GUARD_PAGE_SIZE;
        self.reservation.decommit(start as *mut u8, size);
        self.committed.fetch_sub(size, Ordering::Relaxed);
    }

    /// Returns the base of a committed normal page slot. The first and last
    /// [`GUARD_PAGE_SIZE`] bytes stay inaccessible.
    pub fn allocate_normal_page_memory(&self) -> Option<usize> {
        let _lock = self.allocation_mutex.lock();
        for (range_index, range) in self.ranges.iter().enumerate() {
            if range.is_full() {
                continue;
            }
            if let Some(slot) = range.allocate_first_fit() {
                let base = self.slot_address(range_index * PAGES_PER_HUGE_PAGE + slot);
                if !self.commit(base, 1) {
                    range.free(slot, 1);
                    return None;
                }
                log::trace!("committed normal page at {:#x}", base);
                return Some(base);
            }
        }
        None
    }

    /// Number of page slots a large page of `size` bytes (guards included) needs.
    pub fn slots_for(size: usize) -> usize {
        align_up(size, PAGE_SIZE) / PAGE_SIZE
    }

    /// Returns the base of `slots` consecutive committed page slots.
    pub fn allocate_large_page_memory(&self, slots: usize) -> Option<usize> {
        let _lock = self.allocation_mutex.lock();
        let total = self.page_table.len();
        let mut run_start = 0;
        let mut run_len = 0;
        for slot in 0..total {
            let range = &self.ranges[slot / PAGES_PER_HUGE_PAGE];
            if range.is_free(slot % PAGES_PER_HUGE_PAGE) {
                if run_len == 0 {
                    run_start = slot;
                }
                run_len += 1;
                if run_len == slots {
                    if !self.claim_run(run_start, slots) {
                        return None;
                    }
                    let base = self.slot_address(run_start);
                    if !self.commit(base, slots) {
                        self.release_run(run_start, slots);
                        return None;
                    }
                    log::trace!("committed large page at {:#x} ({} slots)", base, slots);
                    return Some(base);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    fn for_each_range_in_run(&self, start: usize, len: usize, mut f: impl FnMut(&HugePageRange, usize, usize) -> bool) -> bool {
        let mut slot = start;
        let end = start + len;
        while slot < end {
            let range_index = slot / PAGES_PER_HUGE_PAGE;
            let in_range = slot % PAGES_PER_HUGE_PAGE;
            let chunk = (PAGES_PER_HUGE_PAGE - in_range).min(end - slot);
            if !f(&self.ranges[range_index], in_range, chunk) {
                return false;
            }
            slot += chunk;
        }
        true
    }

    fn claim_run(&self, start: usize, len: usize) -> bool {
        let mut claimed = 0;
        let ok = self.for_each_range_in_run(start, len, |range, offset, chunk| {
            if range.allocate_run(offset, chunk) {
                claimed += chunk;
                true
            } else {
                false
            }
        });
        if !ok {
            self.release_run(start, claimed);
        }
        ok
    }

    fn release_run(&self, start: usize, len: usize) {
        self.for_each_range_in_run(start, len, |range, offset, chunk| {
            range.free(offset, chunk);
            true
        });
    }

    pub fn free_normal_page_memory(&self, base: usize) {
        let _lock = self.allocation_mutex.lock();
        let slot = self.slot_index(base);
        self.decommit(base, 1);
        self.release_run(slot, 1);
        log::trace!("released normal page at {:#x}", base);
    }

    pub fn free_large_page_memory(&self, base: usize, slots: usize) {
        let _lock = self.allocation_mutex.lock();
        let slot = self.slot_index(base);
        self.decommit(base, slots);
        self.release_run(slot, slots);
        log::trace!("released large page at {:#x}", base);
    }

    /// Makes `page` discoverable from any address in its slots.
    pub fn register_page(&self, base: usize, slots: usize, page: *mut BasePage) {
        let first = self.slot_index(base);
        for entry in &self.page_table[first..first + slots] {
            entry.store(page, Ordering::Release);
        }
    }

    pub fn unregister_page(&self, base: usize, slots: usize) {
        let first = self.slot_index(base);
        for entry in &self.page_table[first..first + slots] {
            entry.store(core::ptr::null_mut(), Ordering::Release);
        }
    }

    /// Finds the page owning `address`, or null if the address is outside of
    /// any page.
    #[inline]
    pub fn lookup(&self, address: usize) -> *mut BasePage {
        if !self.is_within_cage(address) {
            return core::ptr::null_mut();
        }
        self.page_table[self.slot_index(address)].load(Ordering::Acquire)
    }

    pub fn huge_page_range(&self, index: usize) -> &HugePageRange {
        &self.ranges[index]
    }

    pub fn huge_page_ranges(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::MB;

    #[test]
    fn test_huge_page_range_first_fit() {
        let range = HugePageRange::new();
        for expected in 0..PAGES_PER_HUGE_PAGE {
            assert_eq!(range.allocate_first_fit(), Some(expected));
        }
        assert!(range.is_full());
        assert_eq!(range.allocate_first_fit(), None);
        range.free(3, 1);
        assert_eq!(range.count(), PAGES_PER_HUGE_PAGE - 1);
        assert_eq!(range.allocate_first_fit(), Some(3));
    }

    #[test]
    fn test_huge_page_range_runs() {
        let range = HugePageRange::new();
        assert!(range.allocate_run(2, 3));
        assert!(!range.allocate_run(4, 2));
        assert!(range.allocate_run(5, 3));
        assert_eq!(range.count(), 6);
        assert_eq!(range.allocate_first_fit(), Some(0));
        range.free(2, 3);
        assert!(range.is_free(2) && range.is_free(3) && range.is_free(4));
        assert_eq!(range.count(), 4);
    }

    #[test]
    fn test_huge_page_range_concurrent_release() {
        let range = HugePageRange::new();
        for _ in 0..PAGES_PER_HUGE_PAGE {
            range.allocate_first_fit();
        }
        std::thread::scope(|scope| {
            for slot in 0..PAGES_PER_HUGE_PAGE {
                let range = &range;
                scope.spawn(move || range.free(slot, 1));
            }
        });
        assert!(range.is_empty());
    }

    #[test]
    fn test_normal_pages_are_aligned_and_registered() {
        let backend = PageBackend::new(8 * MB).unwrap();
        let a = backend.allocate_normal_page_memory().unwrap();
        let b = backend.allocate_normal_page_memory().unwrap();
        assert_ne!(a, b);
        assert_eq!(a % PAGE_SIZE, 0);
        assert!(backend.is_within_cage(a) && backend.is_within_cage(b));
        assert!(!backend.is_within_cage(backend.cage_start() + backend.cage_size()));
        assert_eq!(backend.committed_bytes(), 2 * (PAGE_SIZE - 2 * GUARD_PAGE_SIZE));

        // Committed memory is writable past the leading guard page.
        unsafe {
            let p = (a + GUARD_PAGE_SIZE) as *mut u64;
            p.write(42);
            assert_eq!(p.read(), 42);
        }

        let fake_page = 0x1000 as *mut BasePage;
        backend.register_page(a, 1, fake_page);
        assert_eq!(backend.lookup(a + 100), fake_page);
        assert!(backend.lookup(b + 100).is_null());
        backend.unregister_page(a, 1);
        assert!(backend.lookup(a + 100).is_null());

        backend.free_normal_page_memory(a);
        backend.free_normal_page_memory(b);
        assert_eq!(backend.committed_bytes(), 0);
    }

    #[test]
    fn test_large_pages_span_huge_page_ranges() {
        let backend = PageBackend::new(8 * MB).unwrap();
        let first = backend.allocate_normal_page_memory().unwrap();
        let slots = PAGES_PER_HUGE_PAGE + 2;
        let large = backend.allocate_large_page_memory(slots).unwrap();
        assert_eq!(large, first + PAGE_SIZE);
        assert!(backend.huge_page_range(0).is_full());
        assert_eq!(backend.huge_page_range(1).count(), 3);
        backend.free_large_page_memory(large, slots);
        assert_eq!(backend.huge_page_range(0).count(), 1);
        assert!(backend.huge_page_range(1).is_empty());
        backend.free_normal_page_memory(first);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let backend = PageBackend::new(HUGE_PAGE_SIZE).unwrap();
        let pages = (0..PAGES_PER_HUGE_PAGE)
            .map(|_| backend.allocate_normal_page_memory().unwrap())
            .collect::<Vec<_>>();
        assert!(backend.allocate_normal_page_memory().is_none());
        assert!(backend.allocate_large_page_memory(2).is_none());
        for page in pages {
            backend.free_normal_page_memory(page);
        }
        assert!(backend.allocate_large_page_memory(PAGES_PER_HUGE_PAGE).is_some());
    }
}
