//! Segregated free list for normal pages.
//!
//! Free memory is kept as singly linked chunks. Each chunk starts with a
//! regular [`HeapObjectHeader`] carrying [`FREE_LIST_GC_INFO_INDEX`], which
//! keeps pages iterable, followed by the link to the next chunk. Chunks are
//! bucketed by size into categories; `next_nonempty` caches, for every
//! category, the first non-empty category at or above it.

use std::ptr::null_mut;

use crate::{
    globals::{FREE_LIST_GC_INFO_INDEX, MIN_OBJECT_SIZE},
    header::HeapObjectHeader,
    internal::access_mode::NonAtomicAccess,
};

/// Lower size bound of every category. An entry of size `s` lives in the last
/// category whose bound is `<= s`.
const CATEGORY_MIN_SIZES: [usize; NUMBER_OF_CATEGORIES] = [
    16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 2048, 4096, 8192, 16384, 32768,
    65536, 131072,
];

pub const NUMBER_OF_CATEGORIES: usize = 20;

/// Requests of at most this size try their own category before falling back
/// to larger ones.
const MEDIUM_SIZE_LIMIT: usize = 128;
/// First category the fast path picks from. Entries there leave large
/// remainders that make good linear allocation buffers.
const FAST_PATH_FIRST_CATEGORY: usize = 13;

const _: () = assert!(CATEGORY_MIN_SIZES[0] == MIN_OBJECT_SIZE);
const _: () = assert!(CATEGORY_MIN_SIZES[FAST_PATH_FIRST_CATEGORY] == 2048);

#[repr(C)]
struct Entry {
    header: HeapObjectHeader,
    next: *mut Entry,
}

impl Entry {
    /// # Safety
    /// `address` must point to at least `size >= MIN_OBJECT_SIZE` writable bytes.
    unsafe fn create(address: usize, size: usize) -> *mut Entry {
        debug_assert!(size >= MIN_OBJECT_SIZE);
        HeapObjectHeader::initialize(address as *mut u8, size, FREE_LIST_GC_INFO_INDEX);
        let entry = address as *mut Entry;
        (*entry).next = null_mut();
        entry
    }

    fn size(&self) -> usize {
        self.header.get_size::<NonAtomicAccess>()
    }
}

#[derive(Clone, Copy)]
struct FreeListCategory {
    top: *mut Entry,
    available: usize,
    length: usize,
}

impl FreeListCategory {
    const EMPTY: Self = Self {
        top: null_mut(),
        available: 0,
        length: 0,
    };

    fn is_empty(&self) -> bool {
        self.top.is_null()
    }

    unsafe fn push(&mut self, entry: *mut Entry) {
        (*entry).next = self.top;
        self.top = entry;
        self.available += (*entry).size();
        self.length += 1;
    }

    unsafe fn pop(&mut self) -> *mut Entry {
        let entry = self.top;
        debug_assert!(!entry.is_null());
        self.top = (*entry).next;
        self.available -= (*entry).size();
        self.length -= 1;
        entry
    }

    /// Unlinks the first entry of at least `size` bytes.
    unsafe fn take_fitting(&mut self, size: usize) -> *mut Entry {
        let mut prev: *mut Entry = null_mut();
        let mut current = self.top;
        while !current.is_null() {
            if (*current).size() >= size {
                if prev.is_null() {
                    self.top = (*current).next;
                } else {
                    (*prev).next = (*current).next;
                }
                self.available -= (*current).size();
                self.length -= 1;
                return current;
            }
            prev = current;
            current = (*current).next;
        }
        null_mut()
    }

    /// Unlinks every entry for which `predicate` holds.
    unsafe fn remove_if(&mut self, mut predicate: impl FnMut(*mut Entry) -> bool) {
        let mut prev: *mut Entry = null_mut();
        let mut current = self.top;
        while !current.is_null() {
            let next = (*current).next;
            if predicate(current) {
                if prev.is_null() {
                    self.top = next;
                } else {
                    (*prev).next = next;
                }
                self.available -= (*current).size();
                self.length -= 1;
            } else {
                prev = current;
            }
            current = next;
        }
    }
}

pub struct FreeList {
    categories: [FreeListCategory; NUMBER_OF_CATEGORIES],
    next_nonempty: [usize; NUMBER_OF_CATEGORIES + 1],
    available: usize,
}

unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            categories: [FreeListCategory::EMPTY; NUMBER_OF_CATEGORIES],
            next_nonempty: [NUMBER_OF_CATEGORIES; NUMBER_OF_CATEGORIES + 1],
            available: 0,
        }
    }

    /// Category an entry of `size` bytes is stored in.
    fn select_category(size: usize) -> usize {
        debug_assert!(size >= MIN_OBJECT_SIZE);
        CATEGORY_MIN_SIZES.partition_point(|&min| min <= size) - 1
    }

    /// First category all of whose entries can hold `size` bytes.
    fn guaranteed_fit_category(size: usize) -> usize {
        CATEGORY_MIN_SIZES.partition_point(|&min| min < size)
    }

    fn update_cache_after_addition(&mut self, category: usize) {
        let mut i = category as isize;
        while i >= 0 && self.next_nonempty[i as usize] > category {
            self.next_nonempty[i as usize] = category;
            i -= 1;
        }
    }

    fn update_cache_after_removal(&mut self, category: usize) {
        if !self.categories[category].is_empty() {
            return;
        }
        let replacement = self.next_nonempty[category + 1];
        let mut i = category as isize;
        while i >= 0 && self.next_nonempty[i as usize] == category {
            self.next_nonempty[i as usize] = replacement;
            i -= 1;
        }
    }

    /// Returns `[start, start + size)` to the list. Chunks too small to hold an
    /// entry become fillers that keep the page iterable but are not reusable.
    ///
    /// # Safety
    /// The range must be unused memory on a normal page owned by this list's space.
    pub unsafe fn add(&mut self, start: usize, size: usize) {
        if size < MIN_OBJECT_SIZE {
            if size > 0 {
                HeapObjectHeader::initialize(start as *mut u8, size, FREE_LIST_GC_INFO_INDEX);
            }
            return;
        }
        let entry = Entry::create(start, size);
        let category = Self::select_category(size);
        self.categories[category].push(entry);
        self.available += size;
        self.update_cache_after_addition(category);
    }

    unsafe fn take_from(&mut self, category: usize) -> (usize, usize) {
        let entry = self.categories[category].pop();
        let size = (*entry).size();
        self.available -= size;
        self.update_cache_after_removal(category);
        (entry as usize, size)
    }

    unsafe fn take_fitting_from(&mut self, category: usize, size: usize) -> Option<(usize, usize)> {
        let entry = self.categories[category].take_fitting(size);
        if entry.is_null() {
            return None;
        }
        let found = (*entry).size();
        self.available -= found;
        self.update_cache_after_removal(category);
        Some((entry as usize, found))
    }

    /// Finds a chunk of at least `size` bytes and removes it from the list.
    /// Returns the chunk's start and its full size. The chunk's header is
    /// left in place and must be overwritten by the caller.
    pub fn allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let size = size.max(MIN_OBJECT_SIZE);
        let guaranteed = Self::guaranteed_fit_category(size);
        unsafe {
            // Fast path: big chunks that are certain to fit.
            let fast = self.next_nonempty[guaranteed.max(FAST_PATH_FIRST_CATEGORY)];
            if fast < NUMBER_OF_CATEGORIES {
                return Some(self.take_from(fast));
            }

            // Small requests look in their own category before splitting
            // larger chunks.
            let own = Self::select_category(size);
            if size <= MEDIUM_SIZE_LIMIT && !self.categories[own].is_empty() {
                if let Some(found) = self.take_fitting_from(own, size) {
                    return Some(found);
                }
            }

            if guaranteed < NUMBER_OF_CATEGORIES {
                let category = self.next_nonempty[guaranteed];
                if category < NUMBER_OF_CATEGORIES {
                    return Some(self.take_from(category));
                }
            }

            // Precise search of the category the request itself falls into.
            if own < guaranteed && !self.categories[own].is_empty() {
                return self.take_fitting_from(own, size);
            }
        }
        None
    }

    /// Drops every entry that lies within `[start, end)`.
    pub fn evict_range(&mut self, start: usize, end: usize) {
        for category in 0..NUMBER_OF_CATEGORIES {
            if self.categories[category].is_empty() {
                continue;
            }
            let before = self.categories[category].available;
            unsafe {
                self.categories[category].remove_if(|entry| {
                    let address = entry as usize;
                    address >= start && address < end
                });
            }
            self.available -= before - self.categories[category].available;
            self.update_cache_after_removal(category);
        }
    }

    /// Moves all entries of `other` into this list.
    pub fn append(&mut self, other: &mut FreeList) {
        for category in 0..NUMBER_OF_CATEGORIES {
            while !other.categories[category].is_empty() {
                unsafe {
                    let entry = other.categories[category].pop();
                    self.categories[category].push(entry);
                }
                self.update_cache_after_addition(category);
            }
        }
        self.available += other.available;
        other.clear();
    }

    pub fn clear(&mut self) {
        self.categories = [FreeListCategory::EMPTY; NUMBER_OF_CATEGORIES];
        self.next_nonempty = [NUMBER_OF_CATEGORIES; NUMBER_OF_CATEGORIES + 1];
        self.available = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.next_nonempty[0] == NUMBER_OF_CATEGORIES
    }

    /// Bytes held in entries. Fillers are not counted.
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn len(&self) -> usize {
        self.categories.iter().map(|category| category.length).sum()
    }

    fn for_each_entry(&self, mut f: impl FnMut(usize, usize)) {
        for category in self.categories.iter() {
            let mut current = category.top;
            while !current.is_null() {
                unsafe {
                    f(current as usize, (*current).size());
                    current = (*current).next;
                }
            }
        }
    }

    /// Whether `address` lies within any entry.
    pub fn contains(&self, address: usize) -> bool {
        let mut found = false;
        self.for_each_entry(|start, size| {
            found |= address >= start && address < start + size;
        });
        found
    }

    /// Size of the entry starting exactly at `address`.
    pub fn entry_size_at(&self, address: usize) -> Option<usize> {
        let mut result = None;
        self.for_each_entry(|start, size| {
            if start == address {
                result = Some(size);
            }
        });
        result
    }

    /// Checks the byte accounting and the category cache.
    pub fn verify(&self) -> bool {
        let mut total = 0;
        let mut ok = true;
        for (index, category) in self.categories.iter().enumerate() {
            let mut sum = 0;
            let mut length = 0;
            let mut current = category.top;
            while !current.is_null() {
                unsafe {
                    let size = (*current).size();
                    ok &= Self::select_category(size) == index;
                    ok &= (*current).header.is_free::<NonAtomicAccess>();
                    sum += size;
                    length += 1;
                    current = (*current).next;
                }
            }
            ok &= sum == category.available && length == category.length;
            total += sum;
        }
        for index in 0..NUMBER_OF_CATEGORIES {
            let expected = (index..NUMBER_OF_CATEGORIES)
                .find(|&i| !self.categories[i].is_empty())
                .unwrap_or(NUMBER_OF_CATEGORIES);
            ok &= self.next_nonempty[index] == expected;
        }
        ok && total == self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena {
        memory: Vec<u64>,
    }

    impl Arena {
        fn new(bytes: usize) -> Self {
            Self {
                memory: vec![0; bytes / 8],
            }
        }

        fn at(&mut self, offset: usize) -> usize {
            self.memory.as_mut_ptr() as usize + offset
        }
    }

    #[test]
    fn test_category_selection() {
        assert_eq!(FreeList::select_category(16), 0);
        assert_eq!(FreeList::select_category(23), 0);
        assert_eq!(FreeList::select_category(24), 1);
        assert_eq!(FreeList::select_category(2048), 13);
        assert_eq!(FreeList::select_category(1 << 20), NUMBER_OF_CATEGORIES - 1);
        assert_eq!(FreeList::guaranteed_fit_category(16), 0);
        assert_eq!(FreeList::guaranteed_fit_category(17), 1);
        assert_eq!(FreeList::guaranteed_fit_category(24), 1);
        assert_eq!(FreeList::guaranteed_fit_category(200), 8);
    }

    #[test]
    fn test_add_and_allocate_exact() {
        let mut arena = Arena::new(4096);
        let mut list = FreeList::new();
        unsafe {
            list.add(arena.at(0), 16);
            list.add(arena.at(64), 48);
        }
        assert_eq!(list.available(), 64);
        assert_eq!(list.len(), 2);
        assert!(list.verify());
        assert_eq!(list.allocate(16), Some((arena.at(0), 16)));
        assert_eq!(list.allocate(40), Some((arena.at(64), 48)));
        assert!(list.is_empty());
        assert_eq!(list.available(), 0);
        assert!(list.verify());
    }

    #[test]
    fn test_fillers_are_not_counted() {
        let mut arena = Arena::new(64);
        let mut list = FreeList::new();
        unsafe { list.add(arena.at(0), 8) };
        assert!(list.is_empty());
        assert_eq!(list.available(), 0);
        let header = unsafe { &*(arena.at(0) as *const HeapObjectHeader) };
        assert!(header.is_free::<NonAtomicAccess>());
        assert_eq!(header.get_size::<NonAtomicAccess>(), 8);
    }

    #[test]
    fn test_large_entries_are_preferred() {
        let mut arena = Arena::new(8192);
        let mut list = FreeList::new();
        unsafe {
            list.add(arena.at(0), 32);
            list.add(arena.at(1024), 4096);
        }
        let (start, size) = list.allocate(32).unwrap();
        assert_eq!((start, size), (arena.at(1024), 4096));
        assert_eq!(list.allocate(32), Some((arena.at(0), 32)));
        assert!(list.verify());
    }

    #[test]
    fn test_precise_search_in_own_category() {
        let mut arena = Arena::new(4096);
        let mut list = FreeList::new();
        unsafe {
            list.add(arena.at(0), 200);
            list.add(arena.at(512), 248);
        }
        // Both entries live in the 192 category; only one can hold 240 bytes.
        assert_eq!(list.allocate(240), Some((arena.at(512), 248)));
        assert_eq!(list.allocate(240), None);
        assert_eq!(list.available(), 200);
        assert!(list.verify());
    }

    #[test]
    fn test_evict_range_and_contains() {
        let mut arena = Arena::new(4096);
        let mut list = FreeList::new();
        unsafe {
            list.add(arena.at(0), 32);
            list.add(arena.at(256), 64);
            list.add(arena.at(1024), 96);
        }
        assert!(list.contains(arena.at(8)));
        assert_eq!(list.entry_size_at(arena.at(256)), Some(64));
        list.evict_range(arena.at(0), arena.at(512));
        assert!(!list.contains(arena.at(8)));
        assert_eq!(list.entry_size_at(arena.at(256)), None);
        assert_eq!(list.available(), 96);
        assert!(list.verify());
    }

    #[test]
    fn test_append_moves_everything() {
        let mut arena = Arena::new(4096);
        let mut first = FreeList::new();
        let mut second = FreeList::new();
        unsafe {
            first.add(arena.at(0), 32);
            second.add(arena.at(512), 512);
        }
        first.append(&mut second);
        assert!(second.is_empty());
        assert_eq!(first.available(), 544);
        assert_eq!(first.len(), 2);
        assert!(first.verify());
    }
}
