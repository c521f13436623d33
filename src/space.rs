use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{
    free_list::FreeList,
    globals::{NUM_NORMAL_SPACES, NUM_SPACES},
    header::HeapObjectHeader,
    internal::access_mode::NonAtomicAccess,
    page::{BasePage, NormalPage},
};

/// Spaces partition the heap by object size. Normal spaces hold objects below
/// the large object threshold on shared pages, the large space hands out one
/// page per object.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SpaceType {
    /// Objects up to 32 bytes, header included.
    Normal1,
    /// Objects up to 64 bytes.
    Normal2,
    /// Objects up to 128 bytes.
    Normal3,
    Normal4,
    Large,
}

impl SpaceType {
    pub const NORMAL: [SpaceType; NUM_NORMAL_SPACES] = [
        SpaceType::Normal1,
        SpaceType::Normal2,
        SpaceType::Normal3,
        SpaceType::Normal4,
    ];

    pub const ALL: [SpaceType; NUM_SPACES] = [
        SpaceType::Normal1,
        SpaceType::Normal2,
        SpaceType::Normal3,
        SpaceType::Normal4,
        SpaceType::Large,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Normal space for an allocation of `size` bytes, header included.
    #[inline(always)]
    pub const fn for_normal_size(size: usize) -> SpaceType {
        if size <= 32 {
            SpaceType::Normal1
        } else if size <= 64 {
            SpaceType::Normal2
        } else if size <= 128 {
            SpaceType::Normal3
        } else {
            SpaceType::Normal4
        }
    }

    pub fn is_large(self) -> bool {
        self == SpaceType::Large
    }
}

/// Page pointer that may cross threads. Pages are owned by their space and
/// outlive every copy of this handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageRef(NonNull<BasePage>);

unsafe impl Send for PageRef {}
unsafe impl Sync for PageRef {}

impl PageRef {
    pub fn new(page: NonNull<BasePage>) -> Self {
        Self(page)
    }

    pub fn as_ptr(self) -> *mut BasePage {
        self.0.as_ptr()
    }

    #[inline(always)]
    pub fn get<'a>(self) -> &'a BasePage {
        unsafe { &*self.0.as_ptr() }
    }
}

/// Pages of one space. Slots keep their index for the lifetime of the page,
/// so iterating a snapshot stays valid while pages come and go.
#[derive(Default)]
pub struct PageList {
    slots: Vec<Option<PageRef>>,
    free_slots: Vec<usize>,
    len: usize,
}

impl PageList {
    fn insert(&mut self, page: PageRef) {
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index] = Some(page);
                index
            }
            None => {
                self.slots.push(Some(page));
                self.slots.len() - 1
            }
        };
        page.get().set_index_in_space(index);
        self.len += 1;
    }

    fn remove(&mut self, page: PageRef) {
        let index = page.get().index_in_space();
        debug_assert_eq!(self.slots[index], Some(page));
        self.slots[index] = None;
        self.free_slots.push(index);
        self.len -= 1;
        page.get().set_index_in_space(usize::MAX);
    }

    pub fn iter(&self) -> impl Iterator<Item = PageRef> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct BaseSpace {
    space_type: SpaceType,
    pages: Mutex<PageList>,
}

impl BaseSpace {
    fn new(space_type: SpaceType) -> Self {
        Self {
            space_type,
            pages: Mutex::new(PageList::default()),
        }
    }

    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    pub fn add_page(&self, page: PageRef) {
        debug_assert_eq!(page.get().space(), self.space_type);
        self.pages.lock().insert(page);
    }

    /// Unlinks `page`. The page itself is not released.
    pub fn remove_page(&self, page: PageRef) {
        self.pages.lock().remove(page);
    }

    /// Copy of the current page set.
    pub fn pages(&self) -> Vec<PageRef> {
        self.pages.lock().iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bump pointer region carved out of a free-list entry. The region itself has
/// no header and no object start bit until it is handed back.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct LinearAllocationBuffer {
    start: usize,
    size: usize,
}

impl LinearAllocationBuffer {
    pub fn set(&mut self, start: usize, size: usize) {
        self.start = start;
        self.size = size;
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn limit(&self) -> usize {
        self.start + self.size
    }

    /// Bumps `bytes` off the front of the buffer.
    #[inline(always)]
    pub fn allocate(&mut self, bytes: usize) -> Option<usize> {
        if bytes > self.size {
            return None;
        }
        let result = self.start;
        self.start += bytes;
        self.size -= bytes;
        Some(result)
    }
}

pub struct NormalPageSpace {
    pub(crate) base: BaseSpace,
    pub(crate) free_list: FreeList,
    pub(crate) lab: LinearAllocationBuffer,
}

impl NormalPageSpace {
    fn new(space_type: SpaceType) -> Self {
        Self {
            base: BaseSpace::new(space_type),
            free_list: FreeList::new(),
            lab: LinearAllocationBuffer::default(),
        }
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn free_list_mut(&mut self) -> &mut FreeList {
        &mut self.free_list
    }

    pub fn lab(&self) -> LinearAllocationBuffer {
        self.lab
    }

    /// Returns `[start, start + size)` to the free list and records the chunk
    /// as an object start so the page stays iterable.
    pub fn add_to_free_list(&mut self, start: usize, size: usize) {
        if size == 0 {
            return;
        }
        unsafe { self.free_list.add(start, size) };
        let page = BasePage::from_payload(start as *const u8);
        unsafe {
            (*page)
                .as_normal()
                .object_start_bitmap()
                .set_bit::<NonAtomicAccess>(start);
        }
    }

    /// Installs `[start, start + size)` as the new linear allocation buffer,
    /// returning the previous one to the free list.
    pub fn set_lab(&mut self, start: usize, size: usize) {
        self.reset_lab();
        if size > 0 {
            let page = BasePage::from_payload(start as *const u8);
            unsafe {
                (*page)
                    .as_normal()
                    .object_start_bitmap()
                    .clear_bit::<NonAtomicAccess>(start);
            }
        }
        self.lab.set(start, size);
    }

    pub fn reset_lab(&mut self) {
        let lab = self.lab;
        self.lab.set(0, 0);
        self.add_to_free_list(lab.start(), lab.size());
    }

    /// Page owning the current linear allocation buffer, if any.
    pub fn lab_page(&self) -> Option<&NormalPage> {
        if self.lab.size() == 0 {
            return None;
        }
        let page = BasePage::from_payload(self.lab.start() as *const u8);
        Some(unsafe { (*page).as_normal() })
    }
}

pub struct LargePageSpace {
    pub(crate) base: BaseSpace,
}

/// All spaces of a heap.
pub struct RawHeap {
    normal: [NormalPageSpace; NUM_NORMAL_SPACES],
    large: LargePageSpace,
}

impl Default for RawHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RawHeap {
    pub fn new() -> Self {
        Self {
            normal: SpaceType::NORMAL.map(NormalPageSpace::new),
            large: LargePageSpace {
                base: BaseSpace::new(SpaceType::Large),
            },
        }
    }

    #[inline(always)]
    pub fn normal_space(&mut self, space: SpaceType) -> &mut NormalPageSpace {
        debug_assert!(!space.is_large());
        &mut self.normal[space.index()]
    }

    pub fn normal_space_ref(&self, space: SpaceType) -> &NormalPageSpace {
        &self.normal[space.index()]
    }

    pub fn normal_spaces(&mut self) -> &mut [NormalPageSpace; NUM_NORMAL_SPACES] {
        &mut self.normal
    }

    pub fn large_space(&mut self) -> &mut LargePageSpace {
        &mut self.large
    }

    pub fn base_space(&self, space: SpaceType) -> &BaseSpace {
        if space.is_large() {
            &self.large.base
        } else {
            &self.normal[space.index()].base
        }
    }

    pub fn add_page(&self, page: PageRef) {
        self.base_space(page.get().space()).add_page(page);
    }

    pub fn remove_page(&self, page: PageRef) {
        self.base_space(page.get().space()).remove_page(page);
    }

    /// Snapshot of every page of every space.
    pub fn pages(&self) -> Vec<PageRef> {
        let mut pages = Vec::with_capacity(self.page_count());
        for space in self.normal.iter() {
            pages.extend(space.base.pages());
        }
        pages.extend(self.large.base.pages());
        pages
    }

    pub fn page_count(&self) -> usize {
        self.normal.iter().map(|space| space.base.len()).sum::<usize>() + self.large.base.len()
    }

    /// Hands all linear allocation buffers back to their free lists so that
    /// every page becomes iterable.
    pub fn reset_labs(&mut self) {
        for space in self.normal.iter_mut() {
            space.reset_lab();
        }
    }

    pub fn clear_free_lists(&mut self) {
        for space in self.normal.iter_mut() {
            space.free_list.clear();
        }
    }

    pub fn free_list_bytes(&self) -> usize {
        self.normal
            .iter()
            .map(|space| space.free_list.available())
            .sum()
    }

    /// Calls `f` for every object header on every page, free-list entries
    /// excluded. Linear allocation buffers must be reset.
    pub fn for_each_object(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        debug_assert!(self.normal.iter().all(|space| space.lab.size() == 0));
        for page in self.pages() {
            let page = page.get();
            if page.is_large() {
                f(unsafe { &*page.as_large().object_header() });
            } else {
                page.as_normal().for_each_header::<NonAtomicAccess>(|header| {
                    if !header.is_free::<NonAtomicAccess>() {
                        f(header);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{globals::MB, page_backend::PageBackend};

    #[test]
    fn test_space_for_size() {
        assert_eq!(SpaceType::for_normal_size(16), SpaceType::Normal1);
        assert_eq!(SpaceType::for_normal_size(32), SpaceType::Normal1);
        assert_eq!(SpaceType::for_normal_size(40), SpaceType::Normal2);
        assert_eq!(SpaceType::for_normal_size(128), SpaceType::Normal3);
        assert_eq!(SpaceType::for_normal_size(136), SpaceType::Normal4);
    }

    #[test]
    fn test_lab_bump_allocation() {
        let mut lab = LinearAllocationBuffer::default();
        lab.set(0x1000, 48);
        assert_eq!(lab.allocate(16), Some(0x1000));
        assert_eq!(lab.allocate(32), Some(0x1010));
        assert_eq!(lab.allocate(8), None);
        assert_eq!(lab.limit(), 0x1030);
    }

    #[test]
    fn test_page_list_indices_are_stable() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let mut heap = RawHeap::new();
        let pages = (0..3)
            .map(|_| {
                let page =
                    NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal2).unwrap();
                PageRef::new(page.cast())
            })
            .collect::<Vec<_>>();
        for page in pages.iter() {
            heap.add_page(*page);
        }
        heap.remove_page(pages[0]);
        assert_eq!(heap.page_count(), 2);
        assert_eq!(pages[2].get().index_in_space(), 2);
        let fresh = NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal2).unwrap();
        let fresh = PageRef::new(fresh.cast());
        heap.add_page(fresh);
        assert_eq!(fresh.get().index_in_space(), 0);
        assert_eq!(heap.pages(), vec![fresh, pages[1], pages[2]]);
        for page in pages.into_iter().chain(Some(fresh)) {
            unsafe { BasePage::destroy(page.as_ptr(), &backend) };
        }
    }

    #[test]
    fn test_reset_lab_makes_page_iterable() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let mut heap = RawHeap::new();
        let page = NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal1).unwrap();
        let page_ref = PageRef::new(page.cast());
        heap.add_page(page_ref);
        let normal = unsafe { page.as_ref() };
        let space = heap.normal_space(SpaceType::Normal1);
        space.set_lab(normal.payload_start(), NormalPage::payload_size());
        assert!(!normal
            .object_start_bitmap()
            .check_bit::<NonAtomicAccess>(normal.payload_start()));
        let object = space.lab.allocate(32).unwrap();
        unsafe { HeapObjectHeader::initialize(object as *mut u8, 32, 1) };
        normal
            .object_start_bitmap()
            .set_bit::<NonAtomicAccess>(object);
        heap.reset_labs();
        let space = heap.normal_space(SpaceType::Normal1);
        assert_eq!(space.lab().size(), 0);
        assert_eq!(
            space.free_list().available(),
            NormalPage::payload_size() - 32
        );
        let mut objects = 0;
        heap.for_each_object(|_| objects += 1);
        assert_eq!(objects, 1);
        heap.remove_page(page_ref);
        unsafe { BasePage::destroy(page_ref.as_ptr(), &backend) };
    }
}
