//! Pages are the unit of memory the heap obtains from the [`PageBackend`].
//!
//! Every page starts with a [`BasePage`] header placed right after the leading
//! guard page. Normal pages are exactly one page slot and hold many objects,
//! large pages span as many slots as needed for a single object.
//!
//! ```text
//! normal page:
//! +-------+----------+-------------------+--------------------+-------+
//! | guard | BasePage | ObjectStartBitmap | ConcurrentBitmap   | ...   |
//! +-------+----------+-------------------+--------------------+-------+
//!                                          payload ... | guard |
//! ```

use std::{
    mem::size_of,
    ptr::{addr_of_mut, NonNull},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    globals::{ALLOCATION_GRANULARITY, GUARD_PAGE_SIZE, PAGE_BASE_MASK, PAGE_SIZE},
    header::HeapObjectHeader,
    heap::HeapHandle,
    internal::{
        access_mode::AccessMode, marking_bitmap::ConcurrentBitmap,
        object_start_bitmap::ObjectStartBitmap,
    },
    invalidated_slots::InvalidatedSlots,
    page_backend::PageBackend,
    slot_set::SlotSet,
    space::SpaceType,
    util::align_up,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Normal,
    Large,
}

const EVACUATION_CANDIDATE: u8 = 1;
const NEVER_ALLOCATE: u8 = 2;

#[repr(C)]
pub struct BasePage {
    heap: *const HeapHandle,
    space: SpaceType,
    kind: PageKind,
    flags: AtomicU8,
    index_in_space: AtomicUsize,
    live_bytes: AtomicUsize,
    slot_set: Mutex<SlotSet>,
    invalidated_slots: Mutex<InvalidatedSlots>,
}

unsafe impl Send for BasePage {}
unsafe impl Sync for BasePage {}

impl BasePage {
    fn new(heap: *const HeapHandle, space: SpaceType, kind: PageKind) -> Self {
        Self {
            heap,
            space,
            kind,
            flags: AtomicU8::new(0),
            index_in_space: AtomicUsize::new(usize::MAX),
            live_bytes: AtomicUsize::new(0),
            slot_set: Mutex::new(SlotSet::new()),
            invalidated_slots: Mutex::new(InvalidatedSlots::new()),
        }
    }

    /// Page of an object given its payload. Only valid for addresses inside
    /// the first page slot, which holds for every object start.
    #[inline(always)]
    pub fn from_payload(payload: *const u8) -> *mut BasePage {
        ((payload as usize & PAGE_BASE_MASK) + GUARD_PAGE_SIZE) as *mut BasePage
    }

    #[inline(always)]
    pub fn heap(&self) -> &HeapHandle {
        unsafe { &*self.heap }
    }

    pub(crate) fn heap_ptr(&self) -> *const HeapHandle {
        self.heap
    }

    #[inline(always)]
    pub fn space(&self) -> SpaceType {
        self.space
    }

    #[inline(always)]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    #[inline(always)]
    pub fn as_normal(&self) -> &NormalPage {
        debug_assert!(!self.is_large());
        unsafe { &*(self as *const Self as *const NormalPage) }
    }

    #[inline(always)]
    pub fn as_large(&self) -> &LargePage {
        debug_assert!(self.is_large());
        unsafe { &*(self as *const Self as *const LargePage) }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Base address of the first page slot, guard page included.
    pub fn slot_base(&self) -> usize {
        self.address() - GUARD_PAGE_SIZE
    }

    pub fn payload_start(&self) -> usize {
        match self.kind {
            PageKind::Normal => self.as_normal().payload_start(),
            PageKind::Large => self.as_large().object_header() as usize,
        }
    }

    pub fn payload_end(&self) -> usize {
        match self.kind {
            PageKind::Normal => self.as_normal().payload_end(),
            PageKind::Large => self.as_large().payload_end(),
        }
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.payload_start() && address < self.payload_end()
    }

    /// Header of the live or dead object spanning `address`. Returns null for
    /// addresses in free memory, inside a header or outside of the payload.
    pub fn object_header_from_inner_address<M: AccessMode>(
        &self,
        address: usize,
    ) -> *mut HeapObjectHeader {
        if !self.contains(address) {
            return core::ptr::null_mut();
        }
        let header = match self.kind {
            PageKind::Large => self.as_large().object_header(),
            PageKind::Normal => {
                let header = self.as_normal().object_start_bitmap().find_header::<M>(address);
                if header.is_null() || (header as usize) < self.payload_start() {
                    return core::ptr::null_mut();
                }
                header
            }
        };
        let object = unsafe { &*header };
        if object.is_free::<M>() || address >= object.object_end::<M>() {
            return core::ptr::null_mut();
        }
        header
    }

    pub(crate) fn index_in_space(&self) -> usize {
        self.index_in_space.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index_in_space(&self, index: usize) {
        self.index_in_space.store(index, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.flags.load(Ordering::Acquire) & EVACUATION_CANDIDATE != 0
    }

    pub fn set_evacuation_candidate(&self, value: bool) {
        if value {
            self.flags.fetch_or(EVACUATION_CANDIDATE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!EVACUATION_CANDIDATE, Ordering::AcqRel);
        }
    }

    /// Pages that are about to be evacuated hand out no memory.
    pub fn never_allocate(&self) -> bool {
        self.flags.load(Ordering::Acquire) & NEVER_ALLOCATE != 0
    }

    pub fn set_never_allocate(&self, value: bool) {
        if value {
            self.flags.fetch_or(NEVER_ALLOCATE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!NEVER_ALLOCATE, Ordering::AcqRel);
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn increment_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Remembers that `slot`, which lies on this page, points into an
    /// evacuation candidate.
    pub fn record_slot(&self, slot: usize) {
        debug_assert!(self.contains(slot));
        self.slot_set.lock().insert(slot);
    }

    pub fn slot_set(&self) -> &Mutex<SlotSet> {
        &self.slot_set
    }

    /// Marks `size` bytes starting at `header` as no longer matching recorded
    /// slots. Recorded slots inside of it are re-checked before use.
    pub fn register_invalidated_object(&self, header: &HeapObjectHeader, size: usize) {
        self.invalidated_slots.lock().register(header.address(), size);
    }

    pub fn invalidated_slots(&self) -> &Mutex<InvalidatedSlots> {
        &self.invalidated_slots
    }

    pub fn clear_remembered_slots(&self) {
        self.slot_set.lock().clear();
        self.invalidated_slots.lock().clear();
    }

    /// Returns the memory of `page` to the backend.
    ///
    /// # Safety
    /// `page` must not be referenced by any space or object anymore.
    pub unsafe fn destroy(page: *mut BasePage, backend: &PageBackend) {
        match (*page).kind {
            PageKind::Normal => NormalPage::destroy(page.cast(), backend),
            PageKind::Large => LargePage::destroy(page.cast(), backend),
        }
    }
}

#[repr(C)]
pub struct NormalPage {
    base: BasePage,
    object_start_bitmap: ObjectStartBitmap,
    marking_bitmap: ConcurrentBitmap,
}

impl NormalPage {
    pub fn create(
        backend: &PageBackend,
        heap: *const HeapHandle,
        space: SpaceType,
    ) -> Option<NonNull<NormalPage>> {
        debug_assert!(space != SpaceType::Large);
        let base = backend.allocate_normal_page_memory()?;
        let page = (base + GUARD_PAGE_SIZE) as *mut NormalPage;
        unsafe {
            addr_of_mut!((*page).base).write(BasePage::new(heap, space, PageKind::Normal));
            ObjectStartBitmap::initialize(addr_of_mut!((*page).object_start_bitmap));
            ConcurrentBitmap::initialize(addr_of_mut!((*page).marking_bitmap));
        }
        backend.register_page(base, 1, page.cast());
        NonNull::new(page)
    }

    unsafe fn destroy(page: *mut NormalPage, backend: &PageBackend) {
        let base = (*page).base.slot_base();
        backend.unregister_page(base, 1);
        core::ptr::drop_in_place(addr_of_mut!((*page).base));
        backend.free_normal_page_memory(base);
    }

    pub fn base(&self) -> &BasePage {
        &self.base
    }

    pub fn as_base_ptr(&self) -> *mut BasePage {
        self as *const Self as *mut BasePage
    }

    pub fn object_start_bitmap(&self) -> &ObjectStartBitmap {
        &self.object_start_bitmap
    }

    pub fn marking_bitmap(&self) -> &ConcurrentBitmap {
        &self.marking_bitmap
    }

    /// Usable bytes of every normal page.
    pub const fn payload_size() -> usize {
        PAGE_SIZE - 2 * GUARD_PAGE_SIZE - align_up(size_of::<NormalPage>(), ALLOCATION_GRANULARITY)
    }

    #[inline]
    pub fn payload_start(&self) -> usize {
        align_up(
            self as *const Self as usize + size_of::<NormalPage>(),
            ALLOCATION_GRANULARITY,
        )
    }

    #[inline]
    pub fn payload_end(&self) -> usize {
        self.base.slot_base() + PAGE_SIZE - GUARD_PAGE_SIZE
    }

    /// Calls `f` for every header on the page, free-list entries included.
    /// The page must be iterable: no linear allocation buffer may point into it.
    pub fn for_each_header<M: AccessMode>(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        let mut current = self.payload_start();
        let end = self.payload_end();
        while current < end {
            let header = unsafe { &*(current as *const HeapObjectHeader) };
            let size = header.get_size::<M>();
            debug_assert!(size != 0, "corrupted header at {:#x}", current);
            f(header);
            current += size;
        }
    }
}

#[repr(C)]
pub struct LargePage {
    base: BasePage,
    slots: usize,
    object_size: usize,
}

impl LargePage {
    const HEADER_OFFSET: usize = align_up(size_of::<LargePage>(), ALLOCATION_GRANULARITY);

    /// Bytes of address space, guard pages included, a large page for an
    /// object of `object_size` bytes occupies.
    pub const fn allocation_size(object_size: usize) -> usize {
        2 * GUARD_PAGE_SIZE + Self::HEADER_OFFSET + object_size
    }

    pub fn create(
        backend: &PageBackend,
        heap: *const HeapHandle,
        object_size: usize,
    ) -> Option<NonNull<LargePage>> {
        let slots = PageBackend::slots_for(Self::allocation_size(object_size));
        let base = backend.allocate_large_page_memory(slots)?;
        let page = (base + GUARD_PAGE_SIZE) as *mut LargePage;
        unsafe {
            page.write(LargePage {
                base: BasePage::new(heap, SpaceType::Large, PageKind::Large),
                slots,
                object_size,
            });
        }
        backend.register_page(base, slots, page.cast());
        NonNull::new(page)
    }

    unsafe fn destroy(page: *mut LargePage, backend: &PageBackend) {
        let base = (*page).base.slot_base();
        let slots = (*page).slots;
        backend.unregister_page(base, slots);
        core::ptr::drop_in_place(addr_of_mut!((*page).base));
        backend.free_large_page_memory(base, slots);
    }

    #[inline(always)]
    pub fn from_header(header: &HeapObjectHeader) -> *mut LargePage {
        (header.address() - Self::HEADER_OFFSET) as *mut LargePage
    }

    pub fn base(&self) -> &BasePage {
        &self.base
    }

    pub fn as_base_ptr(&self) -> *mut BasePage {
        self as *const Self as *mut BasePage
    }

    #[inline(always)]
    pub fn object_header(&self) -> *mut HeapObjectHeader {
        (self as *const Self as usize + Self::HEADER_OFFSET) as *mut HeapObjectHeader
    }

    /// Size of the object including its header.
    #[inline(always)]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn payload_end(&self) -> usize {
        self.object_header() as usize + self.object_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{globals::MB, internal::access_mode::NonAtomicAccess};

    #[test]
    fn test_normal_page_layout() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let page = NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal1).unwrap();
        let page = unsafe { page.as_ref() };
        assert_eq!(page.base().slot_base() % PAGE_SIZE, 0);
        assert_eq!(page.payload_end() - page.payload_start(), NormalPage::payload_size());
        assert_eq!(page.payload_start() % ALLOCATION_GRANULARITY, 0);
        assert_eq!(
            BasePage::from_payload(page.payload_start() as *const u8),
            page.as_base_ptr()
        );
        assert_eq!(backend.lookup(page.payload_end() - 8), page.as_base_ptr());
        assert!(page.object_start_bitmap().is_empty());
        assert!(page.marking_bitmap().is_clean());
        unsafe { BasePage::destroy(page.as_base_ptr(), &backend) };
        assert_eq!(backend.committed_bytes(), 0);
    }

    #[test]
    fn test_large_page_lookup_spans_all_slots() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let object_size = PAGE_SIZE + 64;
        let page = LargePage::create(&backend, core::ptr::null(), object_size).unwrap();
        let page = unsafe { page.as_ref() };
        assert_eq!(page.slots(), 2);
        let header = unsafe { HeapObjectHeader::initialize(page.object_header().cast(), 0, 1) };
        assert_eq!(LargePage::from_header(header), page as *const _ as *mut _);
        assert_eq!(header.allocated_size::<NonAtomicAccess>(), object_size);
        let inner = header.address() + PAGE_SIZE;
        assert_eq!(backend.lookup(inner), page.as_base_ptr());
        assert_eq!(
            page.base().object_header_from_inner_address::<NonAtomicAccess>(inner),
            page.object_header()
        );
        unsafe { BasePage::destroy(page.as_base_ptr(), &backend) };
        assert!(backend.lookup(inner).is_null());
    }

    #[test]
    fn test_inner_address_lookup_on_normal_page() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let page = NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal2).unwrap();
        let page = unsafe { page.as_ref() };
        let start = page.payload_start();
        let header = unsafe { HeapObjectHeader::initialize(start as *mut u8, 48, 1) };
        page.object_start_bitmap().set_bit::<NonAtomicAccess>(start);
        let base = page.base();
        assert_eq!(
            base.object_header_from_inner_address::<NonAtomicAccess>(start + 40),
            header as *mut _
        );
        assert!(base
            .object_header_from_inner_address::<NonAtomicAccess>(start + 48)
            .is_null());
        unsafe { BasePage::destroy(page.as_base_ptr(), &backend) };
    }

    #[test]
    fn test_evacuation_flags() {
        let backend = PageBackend::new(4 * MB).unwrap();
        let page = NormalPage::create(&backend, core::ptr::null(), SpaceType::Normal4).unwrap();
        let base = unsafe { page.as_ref() }.base();
        assert!(!base.is_evacuation_candidate());
        base.set_evacuation_candidate(true);
        base.set_never_allocate(true);
        assert!(base.is_evacuation_candidate() && base.never_allocate());
        base.set_evacuation_candidate(false);
        assert!(!base.is_evacuation_candidate() && base.never_allocate());
        let slot = base.payload_start() + 64;
        base.record_slot(slot);
        assert!(base.slot_set().lock().contains(slot));
        base.clear_remembered_slots();
        assert!(base.slot_set().lock().is_empty());
        unsafe { BasePage::destroy(base as *const _ as *mut _, &backend) };
    }
}
