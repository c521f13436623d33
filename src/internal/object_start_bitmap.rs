use std::sync::atomic::AtomicU8;

use crate::{
    globals::{ALLOCATION_GRANULARITY, PAGE_BASE_MASK, PAGE_SIZE},
    header::HeapObjectHeader,
    internal::access_mode::{AccessMode, NonAtomicAccess},
};

const BITS_PER_CELL: usize = 8;
const CELL_MASK: usize = BITS_PER_CELL - 1;
const BITMAP_SIZE: usize = (PAGE_SIZE + (BITS_PER_CELL * ALLOCATION_GRANULARITY) - 1)
    / (BITS_PER_CELL * ALLOCATION_GRANULARITY);

/// A bitmap for recording object starts. Objects have to be allocated at
/// minimum granularity of [`ALLOCATION_GRANULARITY`].
///
/// The bitmap lives inside the page header, so the page base is recovered from
/// the bitmap's own address. Supports concurrent reads from multiple threads
/// but only a single mutator thread can write to it.
#[repr(C)]
pub struct ObjectStartBitmap {
    cells: [AtomicU8; BITMAP_SIZE],
}

impl ObjectStartBitmap {
    /// # Safety
    /// `at` must be writable memory inside the first slot of a page.
    pub unsafe fn initialize(at: *mut Self) {
        core::ptr::write_bytes(at.cast::<u8>(), 0, core::mem::size_of::<Self>());
    }

    #[inline(always)]
    fn offset(&self) -> usize {
        self as *const Self as usize & PAGE_BASE_MASK
    }

    #[inline(always)]
    fn object_start_index_and_bit(&self, header_address: usize) -> (usize, usize) {
        let object_offset = header_address - self.offset();
        debug_assert_eq!(object_offset & (ALLOCATION_GRANULARITY - 1), 0);
        let object_start_number = object_offset / ALLOCATION_GRANULARITY;
        let cell = object_start_number / BITS_PER_CELL;
        debug_assert!(cell < BITMAP_SIZE);
        (cell, object_start_number & CELL_MASK)
    }

    #[inline]
    pub fn set_bit<M: AccessMode>(&self, header_address: usize) {
        let (cell, bit) = self.object_start_index_and_bit(header_address);
        let value = M::load_u8(&self.cells[cell]);
        M::store_u8(&self.cells[cell], value | (1 << bit));
    }

    #[inline]
    pub fn clear_bit<M: AccessMode>(&self, header_address: usize) {
        let (cell, bit) = self.object_start_index_and_bit(header_address);
        let value = M::load_u8(&self.cells[cell]);
        M::store_u8(&self.cells[cell], value & !(1 << bit));
    }

    #[inline]
    pub fn check_bit<M: AccessMode>(&self, header_address: usize) -> bool {
        let (cell, bit) = self.object_start_index_and_bit(header_address);
        M::load_u8(&self.cells[cell]) & (1 << bit) != 0
    }

    /// Finds the header of the object that contains `address`. Returns null
    /// if no object starts at or before `address` on this page.
    pub fn find_header<M: AccessMode>(&self, address: usize) -> *mut HeapObjectHeader {
        let object_offset = address - self.offset();
        let object_start_number = object_offset / ALLOCATION_GRANULARITY;
        let mut cell_index = object_start_number / BITS_PER_CELL;
        let bit = object_start_number & CELL_MASK;
        let mut byte =
            (M::load_u8(&self.cells[cell_index]) as u32 & ((1u32 << (bit + 1)) - 1)) as u8;
        while byte == 0 && cell_index > 0 {
            cell_index -= 1;
            byte = M::load_u8(&self.cells[cell_index]);
        }
        if byte == 0 {
            return core::ptr::null_mut();
        }
        let leading_zeroes = byte.leading_zeros() as usize;
        let object_start_number = cell_index * BITS_PER_CELL + (BITS_PER_CELL - 1) - leading_zeroes;
        (self.offset() + object_start_number * ALLOCATION_GRANULARITY) as *mut HeapObjectHeader
    }

    /// Calls `callback` with every recorded object start in address order.
    pub fn iterate(&self, mut callback: impl FnMut(usize)) {
        for (cell_index, cell) in self.cells.iter().enumerate() {
            let mut value = NonAtomicAccess::load_u8(cell);
            while value != 0 {
                let trailing_zeroes = value.trailing_zeros() as usize;
                let object_start_number = cell_index * BITS_PER_CELL + trailing_zeroes;
                callback(self.offset() + object_start_number * ALLOCATION_GRANULARITY);
                value &= value - 1;
            }
        }
    }

    pub fn clear<M: AccessMode>(&self) {
        for cell in self.cells.iter() {
            M::store_u8(cell, 0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells
            .iter()
            .all(|cell| NonAtomicAccess::load_u8(cell) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::access_mode::AtomicAccess;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct PageAlignedBitmap {
        layout: Layout,
        bitmap: *mut ObjectStartBitmap,
    }

    impl PageAlignedBitmap {
        fn new() -> Self {
            let layout =
                Layout::from_size_align(core::mem::size_of::<ObjectStartBitmap>(), PAGE_SIZE)
                    .unwrap();
            let bitmap = unsafe { alloc_zeroed(layout).cast::<ObjectStartBitmap>() };
            assert!(!bitmap.is_null());
            Self { layout, bitmap }
        }
        fn get(&self) -> &ObjectStartBitmap {
            unsafe { &*self.bitmap }
        }
        fn base(&self) -> usize {
            self.bitmap as usize
        }
    }

    impl Drop for PageAlignedBitmap {
        fn drop(&mut self) {
            unsafe { dealloc(self.bitmap.cast(), self.layout) }
        }
    }

    #[test]
    fn test_empty_bitmap() {
        let holder = PageAlignedBitmap::new();
        assert!(holder.get().is_empty());
        assert!(holder.get().find_header::<NonAtomicAccess>(holder.base() + 4096).is_null());
    }

    #[test]
    fn test_set_and_check() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let object = holder.base() + 8 * 1024;
        bitmap.set_bit::<AtomicAccess>(object);
        assert!(bitmap.check_bit::<NonAtomicAccess>(object));
        assert!(!bitmap.check_bit::<NonAtomicAccess>(object + 8));
        bitmap.clear_bit::<NonAtomicAccess>(object);
        assert!(bitmap.is_empty());
    }

    #[test]
    fn test_find_header_walks_backwards_across_cells() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let first = holder.base() + 8 * 1024;
        let second = first + 1024;
        bitmap.set_bit::<NonAtomicAccess>(first);
        bitmap.set_bit::<NonAtomicAccess>(second);
        assert_eq!(bitmap.find_header::<NonAtomicAccess>(first) as usize, first);
        assert_eq!(bitmap.find_header::<NonAtomicAccess>(first + 8) as usize, first);
        assert_eq!(bitmap.find_header::<NonAtomicAccess>(second - 8) as usize, first);
        assert_eq!(bitmap.find_header::<AtomicAccess>(second + 200) as usize, second);
    }

    #[test]
    fn test_iterate_in_address_order() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let starts = [holder.base() + 8192, holder.base() + 8200, holder.base() + 9000];
        for start in starts.iter().rev() {
            bitmap.set_bit::<NonAtomicAccess>(*start);
        }
        let mut seen = vec![];
        bitmap.iterate(|address| seen.push(address));
        assert_eq!(seen, starts);
        bitmap.clear::<NonAtomicAccess>();
        assert!(bitmap.is_empty());
    }
}
