use atomic::Atomic;

use crate::{
    globals::{ALLOCATION_GRANULARITY, PAGE_BASE_MASK, PAGE_SIZE},
    internal::access_mode::{AccessMode, NonAtomicAccess},
};

pub type CellType = u32;

pub const BITS_PER_CELL: u32 = 32;
pub const BITS_PER_CELL_LOG2: u32 = 5;
pub const BIT_INDEX_MASK: u32 = BITS_PER_CELL - 1;
pub const BYTES_PER_CELL: usize = core::mem::size_of::<CellType>();
const BITS_COUNT: usize = PAGE_SIZE / ALLOCATION_GRANULARITY;
pub const CELLS_COUNT: usize = (BITS_COUNT + BITS_PER_CELL as usize - 1) >> BITS_PER_CELL_LOG2;

/// Address returned when a lookup has nothing to report.
pub const NULL_ADDRESS: usize = 0;

/// Mark bitmap of a normal page: one bit per allocation granule, set for the
/// header address of every marked object.
///
/// Like the object start bitmap it is embedded in the page header and computes
/// the page base from its own address.
#[repr(C)]
pub struct ConcurrentBitmap {
    cells: [Atomic<CellType>; CELLS_COUNT],
}

#[inline(always)]
pub const fn index_to_cell(index: u32) -> u32 {
    index >> BITS_PER_CELL_LOG2
}

#[inline(always)]
pub const fn index_in_cell(index: u32) -> u32 {
    index & BIT_INDEX_MASK
}

impl ConcurrentBitmap {
    pub const SIZE: usize = CELLS_COUNT * BYTES_PER_CELL;

    /// # Safety
    /// `at` must be writable memory inside the first slot of a page.
    pub unsafe fn initialize(at: *mut Self) {
        core::ptr::write_bytes(at.cast::<u8>(), 0, core::mem::size_of::<Self>());
    }

    #[inline(always)]
    fn chunk_base(&self) -> usize {
        self as *const Self as usize & PAGE_BASE_MASK
    }

    #[inline(always)]
    pub fn address_to_index(&self, address: usize) -> u32 {
        debug_assert!(address >= self.chunk_base() && address < self.chunk_base() + PAGE_SIZE);
        ((address - self.chunk_base()) / ALLOCATION_GRANULARITY) as u32
    }

    #[inline(always)]
    pub fn index_to_address(&self, index: u32) -> usize {
        self.chunk_base() + index as usize * ALLOCATION_GRANULARITY
    }

    #[inline(always)]
    fn cell(&self, cell_index: u32) -> &Atomic<CellType> {
        &self.cells[cell_index as usize]
    }

    /// Sets the bit for `address`. Returns false if it was already set.
    #[inline]
    pub fn set_bit<M: AccessMode>(&self, address: usize) -> bool {
        let index = self.address_to_index(address);
        M::set_bits(self.cell(index_to_cell(index)), 1 << index_in_cell(index))
    }

    #[inline]
    pub fn clear_bit<M: AccessMode>(&self, address: usize) {
        let index = self.address_to_index(address);
        M::clear_bits(self.cell(index_to_cell(index)), 1 << index_in_cell(index))
    }

    #[inline]
    pub fn is_set<M: AccessMode>(&self, address: usize) -> bool {
        let index = self.address_to_index(address);
        M::load_cell(self.cell(index_to_cell(index))) & (1 << index_in_cell(index)) != 0
    }

    /// Sets all bits in `[start_index, end_index)`.
    pub fn set_range<M: AccessMode>(&self, start_index: u32, end_index: u32) {
        if start_index >= end_index {
            return;
        }
        let end_index = end_index - 1;
        let start_cell_index = index_to_cell(start_index);
        let start_index_mask: CellType = 1 << index_in_cell(start_index);
        let end_cell_index = index_to_cell(end_index);
        let end_index_mask: CellType = 1 << index_in_cell(end_index);
        if start_cell_index != end_cell_index {
            M::set_bits(self.cell(start_cell_index), !(start_index_mask - 1));
            for i in start_cell_index + 1..end_cell_index {
                M::store_cell(self.cell(i), !0);
            }
            M::set_bits(self.cell(end_cell_index), end_index_mask | (end_index_mask - 1));
        } else {
            M::set_bits(
                self.cell(start_cell_index),
                end_index_mask | (end_index_mask - start_index_mask),
            );
        }
    }

    /// Returns true if all bits in `[start_index, end_index)` are set. Only
    /// used for verification and therefore reads non-atomically.
    pub fn all_bits_set_in_range(&self, start_index: u32, end_index: u32) -> bool {
        if start_index >= end_index {
            return false;
        }
        let end_index = end_index - 1;

        let start_cell_index = index_to_cell(start_index);
        let start_index_mask: CellType = 1 << index_in_cell(start_index);

        let end_cell_index = index_to_cell(end_index);
        let end_index_mask: CellType = 1 << index_in_cell(end_index);

        let load = |i: u32| NonAtomicAccess::load_cell(self.cell(i));

        if start_cell_index != end_cell_index {
            let matching_mask = !(start_index_mask - 1);
            if load(start_cell_index) & matching_mask != matching_mask {
                return false;
            }
            for i in start_cell_index + 1..end_cell_index {
                if load(i) != !0 {
                    return false;
                }
            }
            let matching_mask = end_index_mask | (end_index_mask - 1);
            load(end_cell_index) & matching_mask == matching_mask
        } else {
            let matching_mask = end_index_mask | (end_index_mask - start_index_mask);
            load(end_cell_index) & matching_mask == matching_mask
        }
    }

    /// Returns true if no bit in `[start_index, end_index)` is set.
    pub fn all_bits_clear_in_range(&self, start_index: u32, end_index: u32) -> bool {
        if start_index >= end_index {
            return true;
        }
        let end_index = end_index - 1;

        let start_cell_index = index_to_cell(start_index);
        let start_index_mask: CellType = 1 << index_in_cell(start_index);

        let end_cell_index = index_to_cell(end_index);
        let end_index_mask: CellType = 1 << index_in_cell(end_index);

        let load = |i: u32| NonAtomicAccess::load_cell(self.cell(i));

        if start_cell_index != end_cell_index {
            let matching_mask = !(start_index_mask - 1);
            if load(start_cell_index) & matching_mask != 0 {
                return false;
            }
            for i in start_cell_index + 1..end_cell_index {
                if load(i) != 0 {
                    return false;
                }
            }
            let matching_mask = end_index_mask | (end_index_mask - 1);
            load(end_cell_index) & matching_mask == 0
        } else {
            let matching_mask = end_index_mask | (end_index_mask - start_index_mask);
            load(end_cell_index) & matching_mask == 0
        }
    }

    /// Walks the bitmap backwards from `maybe_inner_ptr` and returns the start
    /// of the closest preceding marked object: a set bit whose previous bit is
    /// unset. Returns [`NULL_ADDRESS`] when the bit of `maybe_inner_ptr` itself
    /// is set, and the page base when nothing is marked before it.
    pub fn find_previous_marked_object(&self, maybe_inner_ptr: usize) -> usize {
        let load = |i: u32| NonAtomicAccess::load_cell(self.cell(i));

        let index = self.address_to_index(maybe_inner_ptr);
        let mut cell_index = index_to_cell(index);
        let mask: CellType = 1 << index_in_cell(index);
        let mut cell = load(cell_index);
        // If the markbit is already set, bail out.
        if cell & mask != 0 {
            return NULL_ADDRESS;
        }
        // Clear the bits corresponding to higher addresses in the cell.
        cell &= (!0 as CellType) >> (BITS_PER_CELL - index_in_cell(index) - 1);
        // First, iterate backwards to find a cell with any set markbit.
        while cell == 0 && cell_index > 0 {
            cell_index -= 1;
            cell = load(cell_index);
        }
        if cell == 0 {
            debug_assert_eq!(cell_index, 0);
            return self.index_to_address(0);
        }
        let leading_zeros = cell.leading_zeros();
        let leftmost_ones = (!(cell << leading_zeros)).leading_zeros();
        let index_of_last_leftmost_one = BITS_PER_CELL - leading_zeros - leftmost_ones;
        // The leftmost run of set bits does not reach the start of the cell.
        if index_of_last_leftmost_one > 0 {
            return self.index_to_address(cell_index * BITS_PER_CELL + index_of_last_leftmost_one);
        }
        if cell_index == 0 {
            return self.index_to_address(0);
        }
        // The run reaches the start of the cell: keep walking back until some
        // markbit is unset.
        loop {
            cell_index -= 1;
            cell = load(cell_index);
            if !(!cell == 0 && cell_index > 0) {
                break;
            }
        }
        if !cell == 0 {
            debug_assert_eq!(cell_index, 0);
            return self.index_to_address(0);
        }
        let leading_ones = (!cell).leading_zeros();
        let index_of_last_leading_one = BITS_PER_CELL - leading_ones;
        debug_assert!(index_of_last_leading_one > 0);
        self.index_to_address(cell_index * BITS_PER_CELL + index_of_last_leading_one)
    }

    pub fn clear<M: AccessMode>(&self) {
        for cell in self.cells.iter() {
            M::store_cell(cell, 0);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.cells
            .iter()
            .all(|cell| NonAtomicAccess::load_cell(cell) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::access_mode::AtomicAccess;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct PageAlignedBitmap {
        layout: Layout,
        bitmap: *mut ConcurrentBitmap,
    }

    impl PageAlignedBitmap {
        fn new() -> Self {
            let layout =
                Layout::from_size_align(core::mem::size_of::<ConcurrentBitmap>(), PAGE_SIZE)
                    .unwrap();
            let bitmap = unsafe { alloc_zeroed(layout).cast::<ConcurrentBitmap>() };
            assert!(!bitmap.is_null());
            Self { layout, bitmap }
        }
        fn get(&self) -> &ConcurrentBitmap {
            unsafe { &*self.bitmap }
        }
    }

    impl Drop for PageAlignedBitmap {
        fn drop(&mut self) {
            unsafe { dealloc(self.bitmap.cast(), self.layout) }
        }
    }

    #[test]
    fn test_range_queries() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        assert!(bitmap.all_bits_clear_in_range(0, 100));
        assert!(!bitmap.all_bits_set_in_range(10, 10));
        bitmap.set_range::<NonAtomicAccess>(10, 80);
        assert!(bitmap.all_bits_set_in_range(10, 80));
        assert!(bitmap.all_bits_set_in_range(33, 65));
        assert!(!bitmap.all_bits_set_in_range(9, 80));
        assert!(!bitmap.all_bits_set_in_range(10, 81));
        assert!(bitmap.all_bits_clear_in_range(0, 10));
        assert!(bitmap.all_bits_clear_in_range(80, 200));
        assert!(!bitmap.all_bits_clear_in_range(0, 11));
        bitmap.clear::<NonAtomicAccess>();
        assert!(bitmap.is_clean());
    }

    #[test]
    fn test_find_previous_marked_object_inside_object() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let object = bitmap.index_to_address(700);
        assert!(bitmap.set_bit::<AtomicAccess>(object));
        assert!(!bitmap.set_bit::<AtomicAccess>(object));
        for offset in [8usize, 16, 64, 240] {
            assert_eq!(bitmap.find_previous_marked_object(object + offset), object);
        }
    }

    #[test]
    fn test_find_previous_marked_object_bails_out_on_set_bit() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let object = bitmap.index_to_address(64);
        bitmap.set_bit::<NonAtomicAccess>(object);
        assert_eq!(bitmap.find_previous_marked_object(object), NULL_ADDRESS);
    }

    #[test]
    fn test_find_previous_marked_object_returns_base_when_nothing_marked() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let address = bitmap.index_to_address(5000);
        assert_eq!(bitmap.find_previous_marked_object(address), bitmap.index_to_address(0));
    }

    #[test]
    fn test_find_previous_marked_object_across_full_cells() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        // A run of set bits that starts mid-cell and covers two full cells.
        bitmap.set_range::<NonAtomicAccess>(40, 128);
        let inner = bitmap.index_to_address(130);
        assert_eq!(bitmap.find_previous_marked_object(inner), bitmap.index_to_address(40));
        // A run that reaches back to index 0.
        bitmap.clear::<NonAtomicAccess>();
        bitmap.set_range::<NonAtomicAccess>(0, 96);
        let inner = bitmap.index_to_address(100);
        assert_eq!(bitmap.find_previous_marked_object(inner), bitmap.index_to_address(0));
    }

    #[test]
    fn test_clear_bit() {
        let holder = PageAlignedBitmap::new();
        let bitmap = holder.get();
        let object = bitmap.index_to_address(321);
        bitmap.set_bit::<NonAtomicAccess>(object);
        assert!(bitmap.is_set::<AtomicAccess>(object));
        bitmap.clear_bit::<AtomicAccess>(object);
        assert!(!bitmap.is_set::<NonAtomicAccess>(object));
        assert!(bitmap.is_clean());
    }
}
