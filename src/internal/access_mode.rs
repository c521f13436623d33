//! Compile-time selection between atomic and plain memory accesses.
//!
//! Mark bits and side tables are read and written through an [`AccessMode`]
//! type parameter. Code that runs while concurrent markers are active is
//! instantiated with [`AtomicAccess`], code that is known to be the only
//! accessor uses [`NonAtomicAccess`]. The choice is resolved by
//! monomorphization, the hot loops contain no runtime branch on it.

use atomic::{Atomic, Ordering};
use std::sync::atomic::{AtomicU16, AtomicU8};

pub trait AccessMode: Send + Sync + 'static {
    const IS_ATOMIC: bool;

    fn load_u8(cell: &AtomicU8) -> u8;
    fn store_u8(cell: &AtomicU8, value: u8);

    fn load_u16(cell: &AtomicU16) -> u16;
    fn store_u16(cell: &AtomicU16, value: u16);
    /// Sets `mask` in `cell`. Returns false when all bits of `mask` were already set.
    fn try_set_bits_u16(cell: &AtomicU16, mask: u16) -> bool;
    fn clear_bits_u16(cell: &AtomicU16, mask: u16);

    fn load_cell(cell: &Atomic<u32>) -> u32;
    fn store_cell(cell: &Atomic<u32>, value: u32);
    /// Sets `mask` in `cell`. Returns false when all bits of `mask` were already set.
    fn set_bits(cell: &Atomic<u32>, mask: u32) -> bool;
    fn clear_bits(cell: &Atomic<u32>, mask: u32);
}

/// Accesses that may race with other threads.
pub struct AtomicAccess;
/// Accesses performed by the only thread touching the memory.
pub struct NonAtomicAccess;

impl AccessMode for AtomicAccess {
    const IS_ATOMIC: bool = true;

    #[inline(always)]
    fn load_u8(cell: &AtomicU8) -> u8 {
        cell.load(Ordering::Acquire)
    }
    #[inline(always)]
    fn store_u8(cell: &AtomicU8, value: u8) {
        cell.store(value, Ordering::Release)
    }
    #[inline(always)]
    fn load_u16(cell: &AtomicU16) -> u16 {
        cell.load(Ordering::Acquire)
    }
    #[inline(always)]
    fn store_u16(cell: &AtomicU16, value: u16) {
        cell.store(value, Ordering::Release)
    }
    #[inline(always)]
    fn try_set_bits_u16(cell: &AtomicU16, mask: u16) -> bool {
        let mut old = cell.load(Ordering::Relaxed);
        loop {
            if old & mask == mask {
                return false;
            }
            match cell.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }
    #[inline(always)]
    fn clear_bits_u16(cell: &AtomicU16, mask: u16) {
        let mut old = cell.load(Ordering::Relaxed);
        while let Err(current) =
            cell.compare_exchange_weak(old, old & !mask, Ordering::AcqRel, Ordering::Relaxed)
        {
            old = current;
        }
    }
    #[inline(always)]
    fn load_cell(cell: &Atomic<u32>) -> u32 {
        cell.load(Ordering::Acquire)
    }
    #[inline(always)]
    fn store_cell(cell: &Atomic<u32>, value: u32) {
        cell.store(value, Ordering::Release)
    }
    #[inline(always)]
    fn set_bits(cell: &Atomic<u32>, mask: u32) -> bool {
        let mut old = cell.load(Ordering::Relaxed);
        loop {
            if old & mask == mask {
                return false;
            }
            match cell.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }
    #[inline(always)]
    fn clear_bits(cell: &Atomic<u32>, mask: u32) {
        let mut old = cell.load(Ordering::Relaxed);
        while let Err(current) =
            cell.compare_exchange_weak(old, old & !mask, Ordering::AcqRel, Ordering::Relaxed)
        {
            old = current;
        }
    }
}

impl AccessMode for NonAtomicAccess {
    const IS_ATOMIC: bool = false;

    #[inline(always)]
    fn load_u8(cell: &AtomicU8) -> u8 {
        cell.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn store_u8(cell: &AtomicU8, value: u8) {
        cell.store(value, Ordering::Relaxed)
    }
    #[inline(always)]
    fn load_u16(cell: &AtomicU16) -> u16 {
        cell.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn store_u16(cell: &AtomicU16, value: u16) {
        cell.store(value, Ordering::Relaxed)
    }
    #[inline(always)]
    fn try_set_bits_u16(cell: &AtomicU16, mask: u16) -> bool {
        let old = cell.load(Ordering::Relaxed);
        if old & mask == mask {
            return false;
        }
        cell.store(old | mask, Ordering::Relaxed);
        true
    }
    #[inline(always)]
    fn clear_bits_u16(cell: &AtomicU16, mask: u16) {
        let old = cell.load(Ordering::Relaxed);
        cell.store(old & !mask, Ordering::Relaxed);
    }
    #[inline(always)]
    fn load_cell(cell: &Atomic<u32>) -> u32 {
        cell.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn store_cell(cell: &Atomic<u32>, value: u32) {
        cell.store(value, Ordering::Relaxed)
    }
    #[inline(always)]
    fn set_bits(cell: &Atomic<u32>, mask: u32) -> bool {
        let old = cell.load(Ordering::Relaxed);
        if old & mask == mask {
            return false;
        }
        cell.store(old | mask, Ordering::Relaxed);
        true
    }
    #[inline(always)]
    fn clear_bits(cell: &Atomic<u32>, mask: u32) {
        let old = cell.load(Ordering::Relaxed);
        cell.store(old & !mask, Ordering::Relaxed);
    }
}
