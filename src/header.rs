use crate::{
    gc_info_table::{GCInfo, GCInfoTable},
    globals::{ALLOCATION_GRANULARITY, FREE_LIST_GC_INFO_INDEX, LARGE_OBJECT_SIZE_THRESHOLD},
    internal::{
        access_mode::{AccessMode, AtomicAccess, NonAtomicAccess},
        gc_info::GCInfoIndex,
    },
    page::{BasePage, LargePage},
    visitor::Visitor,
};
use modular_bitfield::prelude::*;
use std::{
    mem::size_of,
    sync::atomic::{AtomicU16, Ordering},
};

// HeapObjectHeader contains meta data per object and is prepended to each
// object.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | padding         |   32 | Keeps the payload 8 byte aligned.        |
// +-----------------+------+------------------------------------------+
// | size            |   15 | Represents 18 bits of size, see below.   |
// | mark bit        |    1 |                                          |
// +-----------------+------+------------------------------------------+
// | GCInfoIndex     |   14 |                                          |
// | old             |    1 | Survived at least one collection.        |
// | in construction |    1 | In construction encoded as |false|.      |
// +-----------------+------+------------------------------------------+
//
// Notes:
// - See [GCInfoTable] for constraints on GCInfoIndex.
// - |size| for regular objects is stored in 15 bits, representing 18 bits
//   of size (up to |PAGE_SIZE|, 2^18) because allocations are always 8 byte
//   aligned (see ALLOCATION_GRANULARITY).
// - |size| for large objects is encoded as 0. The size of a large object is
//   stored in |LargePage::payload_size()|.
// - |mark bit| and |in construction| bits are located in separate 16-bit halves
//    to allow potentially accessing them non-atomically.
#[repr(C)]
pub struct HeapObjectHeader {
    _padding: u32,
    encoded_high: AtomicU16,
    encoded_low: AtomicU16,
}

#[bitfield(bits = 16)]
#[derive(Clone, Copy)]
pub struct EncodedHigh {
    size: B15,
    marked: bool,
}

#[bitfield(bits = 16)]
#[derive(Clone, Copy)]
pub struct EncodedLow {
    gc_info_index: B14,
    old: bool,
    fully_constructed: bool,
}

pub const HEADER_SIZE: usize = size_of::<HeapObjectHeader>();

/// Bit of the high half holding the mark bit.
pub(crate) const MARK_BIT_MASK: u16 = 1 << 15;
/// Bit of the low half holding the "fully constructed" flag.
pub(crate) const FULLY_CONSTRUCTED_MASK: u16 = 1 << 15;
pub(crate) const OLD_BIT_MASK: u16 = 1 << 14;

const _: () = assert!(HEADER_SIZE == ALLOCATION_GRANULARITY);

fn decode_high(value: u16) -> EncodedHigh {
    EncodedHigh::from_bytes(value.to_le_bytes())
}

fn decode_low(value: u16) -> EncodedLow {
    EncodedLow::from_bytes(value.to_le_bytes())
}

fn encode_high(value: EncodedHigh) -> u16 {
    u16::from_le_bytes(value.into_bytes())
}

fn encode_low(value: EncodedLow) -> u16 {
    u16::from_le_bytes(value.into_bytes())
}

impl HeapObjectHeader {
    /// Writes a fresh header at `address`. Objects start out unmarked and in construction.
    ///
    /// # Safety
    /// `address` must point to writable memory of at least `size` bytes.
    #[inline]
    pub unsafe fn initialize<'a>(address: *mut u8, size: usize, gc_info_index: GCInfoIndex) -> &'a mut Self {
        debug_assert!(size < LARGE_OBJECT_SIZE_THRESHOLD || size == 0 || gc_info_index == FREE_LIST_GC_INFO_INDEX);
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        let header = address.cast::<Self>();
        header.write(Self {
            _padding: 0,
            encoded_high: AtomicU16::new(encode_high(
                EncodedHigh::new().with_size((size / ALLOCATION_GRANULARITY) as u16),
            )),
            encoded_low: AtomicU16::new(encode_low(
                EncodedLow::new().with_gc_info_index(gc_info_index),
            )),
        });
        &mut *header
    }

    #[inline(always)]
    pub fn from_payload(payload: *const u8) -> *mut Self {
        (payload as usize - HEADER_SIZE) as *mut Self
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + HEADER_SIZE) as _
    }

    #[inline(always)]
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    #[inline(always)]
    pub fn get_gc_info_index<M: AccessMode>(&self) -> GCInfoIndex {
        decode_low(M::load_u16(&self.encoded_low)).gc_info_index()
    }

    #[inline(always)]
    pub fn gc_info(&self) -> &'static GCInfo {
        GCInfoTable::global().get_gc_info(self.get_gc_info_index::<AtomicAccess>())
    }

    /// Returns the encoded size. `0` means the object lives in the large object space.
    #[inline(always)]
    pub fn get_size<M: AccessMode>(&self) -> usize {
        decode_high(M::load_u16(&self.encoded_high)).size() as usize * ALLOCATION_GRANULARITY
    }

    /// Size of the allocation including the header, for regular and large objects.
    #[inline]
    pub fn allocated_size<M: AccessMode>(&self) -> usize {
        let size = self.get_size::<M>();
        if size == 0 {
            unsafe { (*LargePage::from_header(self)).object_size() }
        } else {
            size
        }
    }

    /// Size of the payload without the header.
    #[inline]
    pub fn object_size<M: AccessMode>(&self) -> usize {
        self.allocated_size::<M>() - HEADER_SIZE
    }

    #[inline]
    pub fn object_end<M: AccessMode>(&self) -> usize {
        self.address() + self.allocated_size::<M>()
    }

    /// Only the owning mutator changes the size. The mark bit shares the
    /// half word and may be set concurrently, so the update is a CAS loop.
    #[inline]
    pub fn set_size(&self, size: usize) {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        let encoded = (size / ALLOCATION_GRANULARITY) as u16;
        let _ = self
            .encoded_high
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some(encode_high(decode_high(old).with_size(encoded)))
            });
    }

    #[inline(always)]
    pub fn is_large_object<M: AccessMode>(&self) -> bool {
        self.get_size::<M>() == 0
    }

    #[inline(always)]
    pub fn is_free<M: AccessMode>(&self) -> bool {
        self.get_gc_info_index::<M>() == FREE_LIST_GC_INFO_INDEX
    }

    #[inline(always)]
    pub fn is_marked<M: AccessMode>(&self) -> bool {
        M::load_u16(&self.encoded_high) & MARK_BIT_MASK != 0
    }

    /// Sets the mark bit. Returns false if the object was already marked.
    #[inline(always)]
    pub fn try_mark<M: AccessMode>(&self) -> bool {
        M::try_set_bits_u16(&self.encoded_high, MARK_BIT_MASK)
    }

    #[inline(always)]
    pub fn unmark<M: AccessMode>(&self) {
        debug_assert!(self.is_marked::<M>());
        M::clear_bits_u16(&self.encoded_high, MARK_BIT_MASK);
    }

    #[inline(always)]
    pub fn is_in_construction<M: AccessMode>(&self) -> bool {
        M::load_u16(&self.encoded_low) & FULLY_CONSTRUCTED_MASK == 0
    }

    /// Publishes the payload written so far. Pairs with acquire loads of the bit
    /// performed by concurrent markers.
    #[inline]
    pub fn mark_as_fully_constructed(&self) {
        self.encoded_low
            .fetch_or(FULLY_CONSTRUCTED_MASK, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_old<M: AccessMode>(&self) -> bool {
        M::load_u16(&self.encoded_low) & OLD_BIT_MASK != 0
    }

    #[inline(always)]
    pub fn set_old<M: AccessMode>(&self) {
        M::try_set_bits_u16(&self.encoded_low, OLD_BIT_MASK);
    }

    #[inline]
    pub fn page(&self) -> *mut BasePage {
        BasePage::from_payload(self.payload())
    }

    /// Invokes the finalizer registered for this object's type, if any.
    pub fn finalize(&self) {
        debug_assert!(!self.is_free::<NonAtomicAccess>());
        if let Some(finalize) = self.gc_info().finalize {
            finalize(self.payload());
        }
    }

    /// Dispatches to the trace callback registered for this object's type.
    pub fn trace(&self, visitor: &mut Visitor) {
        let gc_info = self.gc_info();
        (gc_info.trace)(visitor, self.payload());
    }

    pub fn name(&self) -> &'static str {
        if self.is_free::<AtomicAccess>() {
            return "free space";
        }
        self.gc_info().name
    }
}
