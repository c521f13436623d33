use std::collections::{btree_map, BTreeMap};

use crate::{
    header::HeapObjectHeader,
    internal::access_mode::AtomicAccess,
};

/// Objects of one page whose layout changed while slots into them were being
/// recorded. Maps the header address to the object's size at the time it was
/// invalidated, so the whole original extent is covered.
#[derive(Default)]
pub struct InvalidatedSlots {
    objects: BTreeMap<usize, usize>,
}

impl InvalidatedSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, header: usize, size: usize) {
        let entry = self.objects.entry(header).or_insert(size);
        *entry = (*entry).max(size);
    }

    pub fn contains(&self, header: usize) -> bool {
        self.objects.contains_key(&header)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

/// Answers whether a recorded slot still holds a pointer.
///
/// Slots must be queried in non-decreasing address order; the filter only
/// ever moves forward through the invalidated objects.
pub struct InvalidatedSlotsFilter<'a> {
    iterator: btree_map::Iter<'a, usize, usize>,
    current: Option<(usize, usize)>,
    last_slot: usize,
}

impl<'a> InvalidatedSlotsFilter<'a> {
    pub fn new(slots: &'a InvalidatedSlots) -> Self {
        let mut iterator = slots.objects.iter();
        let current = iterator.next().map(|(start, size)| (*start, *start + *size));
        Self {
            iterator,
            current,
            last_slot: 0,
        }
    }

    pub fn is_valid(&mut self, slot: usize) -> bool {
        debug_assert!(slot >= self.last_slot, "slots must be queried in increasing order");
        self.last_slot = slot;

        while let Some((_, end)) = self.current {
            if slot < end {
                break;
            }
            self.current = self
                .iterator
                .next()
                .map(|(start, size)| (*start, *start + *size));
        }

        let (start, _) = match self.current {
            Some(range) if slot >= range.0 => range,
            _ => return true,
        };

        let header = unsafe { &*(start as *const HeapObjectHeader) };
        if !header.is_marked::<AtomicAccess>() {
            return false;
        }
        let payload = header.payload() as usize;
        if slot < payload {
            return false;
        }
        (header.gc_info().is_valid_slot)(payload as *const u8, slot - payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gcref::Member,
        internal::{
            access_mode::NonAtomicAccess, finalize_trait::FinalizeTrait, gc_info::GCInfoTrait,
            trace_trait::TraceTrait,
        },
        visitor::Visitor,
    };

    struct Pair {
        first: Member<Pair>,
        second: Member<Pair>,
    }

    impl TraceTrait for Pair {
        fn trace(&self, vis: &mut Visitor) {
            self.first.trace(vis);
            self.second.trace(vis);
        }
    }
    impl FinalizeTrait<Pair> for Pair {}

    #[test]
    fn test_filter_skips_trimmed_tail_and_dead_objects() {
        let index = <Pair as GCInfoTrait<Pair>>::index();
        let mut memory = vec![0u64; 16];
        let base = memory.as_mut_ptr() as usize;
        // live: 24 bytes, shrunk from 24 to 16
        let live = unsafe { HeapObjectHeader::initialize(base as *mut u8, 24, index) };
        live.try_mark::<NonAtomicAccess>();
        live.set_size(16);
        // dead: 24 bytes at +32
        unsafe { HeapObjectHeader::initialize((base + 32) as *mut u8, 24, index) };

        let mut invalidated = InvalidatedSlots::new();
        invalidated.register(base, 24);
        invalidated.register(base + 32, 24);

        let mut filter = InvalidatedSlotsFilter::new(&invalidated);
        assert!(!filter.is_valid(base), "pointer into the header");
        assert!(filter.is_valid(base + 8), "first field is kept");
        assert!(!filter.is_valid(base + 16), "second field was trimmed");
        assert!(filter.is_valid(base + 24), "not invalidated");
        assert!(!filter.is_valid(base + 40), "owner is dead");
        assert!(filter.is_valid(base + 64));
    }
}
