use std::collections::BTreeSet;

/// Per-page remembered set of slot addresses that point into evacuation
/// candidates. Iteration is in increasing address order, which the
/// [`InvalidatedSlotsFilter`](crate::invalidated_slots::InvalidatedSlotsFilter)
/// relies on.
#[derive(Default)]
pub struct SlotSet {
    slots: BTreeSet<usize>,
}

impl SlotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: usize) -> bool {
        self.slots.insert(slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.slots.contains(&slot)
    }

    /// Drops recorded slots in `[start, end)`.
    pub fn remove_range(&mut self, start: usize, end: usize) {
        let doomed = self.slots.range(start..end).copied().collect::<Vec<_>>();
        for slot in doomed {
            self.slots.remove(&slot);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().copied()
    }

    pub fn take(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_iterate_in_order_and_deduplicate() {
        let mut set = SlotSet::new();
        assert!(set.insert(0x2000));
        assert!(set.insert(0x1000));
        assert!(!set.insert(0x2000));
        set.insert(0x1800);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0x1000, 0x1800, 0x2000]);
        set.remove_range(0x1000, 0x1801);
        assert_eq!(set.len(), 1);
        assert!(set.contains(0x2000));
        set.clear();
        assert!(set.is_empty());
    }
}
