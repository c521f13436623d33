use std::{any::TypeId, collections::HashMap, mem::size_of, sync::OnceLock};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::{
    internal::{
        finalize_trait::FinalizationCallback, gc_info::GCInfoIndex, trace_trait::TraceCallback,
    },
    util::fatal_out_of_memory,
};

/// Decides whether a recorded slot at `offset` bytes into the payload still
/// belongs to the object.
pub type IsValidSlotCallback = fn(payload: *const u8, offset: usize) -> bool;

/// GCInfo contains metadata for objects.
#[derive(Clone, Copy)]
pub struct GCInfo {
    pub finalize: Option<FinalizationCallback>,
    pub trace: TraceCallback,
    pub is_valid_slot: IsValidSlotCallback,
    pub name: &'static str,
}

/// Process wide registry mapping small indices to [`GCInfo`]s. Headers only
/// store the index.
pub struct GCInfoTable {
    map: MmapMut,
    table: *mut GCInfo,
    current_index: Mutex<u16>,
    type_id_map: Mutex<HashMap<TypeId, GCInfoIndex>>,
}

unsafe impl Send for GCInfoTable {}
unsafe impl Sync for GCInfoTable {}

static GC_TABLE: OnceLock<GCInfoTable> = OnceLock::new();

impl GCInfoTable {
    /// At maximum [`MAX_INDEX - 1`](GCInfoTable::MAX_INDEX) indices are supported.
    ///
    /// We assume that 14 bits are enough to represent all possible types.
    pub const MAX_INDEX: u16 = 1 << 14;
    /// Minimum index returned. Values smaller [`MIN_INDEX`](GCInfoTable::MIN_INDEX) may be used as
    /// sentinels.
    pub const MIN_INDEX: u16 = 1;

    fn new() -> Self {
        let mut map = match MmapMut::map_anon(Self::MAX_INDEX as usize * size_of::<GCInfo>()) {
            Ok(map) => map,
            Err(_) => fatal_out_of_memory("GCInfoTable"),
        };
        let table = map.as_mut_ptr().cast::<GCInfo>();
        Self {
            map,
            table,
            current_index: Mutex::new(Self::MIN_INDEX),
            type_id_map: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn global() -> &'static GCInfoTable {
        GC_TABLE.get_or_init(Self::new)
    }

    /// Returns the index registered for `type_id`, registering `info` on first use.
    pub fn add_gc_info_type_id(&self, type_id: TypeId, info: impl FnOnce() -> GCInfo) -> GCInfoIndex {
        let mut map = self.type_id_map.lock();
        if let Some(index) = map.get(&type_id) {
            return *index;
        }
        let index = self.add_gc_info(info());
        map.insert(type_id, index);
        index
    }

    /// Registers `info` under a fresh index. Used by embedders that describe
    /// their types through the C API.
    pub fn add_gc_info(&self, info: GCInfo) -> GCInfoIndex {
        let mut current = self.current_index.lock();
        let index = *current;
        if index >= Self::MAX_INDEX {
            fatal_out_of_memory("GCInfoTable exhausted");
        }
        unsafe {
            self.table.add(index as usize).write(info);
        }
        *current += 1;
        log::trace!("registered GC info #{} for {}", index, info.name);
        index
    }

    /// # Panics
    /// In debug builds if `index` was never handed out.
    #[inline]
    pub fn get_gc_info(&self, index: GCInfoIndex) -> &'static GCInfo {
        debug_assert!(index >= Self::MIN_INDEX && (index as usize) < self.number_of_entries());
        // Entries are written once before their index is published and never change.
        unsafe { &*self.table.add(index as usize) }
    }

    pub fn number_of_entries(&self) -> usize {
        *self.current_index.lock() as usize
    }

    pub fn reserved_bytes(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{internal::gc_info::GCInfoTrait, visitor::Visitor};

    struct Tagged(#[allow(dead_code)] u64);
    impl crate::internal::trace_trait::TraceTrait for Tagged {}
    impl crate::internal::finalize_trait::FinalizeTrait<Tagged> for Tagged {}

    extern "C" fn trace_nothing(_: *mut Visitor, _: *const u8) {}

    #[test]
    fn test_type_registration_is_stable() {
        let first = <Tagged as GCInfoTrait<Tagged>>::index();
        let second = <Tagged as GCInfoTrait<Tagged>>::index();
        assert_eq!(first, second);
        assert!(first >= GCInfoTable::MIN_INDEX);
        let info = GCInfoTable::global().get_gc_info(first);
        assert!(info.finalize.is_none());
        assert!(info.name.contains("Tagged"));
    }

    #[test]
    fn test_raw_registration_gets_fresh_indices() {
        let table = GCInfoTable::global();
        let info = GCInfo {
            finalize: None,
            trace: trace_nothing,
            is_valid_slot: |_, _| true,
            name: "raw",
        };
        let a = table.add_gc_info(info);
        let b = table.add_gc_info(info);
        assert_ne!(a, b);
        assert_eq!(table.get_gc_info(b).name, "raw");
        assert!(table.reserved_bytes() >= GCInfoTable::MAX_INDEX as usize);
    }
}
