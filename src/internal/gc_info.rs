use std::any::{type_name, TypeId};

use crate::gc_info_table::{GCInfo, GCInfoTable};

use super::{finalize_trait::FinalizeTrait, trace_trait::TraceTrait};

pub type GCInfoIndex = u16;

/// Associates every managed type with its entry in the global [`GCInfoTable`].
pub trait GCInfoTrait<T: TraceTrait + FinalizeTrait<T> + Sized + 'static> {
    fn index() -> GCInfoIndex;
}

impl<T: TraceTrait + FinalizeTrait<T> + Sized + 'static> GCInfoTrait<T> for T {
    fn index() -> GCInfoIndex {
        GCInfoTable::global().add_gc_info_type_id(TypeId::of::<T>(), || GCInfo {
            finalize: <T as FinalizeTrait<T>>::CALLBACK,
            trace: <T as TraceTrait>::trace_,
            is_valid_slot: <T as TraceTrait>::is_valid_slot,
            name: type_name::<T>(),
        })
    }
}
