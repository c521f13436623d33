pub type FinalizationCallback = extern "C" fn(*mut u8);

/// Describes what the sweeper runs before reclaiming an object of type `T`.
/// Types without drop glue register no finalizer and are reclaimed without
/// being visited.
pub trait FinalizeTrait<T> {
    const NON_TRIVIAL_DTOR: bool = core::mem::needs_drop::<T>();
    const CALLBACK: Option<FinalizationCallback> = if Self::NON_TRIVIAL_DTOR {
        Some(Self::finalize)
    } else {
        None
    };

    extern "C" fn finalize(obj: *mut u8) {
        unsafe {
            core::ptr::drop_in_place(obj.cast::<T>());
        }
    }
}
