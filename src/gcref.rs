use std::{
    fmt::{self},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    header::HeapObjectHeader,
    internal::{finalize_trait::FinalizeTrait, gc_info::GCInfoTrait, trace_trait::TraceTrait},
    visitor::Visitor,
    write_barrier::WriteBarrier,
};

#[repr(C)]
pub struct GcRef<T> {
    pub(crate) raw: UntypedGcRef,
    pub(crate) marker: PhantomData<T>,
}

impl<T> GcRef<T> {
    pub fn downcast(self) -> UntypedGcRef {
        self.raw
    }

    /// Payload address of the object.
    pub fn as_ptr(self) -> *mut u8 {
        self.raw.get()
    }

    pub fn header(&self) -> &HeapObjectHeader {
        unsafe { &*self.raw.header.as_ptr() }
    }

    /// # Safety
    /// `payload` must be the payload of a live object of type `T`.
    pub unsafe fn from_payload(payload: *mut u8) -> Self {
        Self {
            raw: UntypedGcRef::from_payload(payload),
            marker: PhantomData,
        }
    }

    pub fn ptr_eq(this: Self, other: Self) -> bool {
        this.raw.header == other.raw.header
    }
}

impl<T> Deref for GcRef<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.raw.get().cast::<T>() }
    }
}
impl<T> DerefMut for GcRef<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.raw.get().cast::<T>() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct UntypedGcRef {
    pub(crate) header: NonNull<HeapObjectHeader>,
}

impl UntypedGcRef {
    pub fn get(&self) -> *mut u8 {
        unsafe { (*self.header.as_ptr()).payload() }
    }

    pub fn header(&self) -> &HeapObjectHeader {
        unsafe { &*self.header.as_ptr() }
    }

    /// # Safety
    /// `payload` must be the payload of a live managed object.
    pub unsafe fn from_payload(payload: *mut u8) -> Self {
        Self {
            header: NonNull::new_unchecked(HeapObjectHeader::from_payload(payload)),
        }
    }

    pub fn cast<T: GCInfoTrait<T> + TraceTrait + FinalizeTrait<T> + 'static>(
        self,
    ) -> Option<GcRef<T>> {
        let header = unsafe { &*self.header.as_ptr() };
        if header.get_gc_info_index::<crate::internal::access_mode::AtomicAccess>()
            == <T as GCInfoTrait<T>>::index()
        {
            Some(GcRef {
                raw: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// # Safety
    /// The object must be of type `T`.
    pub unsafe fn cast_unchecked<T>(self) -> GcRef<T> {
        GcRef {
            raw: self,
            marker: PhantomData,
        }
    }
}

impl fmt::Debug for UntypedGcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntypedGcRef({:p})", self.header)
    }
}
impl fmt::Pointer for UntypedGcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntypedGcRef({:p})", self.header)
    }
}
impl<T> std::fmt::Pointer for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.raw)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", **self)
    }
}
impl<T: std::fmt::Display> std::fmt::Display for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", **self)
    }
}
impl<T> Copy for GcRef<T> {}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for GcRef<T> {}

impl<T: TraceTrait> TraceTrait for GcRef<T> {
    fn trace(&self, vis: &mut Visitor) {
        vis.trace_gcref(*self);
    }
}

impl TraceTrait for UntypedGcRef {
    fn trace(&self, vis: &mut Visitor) {
        vis.trace_untyped(*self);
    }
}

#[inline(always)]
fn raw_of<T>(value: Option<GcRef<T>>) -> *mut u8 {
    match value {
        Some(value) => value.as_ptr(),
        None => null_mut(),
    }
}

/// Strong reference stored inside a managed object. Stores go through the
/// write barrier so that incremental and concurrent marking never miss the
/// new target.
#[repr(transparent)]
pub struct Member<T> {
    raw: AtomicPtr<u8>,
    marker: PhantomData<GcRef<T>>,
}

unsafe impl<T: Send + Sync> Send for Member<T> {}
unsafe impl<T: Send + Sync> Sync for Member<T> {}

impl<T> Member<T> {
    pub const fn null() -> Self {
        Self {
            raw: AtomicPtr::new(null_mut()),
            marker: PhantomData,
        }
    }

    /// Initializing store. The holder is not yet reachable, so no barrier is needed.
    pub fn new(value: GcRef<T>) -> Self {
        Self {
            raw: AtomicPtr::new(value.as_ptr()),
            marker: PhantomData,
        }
    }

    pub fn from_option(value: Option<GcRef<T>>) -> Self {
        Self {
            raw: AtomicPtr::new(raw_of(value)),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> Option<GcRef<T>> {
        let ptr = self.raw.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { GcRef::from_payload(ptr) })
        }
    }

    #[inline]
    pub fn set(&self, value: Option<GcRef<T>>) {
        let ptr = raw_of(value);
        self.raw.store(ptr, Ordering::Release);
        WriteBarrier::dijkstra_marking_barrier(&self.raw, ptr);
    }

    pub fn clear(&self) {
        self.raw.store(null_mut(), Ordering::Release);
    }

    pub fn is_null(&self) -> bool {
        self.raw.load(Ordering::Relaxed).is_null()
    }

    pub(crate) fn slot(&self) -> &AtomicPtr<u8> {
        &self.raw
    }
}

impl<T> Default for Member<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> TraceTrait for Member<T> {
    fn trace(&self, vis: &mut Visitor) {
        vis.trace_member(self);
    }
}

/// Reference that does not keep its target alive. Cleared once the target
/// is found unreachable.
#[repr(transparent)]
pub struct WeakMember<T> {
    raw: AtomicPtr<u8>,
    marker: PhantomData<GcRef<T>>,
}

unsafe impl<T: Send + Sync> Send for WeakMember<T> {}
unsafe impl<T: Send + Sync> Sync for WeakMember<T> {}

impl<T> WeakMember<T> {
    pub const fn null() -> Self {
        Self {
            raw: AtomicPtr::new(null_mut()),
            marker: PhantomData,
        }
    }

    pub fn new(value: GcRef<T>) -> Self {
        Self {
            raw: AtomicPtr::new(value.as_ptr()),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> Option<GcRef<T>> {
        let ptr = self.raw.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { GcRef::from_payload(ptr) })
        }
    }

    #[inline]
    pub fn set(&self, value: Option<GcRef<T>>) {
        let ptr = raw_of(value);
        self.raw.store(ptr, Ordering::Release);
        WriteBarrier::record_slot_if_needed(&self.raw, ptr);
    }

    pub fn clear(&self) {
        self.raw.store(null_mut(), Ordering::Release);
    }

    pub fn is_null(&self) -> bool {
        self.raw.load(Ordering::Relaxed).is_null()
    }

    pub(crate) fn slot(&self) -> &AtomicPtr<u8> {
        &self.raw
    }
}

impl<T> Default for WeakMember<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> TraceTrait for WeakMember<T> {
    fn trace(&self, vis: &mut Visitor) {
        vis.trace_weak_member(self);
    }
}

impl<T: TraceTrait> TraceTrait for Option<T> {
    fn trace(&self, vis: &mut Visitor) {
        if let Some(value) = self {
            value.trace(vis);
        }
    }
}

impl<T: TraceTrait> TraceTrait for Vec<T> {
    fn trace(&self, vis: &mut Visitor) {
        for value in self.iter() {
            value.trace(vis);
        }
    }
}

impl<T: TraceTrait, const N: usize> TraceTrait for [T; N] {
    fn trace(&self, vis: &mut Visitor) {
        for value in self.iter() {
            value.trace(vis);
        }
    }
}

macro_rules! impl_prim {
    ($($t:ty)*) => {
        $(
            impl FinalizeTrait<$t> for $t {

            }
            impl TraceTrait for $t {}
        )*
    };
}

impl_prim! (
    () bool f32 f64
    u8 u16 u32 u64 u128 usize
    i8 i16 i32 i64 i128 isize
    String
);
