use crate::{
    header::{HeapObjectHeader, HEADER_SIZE},
    internal::access_mode::AtomicAccess,
    visitor::Visitor,
};

pub type TraceCallback = extern "C" fn(*mut Visitor, *const u8);

/// Trait specifying how the garbage collector processes an object of type `T`.
pub trait TraceTrait: Sized {
    /// Function invoking the tracing for an object of type `T`.
    /// - `visitor`: The visitor to dispatch to.
    fn trace(&self, vis: &mut Visitor) {
        let _ = vis;
    }
    /// `trace_` method is used for C FFI safety.
    extern "C" fn trace_(vis: *mut Visitor, this: *const u8) {
        unsafe {
            (*this.cast::<Self>()).trace(&mut *vis);
        }
    }
    /// Returns trace descriptor for type that implements this trait. Not recommended to override it.
    fn get_trace_descriptor(this: *const u8) -> TraceDescriptor {
        TraceDescriptor {
            base_object_payload: this,
            callback: Self::trace_,
        }
    }
    /// Whether a pointer slot `offset` bytes into the payload is still part of
    /// the object. Objects that shrink in place drop their tail slots.
    fn is_valid_slot(payload: *const u8, offset: usize) -> bool {
        let header = unsafe { &*HeapObjectHeader::from_payload(payload) };
        offset + core::mem::size_of::<usize>() + HEADER_SIZE
            <= header.allocated_size::<AtomicAccess>()
    }
}

/// Describe how to trace an object.
#[derive(Clone, Copy)]
pub struct TraceDescriptor {
    pub base_object_payload: *const u8,
    pub callback: TraceCallback,
}

unsafe impl Send for TraceDescriptor {}
