//! Conservative scanning of the native stack of the thread owning a heap.

use std::thread::ThreadId;

/// Whether the native stack may hold pointers into the heap when a
/// collection starts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub enum StackState {
    /// The stack is scanned conservatively and objects found on it are pinned.
    MayContainHeapPointers,
    /// The caller guarantees that no frame holds an unrooted heap pointer.
    NoHeapPointers,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackBounds {
    /// Highest address of the stack. Stacks grow down from here.
    pub origin: *mut u8,
    /// Lowest usable address.
    pub bound: *mut u8,
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Self {
        unsafe {
            let thread = libc::pthread_self();
            let origin = libc::pthread_get_stackaddr_np(thread).cast::<u8>();
            let size = libc::pthread_get_stacksize_np(thread);
            Self {
                origin,
                bound: origin.sub(size),
            }
        }
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Self {
        unsafe {
            let mut bound = core::ptr::null_mut::<libc::c_void>();
            let mut stack_size = 0;
            let mut attr: libc::pthread_attr_t = core::mem::MaybeUninit::zeroed().assume_init();
            libc::pthread_attr_init(&mut attr);
            #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
            {
                libc::pthread_attr_get_np(libc::pthread_self(), &mut attr);
            }
            #[cfg(not(any(target_os = "freebsd", target_os = "netbsd")))]
            {
                libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            }
            libc::pthread_attr_getstack(&attr, &mut bound, &mut stack_size);
            libc::pthread_attr_destroy(&mut attr);
            Self {
                bound: bound.cast(),
                origin: bound.cast::<u8>().add(stack_size),
            }
        }
    }
}

#[cfg(windows)]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Self {
        use winapi::um::{memoryapi::VirtualQuery, winnt::MEMORY_BASIC_INFORMATION};
        unsafe {
            let mut info: MEMORY_BASIC_INFORMATION = core::mem::MaybeUninit::zeroed().assume_init();
            VirtualQuery(
                &mut info as *mut MEMORY_BASIC_INFORMATION as *mut _,
                &mut info,
                core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            let origin = info.BaseAddress.cast::<u8>().add(info.RegionSize as _);
            Self {
                origin,
                bound: info.AllocationBase.cast(),
            }
        }
    }
}

#[inline(never)]
pub fn approximate_stack_pointer() -> *const *const u8 {
    let mut x: *const *const u8 = core::ptr::null();
    x = &x as *const *const *const u8 as *const *const u8;
    std::hint::black_box(x)
}

/// Callee-saved registers may hold the only copy of a pointer. They are
/// spilled into a buffer that lives in the scanning frame.
#[inline(never)]
fn spill_callee_saved_registers(buffer: &mut [usize; 12]) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            "mov [{0} + 48], rsi",
            "mov [{0} + 56], rdi",
            in(reg) buffer.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "str x29, [{0}, #80]",
            in(reg) buffer.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    std::hint::black_box(buffer);
}

/// Native stack of the thread that created the heap.
pub struct Stack {
    origin: usize,
    thread: ThreadId,
}

impl Stack {
    /// Captures the bounds of the current thread's stack.
    pub fn current() -> Self {
        let bounds = StackBounds::current_thread_stack_bounds();
        Self {
            origin: bounds.origin as usize,
            thread: std::thread::current().id(),
        }
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn is_on_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Calls `f` with the word range between the current stack pointer and
    /// the stack origin, callee-saved registers included. Does nothing when
    /// called from another thread than the owner of this stack.
    #[inline(never)]
    pub fn iterate_pointers(&self, f: &mut dyn FnMut(*const usize, *const usize)) {
        if !self.is_on_current_thread() {
            log::debug!("skipping stack scan from a foreign thread");
            return;
        }
        let mut registers = [0usize; 12];
        spill_callee_saved_registers(&mut registers);
        let start = registers.as_ptr() as usize;
        debug_assert!(start < self.origin);
        let start = start & !(core::mem::size_of::<usize>() - 1);
        f(start as *const usize, self.origin as *const usize);
        std::hint::black_box(&registers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_frame_lies_within_bounds() {
        let bounds = StackBounds::current_thread_stack_bounds();
        let sp = approximate_stack_pointer() as usize;
        assert!(sp < bounds.origin as usize);
        assert!(sp > bounds.bound as usize);
    }

    #[test]
    fn test_scan_sees_local_words() {
        let stack = Stack::current();
        let marker = std::hint::black_box(0x5eed_cafe_usize);
        let mut found = false;
        stack.iterate_pointers(&mut |start, end| {
            let mut current = start;
            while current < end {
                if unsafe { current.read() } == marker {
                    found = true;
                }
                current = unsafe { current.add(1) };
            }
        });
        std::hint::black_box(&marker);
        assert!(found);
    }
}
