//! Reserved virtual memory. The reservation starts inaccessible, individual
//! ranges are committed when a page is handed out and decommitted when it is
//! returned.

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    use crate::util::align_up;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
        aligned: *mut u8,
    }

    impl Mmap {
        /// Reserves `size` bytes whose usable start is aligned to `align`.
        pub fn reserve(size: usize, align: usize) -> Option<Self> {
            unsafe {
                let total = size + align;
                let mem = VirtualAlloc(null_mut(), total, MEM_RESERVE, PAGE_NOACCESS);
                if mem.is_null() {
                    return None;
                }
                let mem = mem as *mut u8;
                let aligned = align_up(mem as usize, align) as *mut u8;
                Some(Self {
                    start: mem,
                    end: mem.add(total),
                    size: total,
                    aligned,
                })
            }
        }

        pub fn aligned(&self) -> *mut u8 {
            self.aligned
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { !VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE).is_null() }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::util::align_up;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
        aligned: *mut u8,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Reserves `size` bytes whose usable start is aligned to `align`.
        pub fn reserve(size: usize, align: usize) -> Option<Self> {
            unsafe {
                let total = size + align;
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    total as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                let start = map as *mut u8;
                Some(Self {
                    start,
                    end: start.add(total),
                    size: total,
                    aligned: align_up(start as usize, align) as *mut u8,
                })
            }
        }

        /// First address of the reservation that satisfies the requested alignment.
        pub fn aligned(&self) -> *mut u8 {
            self.aligned
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe {
                libc::mprotect(
                    page as *mut _,
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
                libc::mprotect(page as *mut _, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
