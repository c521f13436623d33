use std::fmt;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    addr.wrapping_add(align - 1) & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

pub struct FormattedSize {
    pub size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

/// Reports an unrecoverable allocation failure and terminates the process.
#[cold]
#[inline(never)]
pub fn fatal_out_of_memory(reason: &str) -> ! {
    log::error!("Fatal process out of memory: {}", reason);
    eprintln!("Fatal process out of memory: {}", reason);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}

/// A pointer reached the collector that does not belong to the heap's cage.
#[cold]
#[inline(never)]
pub fn fatal_security_violation(address: usize) -> ! {
    log::error!("Pointer {:#x} is outside of the heap cage", address);
    eprintln!("Security violation: pointer {:#x} is outside of the heap cage", address);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}

/// Fills freed memory with a recognizable pattern in debug builds.
#[inline]
pub unsafe fn zap_memory(start: *mut u8, size: usize) {
    #[cfg(debug_assertions)]
    {
        core::ptr::write_bytes(start, crate::globals::ZAPPED_MEMORY_BYTE, size);
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = (start, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(23, 8), 16);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4097, 8));
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
