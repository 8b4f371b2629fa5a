//! Page protection primitives.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the operating system's page size.
///
/// Cached in an atomic after the first call so later callers (including the
/// signal handler, via the engine's stored copy) never re-enter `sysconf`.
#[inline]
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Rounds an address down to its page base.
#[inline]
pub fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// Arms one page: read-only, so the next write faults.
pub fn arm(page_base: usize) -> io::Result<()> {
    mprotect(page_base, libc::PROT_READ)
}

/// Disarms one page: read+write, writes proceed untrapped.
pub fn disarm(page_base: usize) -> io::Result<()> {
    mprotect(page_base, libc::PROT_READ | libc::PROT_WRITE)
}

fn mprotect(page_base: usize, prot: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::mprotect(page_base as *mut libc::c_void, page_size(), prot) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert_eq!(size, page_size());
    }

    #[test]
    fn floor_aligns_down() {
        let size = page_size();
        assert_eq!(page_floor(size + 1, size), size);
        assert_eq!(page_floor(size - 1, size), 0);
        assert_eq!(page_floor(3 * size, size), 3 * size);
    }

    #[test]
    fn arm_disarm_roundtrip_on_anonymous_page() {
        let size = page_size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let base = ptr as usize;

        arm(base).unwrap();
        // Reads stay legal on an armed page.
        let _ = unsafe { std::ptr::read_volatile(base as *const u8) };
        disarm(base).unwrap();
        unsafe { std::ptr::write_volatile(base as *mut u8, 0x42) };
        assert_eq!(unsafe { std::ptr::read_volatile(base as *const u8) }, 0x42);

        unsafe { libc::munmap(ptr, size) };
    }
}
