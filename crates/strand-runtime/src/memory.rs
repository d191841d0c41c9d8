//! Fiber stack memory using mmap
//!
//! Each fiber owns one private mapping: a guard page at the low end and
//! read-write pages above it. The stack grows downward from `top()` toward
//! the guard, so an overflow faults instead of corrupting neighbors.

use strand_core::error::MemoryError;

use std::ptr;

/// Smallest usable stack accepted. Anything below this cannot hold the
/// entry trampoline plus a realistic coroutine frame.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A private, fixed-size stack region with a guard page.
#[derive(Debug)]
pub struct FiberStack {
    /// Mapping base; the first page is the guard.
    base: *mut u8,
    /// Mapping length including the guard page.
    total: usize,
}

impl FiberStack {
    /// Map a new stack with `stack_size` usable bytes (rounded up to the
    /// page size) plus one guard page below them.
    pub fn new(stack_size: usize) -> Result<Self, MemoryError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(MemoryError::InvalidSize);
        }
        let page = page_size();
        let usable = stack_size.div_ceil(page) * page;
        let total = usable + page;

        // Reserve the whole region inaccessible, then open up everything
        // above the guard page.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(page) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            unsafe {
                libc::munmap(base, total);
            }
            return Err(MemoryError::ProtectionFailed);
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the region; the initial stack pointer for a fresh fiber.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between the guard page and `top()`.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total - page_size()
    }

    /// Release physical pages back to the OS, keeping the mapping.
    ///
    /// Called when a dead fiber's stack is handed to a new coroutine; the
    /// pages come back zeroed on first touch, so the recycled fiber sees
    /// the same blank region a fresh mapping would give it.
    pub fn reset(&self) {
        let page = page_size();
        let ret = unsafe {
            libc::madvise(
                self.base.add(page) as *mut libc::c_void,
                self.total - page,
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            log::warn!(
                "madvise on recycled stack failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            log::error!(
                "munmap of fiber stack failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        assert!(stack.usable_size() >= 64 * 1024);
        assert_eq!(stack.top() as usize % page_size(), 0);

        // The usable region below the top must be writable.
        unsafe {
            let p = stack.top().sub(8) as *mut u64;
            p.write(0xdead_beef);
            assert_eq!(p.read(), 0xdead_beef);
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = FiberStack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.usable_size() % page_size(), 0);
        assert!(stack.usable_size() > MIN_STACK_SIZE);
    }

    #[test]
    fn test_rejects_tiny_stack() {
        assert_eq!(
            FiberStack::new(1024).unwrap_err(),
            MemoryError::InvalidSize
        );
    }

    #[test]
    fn test_reset_keeps_mapping_usable() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(16) as *mut u64;
            p.write(42);
            stack.reset();
            // Pages are re-faulted zeroed.
            assert_eq!(p.read(), 0);
            p.write(7);
            assert_eq!(p.read(), 7);
        }
    }
}
