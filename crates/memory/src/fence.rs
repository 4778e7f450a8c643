use std::sync::atomic::{AtomicU64, Ordering};

use crate::CACHE_LINE;

/// Consistency levels accepted by [`fence`].
///
/// Each level maps to one specific x86 fence; none of them reach beyond the
/// local process. Visibility of stores to peers mapping the same region is
/// a separate concern handled by [`flush_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consistency {
    /// Compiler-only reordering barrier.
    Relaxed,
    /// Store fence (`sfence`).
    Release,
    /// Load fence (`lfence`).
    Acquire,
    /// Full fence (`mfence`).
    SeqCst,
}

/// Issue the fence for `level` on the calling CPU.
pub fn fence(level: Consistency) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_lfence, _mm_mfence, _mm_sfence};

        match level {
            Consistency::Relaxed => {
                std::sync::atomic::compiler_fence(Ordering::SeqCst);
            }
            Consistency::Release => unsafe { _mm_sfence() },
            Consistency::Acquire => unsafe { _mm_lfence() },
            Consistency::SeqCst => unsafe { _mm_mfence() },
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        match level {
            Consistency::Relaxed => {
                std::sync::atomic::compiler_fence(Ordering::SeqCst);
            }
            Consistency::Release => std::sync::atomic::fence(Ordering::Release),
            Consistency::Acquire => std::sync::atomic::fence(Ordering::Acquire),
            Consistency::SeqCst => std::sync::atomic::fence(Ordering::SeqCst),
        }
    }
}

/// Write back every cache line covering `[addr, addr + len)` and fence the
/// stores, making them visible to other mappers of the same physical
/// region.
///
/// Uses `clflushopt` when the CPU has it (the lines flush concurrently and
/// the trailing `sfence` orders them) and plain `clflush` otherwise.
pub fn flush_range(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let start = addr as usize & !(CACHE_LINE - 1);
        let end = addr as usize + len;

        unsafe {
            #[cfg(has_clflushopt)]
            {
                use std::sync::LazyLock;

                static HAS_CLFLUSHOPT: LazyLock<bool> =
                    LazyLock::new(|| std::arch::is_x86_feature_detected!("clflushopt"));

                if *HAS_CLFLUSHOPT {
                    flush_lines_opt(start, end);
                } else {
                    flush_lines_plain(start, end);
                }
            }

            #[cfg(not(has_clflushopt))]
            {
                flush_lines_plain(start, end);
            }

            std::arch::x86_64::_mm_sfence();
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        std::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(all(target_arch = "x86_64", has_clflushopt))]
#[target_feature(enable = "clflushopt")]
unsafe fn flush_lines_opt(start: usize, end: usize) {
    use std::arch::x86_64::_mm_clflushopt;

    let mut line = start;
    while line < end {
        unsafe { _mm_clflushopt(line as *const u8) };
        line += CACHE_LINE;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_lines_plain(start: usize, end: usize) {
    use std::arch::x86_64::_mm_clflush;

    let mut line = start;
    while line < end {
        unsafe { _mm_clflush(line as *const u8) };
        line += CACHE_LINE;
    }
}

/// Hardware fetch-and-add on the u64 at `addr`, returning the old value.
///
/// # Safety
///
/// `addr` must be valid, 8-byte aligned, and only accessed atomically for
/// the duration of the call.
pub unsafe fn fetch_add_u64(addr: *mut u64, value: u64) -> u64 {
    unsafe { AtomicU64::from_ptr(addr) }.fetch_add(value, Ordering::SeqCst)
}

/// Hardware compare-and-swap on the u64 at `addr`, returning the observed
/// value (equal to `expected` exactly when the swap happened).
///
/// # Safety
///
/// Same contract as [`fetch_add_u64`].
pub unsafe fn compare_exchange_u64(addr: *mut u64, expected: u64, desired: u64) -> u64 {
    match unsafe { AtomicU64::from_ptr(addr) }.compare_exchange(
        expected,
        desired,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(observed) => observed,
        Err(observed) => observed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_do_not_fault() {
        for level in [
            Consistency::Relaxed,
            Consistency::Release,
            Consistency::Acquire,
            Consistency::SeqCst,
        ] {
            fence(level);
        }
    }

    #[test]
    fn flush_covers_unaligned_ranges() {
        let buf = vec![0u8; 4096];
        flush_range(buf.as_ptr(), 0);
        flush_range(unsafe { buf.as_ptr().add(7) }, 130);
        flush_range(buf.as_ptr(), buf.len());
    }

    #[test]
    fn hardware_atomics() {
        let mut word = 40u64;
        let addr = &mut word as *mut u64;

        assert_eq!(unsafe { fetch_add_u64(addr, 2) }, 40);
        assert_eq!(word, 42);

        assert_eq!(unsafe { compare_exchange_u64(addr, 42, 7) }, 42);
        assert_eq!(word, 7);

        // A losing CAS reports what it saw and leaves the word alone.
        assert_eq!(unsafe { compare_exchange_u64(addr, 42, 9) }, 7);
        assert_eq!(word, 7);
    }
}
