use std::{fs::OpenOptions, io, os::fd::AsRawFd, path::Path, ptr};

/// The node's local region: one contiguous byte-addressable buffer exposed
/// to the cluster as this node's segment.
///
/// The buffer is backed by a CXL DAX device when a path is supplied and by
/// an anonymous mapping otherwise; beyond acquisition the runtime does not
/// care which. The mapped virtual base is the translation base for every
/// local global pointer.
///
/// The region must outlive every heap allocation within it and every
/// outstanding RMA that targets it; the runtime holds it in an `Arc` shared
/// with all handler tasks for exactly that reason.
pub struct Region {
    base: *mut u8,
    len: usize,
}

// The raw base pointer is only a window onto process-shared memory; all
// concurrent access goes through atomics or is synchronized above us.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map a region of `len` bytes, from `dax` when given.
    pub fn acquire(len: usize, dax: Option<&Path>) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be non-zero",
            ));
        }

        let base = match dax {
            Some(path) => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                let base = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        file.as_raw_fd(),
                        0,
                    )
                };

                // The fd can go away once the mapping exists.
                if base == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }

                log::info!("local region mapped: dax={:?}, size={}", path, len);
                base
            }
            None => {
                let base = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };

                if base == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }

                log::info!("local region mapped: anonymous, size={}", len);
                base
            }
        };

        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw address of `offset` within this segment.
    ///
    /// There is deliberately no bounds check: well-known offsets above the
    /// heap bound are legal, and the contract makes the caller responsible
    /// for staying inside the segment.
    pub fn translate(&self, offset: u64) -> *mut u8 {
        self.base.wrapping_add(offset as usize)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
