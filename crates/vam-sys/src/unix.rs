use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MapInner {
    /// Creates an anonymous mapping of `len` bytes starting at a multiple of
    /// `align`.
    ///
    /// Alignments above the page size are satisfied by over-allocating
    /// `len + align` and unmapping the head and tail slack, so the retained
    /// range is exactly `[ptr, ptr + len)`.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`/`munmap`.
    pub unsafe fn map(len: usize, align: usize, reserve_only: bool) -> io::Result<MapInner> {
        let prot = if reserve_only {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let reserve = if reserve_only { MAP_NORESERVE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | reserve;

        if align <= page_size() {
            let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            return Ok(MapInner { ptr, len });
        }

        let over = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
        let start = unsafe { libc::mmap(ptr::null_mut(), over, prot, flags, -1, 0) };
        if start == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let base = start as usize;
        let aligned = base.div_ceil(align) * align;
        let head = aligned - base;
        let tail = over - head - len;
        unsafe {
            if head > 0 {
                libc::munmap(start, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(MapInner {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

// SAFETY: the mapping is owned exclusively and mmap regions have no thread
// affinity.
unsafe impl Send for MapInner {}
unsafe impl Sync for MapInner {}

/// Makes a reserved range readable and writable.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe {
        libc::mprotect(
            ptr.cast::<libc::c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Drops the physical backing; the mapping stays usable and refaults as zero.
pub unsafe fn uncommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::madvise(ptr.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Same mechanism as [`uncommit`] on Unix; kept separate because the two
/// differ on Windows.
pub unsafe fn discard(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { uncommit(ptr, len) }
}
