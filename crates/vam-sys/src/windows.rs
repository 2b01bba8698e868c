use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` base addresses are aligned to this value (typically 64KB),
/// which is larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Creates an anonymous mapping of `len` bytes starting at a multiple of
    /// `align`.
    ///
    /// Windows cannot trim a reservation, so alignment above the allocation
    /// granularity is obtained by reserving an oversized range to learn where
    /// free address space lies, releasing it, and re-reserving at the aligned
    /// address inside it. Another thread may steal the range between the two
    /// calls, so the dance is retried a few times before giving up.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `VirtualAlloc`/`VirtualFree`.
    pub unsafe fn map(len: usize, align: usize, reserve_only: bool) -> io::Result<MapInner> {
        let flags = if reserve_only {
            MEM_RESERVE
        } else {
            MEM_RESERVE | MEM_COMMIT
        };

        let ptr = unsafe { VirtualAlloc(ptr::null(), len, flags, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        if ptr as usize % align == 0 {
            return Ok(MapInner { ptr, len });
        }
        unsafe {
            VirtualFree(ptr, 0, MEM_RELEASE);
        }

        let over = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
        for _ in 0..3 {
            let probe = unsafe { VirtualAlloc(ptr::null(), over, MEM_RESERVE, PAGE_READWRITE) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (probe as usize).div_ceil(align) * align;
            unsafe {
                VirtualFree(probe, 0, MEM_RELEASE);
            }
            let ptr =
                unsafe { VirtualAlloc(aligned as *const _, len, flags, PAGE_READWRITE) };
            if ptr as usize == aligned {
                return Ok(MapInner { ptr, len });
            }
            if !ptr.is_null() {
                // Landed somewhere else; release and try again.
                unsafe {
                    VirtualFree(ptr, 0, MEM_RELEASE);
                }
            }
        }
        Err(Error::from(io::ErrorKind::AddrNotAvailable))
    }

    pub const fn ptr(&self) -> *mut u8 {
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
                // MEM_RELEASE requires dwSize to be 0.
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

// SAFETY: the mapping is owned exclusively and carries no thread affinity.
unsafe impl Send for MapInner {}
unsafe impl Sync for MapInner {}

/// Commits pages inside a reserved range.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let p = unsafe {
        VirtualAlloc(
            ptr.cast::<std::ffi::c_void>(),
            len,
            MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if p.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Decommits pages; they must be committed again before the next touch.
pub unsafe fn uncommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let ok = unsafe { VirtualFree(ptr.cast::<std::ffi::c_void>(), len, MEM_DECOMMIT) };
    if ok == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Marks pages as disposable without decommitting them; the range stays
/// usable but its contents become unspecified.
pub unsafe fn discard(ptr: *mut u8, len: usize) -> io::Result<()> {
    let p = unsafe {
        VirtualAlloc(
            ptr.cast::<std::ffi::c_void>(),
            len,
            MEM_RESET,
            PAGE_READWRITE,
        )
    };
    if p.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}
