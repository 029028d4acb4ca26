//! Page source: the only place where the allocator talks to the operating
//! system. Everything above this module sees memory as [`Mapping`]s of
//! whole pages.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, error};

use crate::{
    error::{AllocError, Result},
    utils::checked_align,
};

/// Virtual memory page size of the computer, queried once. It should be a
/// constant, but we don't know the value at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Marker type the platform implementations hang off.
pub(crate) struct Kernel;

/// A contiguous, page aligned range obtained from the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub base: NonNull<u8>,
    pub len: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator itself has nothing to do with the concrete
/// APIs offered by each kernel.
trait PlatformMemory {
    /// Request a read/write memory region of size `len`. Returns `None` if the
    /// underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the
    /// kernel. Returns `false` if the kernel rejected the request.
    unsafe fn return_memory(addr: *mut u8, len: usize) -> bool;

    /// Makes `len` bytes starting from `addr` inaccessible.
    unsafe fn protect_none(addr: *mut u8, len: usize) -> bool;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = Kernel::page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Maps at least `bytes` bytes, rounded up to the page size.
pub(crate) fn acquire(bytes: usize) -> Result<Mapping> {
    let len = checked_align(bytes.max(1), page_size()).ok_or(AllocError::OutOfMemory { size: bytes })?;

    // SAFETY: a fresh anonymous mapping does not alias anything.
    let base = unsafe { Kernel::request_memory(len) }.ok_or(AllocError::OutOfMemory { size: len })?;

    debug!("mapped {len} bytes at {:p}", base);

    Ok(Mapping { base, len })
}

/// Gives `mapping` back to the operating system.
///
/// Releasing something that is not a live mapping is a bug in the caller:
/// debug builds stop right there, release builds log it and report
/// [`AllocError::UnmapFailed`].
///
/// **SAFETY**: nothing may access the mapping afterwards.
pub(crate) unsafe fn release(mapping: Mapping) -> Result<()> {
    let Mapping { base, len } = mapping;

    if unsafe { Kernel::return_memory(base.as_ptr(), len) } {
        debug!("unmapped {len} bytes at {:p}", base);
        return Ok(());
    }

    error!("kernel refused to unmap {len} bytes at {:p}", base);
    debug_assert!(false, "released an unrecognized mapping at {:p}", base);

    Err(AllocError::UnmapFailed {
        addr: base.as_ptr() as usize,
        len,
    })
}

/// Turns `len` bytes at `addr` into guard pages.
///
/// **SAFETY**: the range must be page aligned and inside a live mapping
/// nobody uses.
pub(crate) unsafe fn protect_none(addr: NonNull<u8>, len: usize) -> Result<()> {
    if unsafe { Kernel::protect_none(addr.as_ptr(), len) } {
        Ok(())
    } else {
        Err(AllocError::OutOfMemory { size: len })
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
            unsafe { munmap(addr as *mut c_void, len as size_t) == 0 }
        }

        unsafe fn protect_none(addr: *mut u8, len: usize) -> bool {
            unsafe { mprotect(addr as *mut c_void, len as size_t, libc::PROT_NONE) == 0 }
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
            // MEM_RELEASE frees the whole reservation and requires a size of 0.
            unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
        }

        unsafe fn protect_none(addr: *mut u8, len: usize) -> bool {
            let mut old = Memory::PAGE_PROTECTION_FLAGS::default();

            unsafe { Memory::VirtualProtect(addr as *const c_void, len, Memory::PAGE_NOACCESS, &mut old).is_ok() }
        }

        fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
