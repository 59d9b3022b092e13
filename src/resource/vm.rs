//! Thin façade over the platform's page-granular virtual memory primitives.
//!
//! The resources only ever reserve-and-commit whole read-write regions and
//! release them; there is no partial commit or decommit. Under `cfg(loom)`
//! or `cfg(miri)` the façade is heap-backed so the synchronization logic is
//! testable without syscalls.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(io::Error),
    ReleaseFailed(io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::ReleaseFailed(e) => Some(e),
        }
    }
}

/// A reservation-style error for size computations that exceed the platform.
pub(crate) fn overflow_error(context: &'static str) -> VmError {
    VmError::ReservationFailed(io::Error::new(io::ErrorKind::OutOfMemory, context))
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve and commit a read-write region of `size` bytes.
    /// `size` must be a non-zero multiple of [`page_size`](Self::page_size).
    unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a region previously returned by [`allocate`](Self::allocate),
    /// with the same `size`.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Allocation granularity of the platform (cached, process-wide).
    fn page_size() -> usize;
}

/// Zero-sized dispatcher implementing [`VmOps`] for the build target.
pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{io, NonNull, PlatformVmOps, VmError, VmOps};

    impl VmOps for PlatformVmOps {
        unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(size > 0 && size.is_multiple_of(Self::page_size()));
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod win {
    use super::{io, NonNull, PlatformVmOps, VmError, VmOps};
    use windows::Win32::System::{Memory, SystemInformation};

    impl VmOps for PlatformVmOps {
        unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(size > 0 && size.is_multiple_of(Self::page_size()));
            // Reserve and commit in one call, read-write.
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                Memory::VirtualAlloc(
                    None,
                    size,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                )
            };

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            unsafe { Memory::VirtualFree(ptr.as_ptr().cast(), 0, Memory::MEM_RELEASE) }
                .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                let mut info = SystemInformation::SYSTEM_INFO::default();
                // Safety: FFI call to GetSystemInfo.
                unsafe { SystemInformation::GetSystemInfo(&mut info) };
                info.dwAllocationGranularity as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every region
// with a page-aligned heap allocation. This is sufficient for testing the
// *synchronization* logic of the resources (loom) and for detecting
// undefined behaviour in the unsafe pointer code (Miri); actual mapping
// behaviour is covered by the platform implementations in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `allocate`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
