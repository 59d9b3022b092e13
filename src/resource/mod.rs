//! Monotonic memory resources.
//!
//! Both variants carve small allocations out of large OS-backed pool blocks
//! with a bump frontier, recycle returned pieces through a bounded-depth
//! first-fit garbage list, and serve oversize requests straight from the OS.
//! Freed pool space is never coalesced and pool blocks are only returned to
//! the OS when the owning instance is dropped.

pub(crate) mod layout;
pub(crate) mod policy;
pub(crate) mod stats;
pub(crate) mod vm;

mod lock_free;
mod serialized;

pub(crate) mod loom_tests;

#[cfg(all(test, not(loom)))]
mod integration;

use std::fmt;
use std::ptr::NonNull;

pub use lock_free::LockFreeHeap;
pub use serialized::Heap;

use vm::VmError;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}

/// Allocation failure, reported before any externally visible state change.
#[derive(Debug)]
pub enum HeapError {
    /// A zero-byte region was requested.
    InvalidSize,
    /// The requested alignment is zero, exceeds the OS page size, or — for
    /// the lock-free variant — is not a power of two.
    InvalidAlignment {
        requested: usize,
    },
    /// The OS refused a reservation, or the worst-case block size overflowed
    /// the platform's signed size type.
    OutOfMemory(VmError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::InvalidSize => write!(f, "invalid requested size"),
            HeapError::InvalidAlignment { requested } => {
                write!(f, "invalid requested alignment: {requested}")
            }
            HeapError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::InvalidSize | HeapError::InvalidAlignment { .. } => None,
            HeapError::OutOfMemory(e) => Some(e),
        }
    }
}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        HeapError::OutOfMemory(e)
    }
}

/// The polymorphic memory resource contract both variants satisfy.
///
/// Instances are their own memory domain: a piece must be returned to the
/// instance that produced it, and two distinct instances never compare
/// equal.
pub trait MemoryResource {
    /// Returns a pointer to `bytes` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// [`HeapError::InvalidSize`] / [`HeapError::InvalidAlignment`] for
    /// argument combinations the variant rejects, raised before any state is
    /// touched; [`HeapError::OutOfMemory`] when the OS denies a reservation
    /// or the worst-case block size overflows.
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError>;

    /// Returns a piece to the resource. A null `ptr` is a no-op; the `bytes`
    /// and `alignment` arguments are ignored — the piece's own header is
    /// authoritative.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from `allocate` on this very
    /// instance and not deallocated since.
    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize);

    /// True iff `other` is this very instance.
    fn is_equal(&self, other: &Self) -> bool
    where
        Self: Sized,
    {
        std::ptr::eq(self, other)
    }
}
