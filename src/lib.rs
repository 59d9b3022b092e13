//! Monotonic polymorphic memory resources backed by OS virtual memory.
//!
//! Two variants share one data layout and algorithmic skeleton: [`Heap`]
//! serializes every pool and garbage operation behind a single mutex, while
//! [`LockFreeHeap`] relies on atomic bump pointers, CAS, and a
//! pointer-tagging hazard-bit discipline. Both carve small allocations out
//! of large pool blocks, recycle returned pieces through a bounded-depth
//! first-fit garbage list, and serve oversize requests straight from the OS.
//!
//! The resources are monotonic: freed space is recycled per instance but
//! never coalesced, and pool blocks go back to the OS only when the
//! instance is dropped.
//!
//! ```
//! use monoheap::{Heap, MemoryResource};
//!
//! let heap: Heap = Heap::new().expect("first pool block");
//! let piece = heap.allocate(256, 64).expect("allocate");
//! assert_eq!(piece.as_ptr() as usize % 64, 0);
//! // Safety: `piece` came from this very heap.
//! unsafe { heap.deallocate(piece.as_ptr(), 256, 64) };
//! assert!(heap.is_equal(&heap));
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("monoheap supports only 64-bit targets.");

pub(crate) mod sync;

pub mod resource;

pub use resource::policy::{DefaultPolicy, HeapPolicy, CACHE_LINE};
pub use resource::stats::{snapshot, ResourceStats};
pub use resource::vm::VmError;
pub use resource::{Heap, HeapError, LockFreeHeap, MemoryResource};
