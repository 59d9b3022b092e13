//! Compile-time tuning policies.

use static_assertions::const_assert;

use super::layout::align_up;

/// Destructive interference distance of the target.
#[cfg(target_arch = "powerpc64")]
pub const CACHE_LINE: usize = 128;
/// Destructive interference distance of the target.
#[cfg(not(target_arch = "powerpc64"))]
pub const CACHE_LINE: usize = 64;

/// Per-instance-type tuning knobs, fixed at compile time.
///
/// Both resource variants are generic over a policy. The defaults match the
/// workloads the resources were designed for; override individual constants
/// by implementing the trait on a marker type:
///
/// ```
/// use monoheap::{Heap, HeapPolicy};
///
/// struct Coarse;
/// impl HeapPolicy for Coarse {
///     const GRANULARITY: usize = 128;
/// }
///
/// let heap = Heap::<Coarse>::new().unwrap();
/// # drop(heap);
/// ```
pub trait HeapPolicy {
    /// Desired pool block size in bytes. Rounded up to the OS page size at
    /// runtime.
    const BLOCK_SIZE: usize = 1 << 16;

    /// Desired allocation quantum. Rounded up to [`CACHE_LINE`]; must be a
    /// power of two for the lock-free variant.
    const GRANULARITY: usize = CACHE_LINE;

    /// Upper bound on garbage nodes inspected per allocation.
    const GARBAGE_SEARCH_DEPTH: usize = 64;

    /// Busy-wait iterations before yielding while a hazard bit stays set.
    const SPIN_LIMIT: usize = 1024;
}

/// The policy both variants default to.
pub struct DefaultPolicy;

impl HeapPolicy for DefaultPolicy {}

/// Actual allocation quantum for a desired granularity.
pub(crate) const fn effective_granularity(granularity: usize) -> usize {
    align_up(granularity, CACHE_LINE)
}

const_assert!(CACHE_LINE.is_power_of_two());
const_assert!(DefaultPolicy::BLOCK_SIZE > 0);
const_assert!(DefaultPolicy::GRANULARITY.is_power_of_two());
const_assert!(DefaultPolicy::GARBAGE_SEARCH_DEPTH > 0);
const_assert!(DefaultPolicy::SPIN_LIMIT > 0);
