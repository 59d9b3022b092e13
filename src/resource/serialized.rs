//! Serialized monotonic resource: a single instance-level mutex guards the
//! pool and the garbage list. Large-block traffic never takes the lock.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::layout::{
    self, align_up, checked_align_up, PIECE_FIELDS_SIZE, POOL_HEADER_SIZE,
};
use super::policy::{effective_granularity, DefaultPolicy, HeapPolicy};
use super::stats;
use super::vm::{overflow_error, PlatformVmOps, VmOps};
use super::{HeapError, MemoryResource};
use crate::sync::atomic::Ordering;
use crate::sync::Mutex;

/// Heads of the two intrusive lists; `0` is the empty list.
struct Lists {
    pool: usize,
    garbage: usize,
}

/// Mutex-guarded monotonic memory resource.
///
/// Accepts any positive alignment up to the OS page size, including
/// non-power-of-two values. Any number of threads may call concurrently;
/// only one makes progress through the pool or garbage structures at a
/// time.
pub struct Heap<P: HeapPolicy = DefaultPolicy> {
    lists: Mutex<Lists>,
    _policy: PhantomData<P>,
}

impl<P: HeapPolicy> Heap<P> {
    /// Allocation quantum: the policy's granularity rounded up to the
    /// cache-line size.
    pub(crate) const GRANULARITY: usize = effective_granularity(P::GRANULARITY);

    /// Actual pool block size: the policy's block size rounded up to the OS
    /// page size.
    pub(crate) fn pool_block_size() -> usize {
        align_up(P::BLOCK_SIZE, PlatformVmOps::page_size())
    }

    /// Largest piece-block that can live on the pool; anything bigger is a
    /// large block both when allocating and when classifying a deallocation.
    pub(crate) fn pool_block_capacity() -> usize {
        Self::pool_block_size() - align_up(POOL_HEADER_SIZE, Self::GRANULARITY)
    }

    /// Creates a resource and charges its first pool block.
    ///
    /// # Errors
    ///
    /// [`HeapError::OutOfMemory`] if the initial reservation fails.
    pub fn new() -> Result<Self, HeapError> {
        let heap = Self {
            lists: Mutex::new(Lists { pool: 0, garbage: 0 }),
            _policy: PhantomData,
        };
        Self::grow_pool(&mut heap.lists.lock().unwrap())?;
        Ok(heap)
    }

    /// See [`MemoryResource::allocate`].
    ///
    /// # Errors
    ///
    /// As documented on the trait; this variant accepts non-power-of-two
    /// alignments.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        if bytes == 0 {
            return Err(HeapError::InvalidSize);
        }
        if alignment == 0 || alignment > PlatformVmOps::page_size() {
            return Err(HeapError::InvalidAlignment {
                requested: alignment,
            });
        }

        if Self::required_pool_block_size(bytes, alignment)? > Self::pool_block_size() {
            return Self::allocate_large_block(bytes, alignment);
        }

        let mut lists = self.lists.lock().unwrap();
        let piece = match Self::allocate_on_garbage(&mut lists, bytes, alignment) {
            Some(piece) => piece,
            None => Self::allocate_on_pool(&mut lists, bytes, alignment)?,
        };
        // Safety: both paths return a non-null aligned address.
        Ok(unsafe { NonNull::new_unchecked(piece as *mut u8) })
    }

    /// See [`MemoryResource::deallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from [`allocate`](Self::allocate)
    /// on this very instance and not deallocated since.
    pub unsafe fn deallocate(&self, ptr: *mut u8, _bytes: usize, _alignment: usize) {
        if ptr.is_null() {
            return;
        }
        // Safety: per contract the piece carries both hidden fields.
        let head = unsafe { layout::load_block_head(ptr as usize) };
        let size = unsafe { layout::piece_size(head) };

        if size > Self::pool_block_capacity() as isize {
            stats::TOTAL_RESERVED.sub(size as usize);
            stats::LARGE_BLOCKS_LIVE.sub(1);
            // Safety: head/size identify a dedicated OS region. A refused
            // release leaves nothing useful to report.
            unsafe {
                drop(PlatformVmOps::release(
                    NonNull::new_unchecked(head as *mut u8),
                    size as usize,
                ));
            }
        } else {
            let mut lists = self.lists.lock().unwrap();
            // The size field keeps its meaning; only the link is written.
            // Safety: the piece is back in our hands and big enough for the
            // garbage fields.
            unsafe { layout::init_garbage_next(head, lists.garbage) };
            lists.garbage = head;
        }
    }

    /// True iff `other` is this very instance.
    pub fn is_equal(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }

    /// Worst-case pool block footprint of a `(bytes, alignment)` request:
    /// rounded header, piece fields, alignment slack, payload, granularity
    /// rounding. The classification between pool and large-block traffic.
    ///
    /// Pool block bases are page-aligned, so for power-of-two alignments the
    /// slack is exact. A non-power-of-two alignment shares no divisor with
    /// the base and must assume full `alignment − 1` slack, or a boundary
    /// request could be classified onto a pool it can never fit.
    fn required_pool_block_size(bytes: usize, alignment: usize) -> Result<usize, HeapError> {
        let header = align_up(POOL_HEADER_SIZE, Self::GRANULARITY);
        let slack = if alignment.is_power_of_two() {
            checked_align_up(header + PIECE_FIELDS_SIZE, alignment)
        } else {
            (header + PIECE_FIELDS_SIZE).checked_add(alignment - 1)
        };
        let required = slack
            .and_then(|aligned| aligned.checked_add(bytes))
            .and_then(|end| checked_align_up(end, Self::GRANULARITY))
            .filter(|&required| required <= isize::MAX as usize)
            .ok_or_else(|| HeapError::OutOfMemory(overflow_error("required block size overflow")))?;
        Ok(required)
    }

    /// Serves a piece too big for any pool block from a dedicated OS region.
    fn allocate_large_block(bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        // Worst-case alignment slack: the OS hands back a page-aligned base,
        // which for non-power-of-two alignments guarantees nothing.
        let size = PIECE_FIELDS_SIZE
            .checked_add(alignment - 1)
            .and_then(|fields| fields.checked_add(bytes))
            .and_then(|end| checked_align_up(end, PlatformVmOps::page_size()))
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| HeapError::OutOfMemory(overflow_error("large block size overflow")))?;

        // Safety: size is a positive page multiple.
        let base = unsafe { PlatformVmOps::allocate(size) }
            .map_err(HeapError::OutOfMemory)?
            .as_ptr() as usize;
        stats::TOTAL_RESERVED.add(size);
        stats::LARGE_BLOCKS_LIVE.add(1);

        let aligned = align_up(base + PIECE_FIELDS_SIZE, alignment);
        debug_assert!(aligned + bytes <= base + size);
        // Safety: the region is ours and big enough for fields plus payload.
        unsafe {
            layout::init_piece_size(base, size as isize);
            layout::store_block_head(aligned, base);
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    /// Appends a fresh pool block in front of the current head.
    fn grow_pool(lists: &mut Lists) -> Result<(), HeapError> {
        let block_size = Self::pool_block_size();
        // Safety: block_size is a positive page multiple.
        let base = unsafe { PlatformVmOps::allocate(block_size) }
            .map_err(HeapError::OutOfMemory)?
            .as_ptr() as usize;

        // The frontier starts at the first granularity boundary past the
        // header, which keeps every carved piece-block granularity-aligned.
        let unallocated = align_up(base + POOL_HEADER_SIZE, Self::GRANULARITY);
        // Safety: the block is ours and unpublished.
        unsafe { layout::init_pool_header(base, unallocated, lists.pool) };
        lists.pool = base;

        stats::TOTAL_RESERVED.add(block_size);
        stats::POOL_BLOCKS_LIVE.add(1);
        Ok(())
    }

    /// Bounded-depth first-fit search through the garbage list.
    ///
    /// Best-effort: `None` sends the caller to the pool path. At most
    /// `P::GARBAGE_SEARCH_DEPTH` nodes are inspected.
    fn allocate_on_garbage(lists: &mut Lists, bytes: usize, alignment: usize) -> Option<usize> {
        let mut previous: Option<usize> = None;
        let mut current = lists.garbage;
        let mut inspected = 0;

        while current != 0 {
            // Safety: every node on the list carries both garbage fields.
            let node = unsafe { layout::garbage_header(current) };
            let node_tile = current + node.size.load(Ordering::Relaxed) as usize;
            let aligned = align_up(current + PIECE_FIELDS_SIZE, alignment);
            let tile = align_up(aligned + bytes, Self::GRANULARITY);

            if tile > node_tile {
                // Too small. Give up once the inspection budget is spent.
                inspected += 1;
                if inspected >= P::GARBAGE_SEARCH_DEPTH {
                    return None;
                }
                previous = Some(current);
                current = node.next.load(Ordering::Relaxed);
                continue;
            }

            let next = node.next.load(Ordering::Relaxed);
            let replacement = if tile < node_tile {
                // Keep the consumed span at the node's low address and
                // install the remainder as the replacement node at `tile`.
                node.size.store((tile - current) as isize, Ordering::Relaxed);
                // Safety: the remainder lies inside the node we just claimed.
                unsafe {
                    layout::init_garbage_header(tile, (node_tile - tile) as isize, next);
                }
                tile
            } else {
                next
            };
            match previous {
                None => lists.garbage = replacement,
                // Safety: previous is a live garbage node.
                Some(prev) => unsafe { layout::garbage_header(prev) }
                    .next
                    .store(replacement, Ordering::Relaxed),
            }

            // Safety: aligned points into the claimed piece-block.
            unsafe { layout::store_block_head(aligned, current) };
            return Some(aligned);
        }

        None
    }

    /// Bump allocation, newest block first; grows the pool when nothing
    /// fits.
    fn allocate_on_pool(
        lists: &mut Lists,
        bytes: usize,
        alignment: usize,
    ) -> Result<usize, HeapError> {
        loop {
            let mut block = lists.pool;
            while block != 0 {
                // Safety: block is a live pool block.
                let header = unsafe { layout::pool_header(block) };
                let unallocated = header.unallocated.load(Ordering::Relaxed);
                let aligned = align_up(unallocated + PIECE_FIELDS_SIZE, alignment);
                let tile = align_up(aligned + bytes, Self::GRANULARITY);

                if tile <= block + Self::pool_block_size() {
                    // Safety: the span [unallocated, tile) is unclaimed block
                    // arena; the frontier advance below makes it ours.
                    unsafe {
                        layout::init_piece_size(unallocated, (tile - unallocated) as isize);
                        layout::store_block_head(aligned, unallocated);
                    }
                    header.unallocated.store(tile, Ordering::Relaxed);
                    return Ok(aligned);
                }
                block = header.next;
            }

            Self::grow_pool(lists)?;
        }
    }
}

impl<P: HeapPolicy> MemoryResource for Heap<P> {
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        Heap::allocate(self, bytes, alignment)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe { Heap::deallocate(self, ptr, bytes, alignment) }
    }
}

impl<P: HeapPolicy> Drop for Heap<P> {
    fn drop(&mut self) {
        let lists = self.lists.lock().unwrap();
        let block_size = Self::pool_block_size();
        let mut block = lists.pool;
        while block != 0 {
            // Safety: block is a live pool block; garbage nodes living inside
            // it are reclaimed with it. Release errors on teardown are
            // ignored.
            let next = unsafe { layout::pool_header(block) }.next;
            unsafe {
                drop(PlatformVmOps::release(
                    NonNull::new_unchecked(block as *mut u8),
                    block_size,
                ));
            }
            stats::TOTAL_RESERVED.sub(block_size);
            stats::POOL_BLOCKS_LIVE.sub(1);
            block = next;
        }
    }
}
