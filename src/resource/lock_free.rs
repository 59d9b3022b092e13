//! Lock-free monotonic resource.
//!
//! Pool frontiers advance by CAS; the garbage list is traversed with a
//! hand-over-hand hazard-bit discipline encoded in the low bit of each link
//! word ([`layout::HAZARD`]); pool growth is single-writer, elected by a
//! `fetch_or` on the pool head, with losers parked on a condition variable.
//!
//! The hazard protocol: a thread edits a slot (the anchor or some node's
//! `next` word) only while the hazard bit of that slot is set by that thread,
//! and it acquires the next slot's bit before releasing the current one. At
//! most one thread holds any slot's bit, and each thread holds at most two,
//! so traversals cannot deadlock: waiting is only ever directed forward.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::layout::{
    self, align_up, align_up_pow2, checked_align_up, HAZARD, PIECE_FIELDS_SIZE, POOL_HEADER_SIZE,
};
use super::policy::{effective_granularity, DefaultPolicy, HeapPolicy};
use super::stats;
use super::vm::{overflow_error, PlatformVmOps, VmOps};
use super::{HeapError, MemoryResource};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{hint, thread, Condvar, Mutex};

/// Lock-free monotonic memory resource.
///
/// Requires power-of-two alignments (and a power-of-two policy granularity);
/// rejects everything else with [`HeapError::InvalidAlignment`]. Any number
/// of threads may allocate and deallocate concurrently; the only suspension
/// points are the pool-grow wait and the post-spin yield on a contended
/// hazard slot.
pub struct LockFreeHeap<P: HeapPolicy = DefaultPolicy> {
    pool: AtomicUsize,
    garbage: AtomicUsize,
    /// Bumped once per completed (or failed) grow attempt, under the mutex,
    /// so a parked loser can never miss the wakeup.
    grow_generation: Mutex<u64>,
    grown: Condvar,
    _policy: PhantomData<P>,
}

impl<P: HeapPolicy> LockFreeHeap<P> {
    /// Allocation quantum. The power-of-two requirement keeps the low bit of
    /// every stored address free for the hazard flag.
    pub(crate) const GRANULARITY: usize = {
        let granularity = effective_granularity(P::GRANULARITY);
        assert!(granularity.is_power_of_two());
        granularity
    };

    /// Actual pool block size: the policy's block size rounded up to the OS
    /// page size.
    pub(crate) fn pool_block_size() -> usize {
        align_up(P::BLOCK_SIZE, PlatformVmOps::page_size())
    }

    /// Largest piece-block that can live on the pool.
    pub(crate) fn pool_block_capacity() -> usize {
        Self::pool_block_size() - align_up_pow2(POOL_HEADER_SIZE, Self::GRANULARITY)
    }

    /// Creates a resource and charges its first pool block.
    ///
    /// # Errors
    ///
    /// [`HeapError::OutOfMemory`] if the initial reservation fails.
    pub fn new() -> Result<Self, HeapError> {
        let heap = Self {
            pool: AtomicUsize::new(0),
            garbage: AtomicUsize::new(0),
            grow_generation: Mutex::new(0),
            grown: Condvar::new(),
            _policy: PhantomData,
        };
        heap.grow_pool()?;
        Ok(heap)
    }

    /// See [`MemoryResource::allocate`].
    ///
    /// # Errors
    ///
    /// As documented on the trait; this variant additionally rejects
    /// non-power-of-two alignments.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        if bytes == 0 {
            return Err(HeapError::InvalidSize);
        }
        if !alignment.is_power_of_two() || alignment > PlatformVmOps::page_size() {
            // is_power_of_two also rules out zero.
            return Err(HeapError::InvalidAlignment {
                requested: alignment,
            });
        }

        if Self::required_pool_block_size(bytes, alignment)? > Self::pool_block_size() {
            return Self::allocate_large_block(bytes, alignment);
        }

        let piece = match self.allocate_on_garbage(bytes, alignment) {
            Some(piece) => piece,
            None => self.allocate_on_pool(bytes, alignment)?,
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
            return;
        }

        // Prepend to garbage. The expected CAS value is always an observed
        // hazard-clear head: installing over a set bit would steal the
        // anchor from the traverser that owns it.
        let mut observed = Self::spin_until_clear(|| self.garbage.load(Ordering::Acquire));
        // Safety: the piece is back in our hands; the size field keeps its
        // meaning and only the link is (re)written.
        unsafe { layout::init_garbage_next(head, observed) };
        loop {
            match self.garbage.compare_exchange_weak(
                observed,
                head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    observed = if actual & HAZARD == 0 {
                        actual
                    } else {
                        Self::spin_until_clear(|| self.garbage.load(Ordering::Acquire))
                    };
                    // Safety: head stays exclusively ours until the CAS
                    // publishes it.
                    unsafe { layout::garbage_header(head) }
                        .next
                        .store(observed, Ordering::Relaxed);
                }
            }
        }
    }

    /// True iff `other` is this very instance.
    pub fn is_equal(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }

    /// Cycles `op` until it observes a hazard-clear value, spinning up to
    /// `P::SPIN_LIMIT` times between yields.
    fn spin_until_clear(mut op: impl FnMut() -> usize) -> usize {
        loop {
            for _ in 0..P::SPIN_LIMIT {
                let value = op();
                if value & HAZARD == 0 {
                    return value;
                }
                hint::spin_loop();
            }
            thread::yield_now();
        }
    }

    /// Worst-case pool block footprint of a `(bytes, alignment)` request.
    fn required_pool_block_size(bytes: usize, alignment: usize) -> Result<usize, HeapError> {
        let header = align_up_pow2(POOL_HEADER_SIZE, Self::GRANULARITY);
        let required = checked_align_up(header + PIECE_FIELDS_SIZE, alignment)
            .and_then(|aligned| aligned.checked_add(bytes))
            .and_then(|end| checked_align_up(end, Self::GRANULARITY))
            .filter(|&required| required <= isize::MAX as usize)
            .ok_or_else(|| HeapError::OutOfMemory(overflow_error("required block size overflow")))?;
        Ok(required)
    }

    /// Serves a piece too big for any pool block from a dedicated OS region.
    fn allocate_large_block(bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        // The OS region is page-aligned and alignment is a power of two no
        // larger than a page, so the in-block slack is exactly the rounded
        // field footprint.
        let size = checked_align_up(PIECE_FIELDS_SIZE, alignment)
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

        let aligned = align_up_pow2(base + PIECE_FIELDS_SIZE, alignment);
        debug_assert!(aligned + bytes <= base + size);
        // Safety: the region is ours and big enough for fields plus payload.
        unsafe {
            layout::init_piece_size(base, size as isize);
            layout::store_block_head(aligned, base);
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    /// Single-writer pool growth.
    ///
    /// The thread that flips the pool head's hazard bit from clear performs
    /// the reservation and publishes the new head; every other caller parks
    /// on the condition variable until the generation counter moves.
    fn grow_pool(&self) -> Result<(), HeapError> {
        let pool = self.pool.fetch_or(HAZARD, Ordering::Acquire);
        if pool & HAZARD != 0 {
            // Reservation is in flight on another thread; sleep through it.
            let mut generation = self.grow_generation.lock().unwrap();
            let seen = *generation;
            while *generation == seen && self.pool.load(Ordering::Acquire) & HAZARD != 0 {
                generation = self.grown.wait(generation).unwrap();
            }
            return Ok(());
        }

        let block_size = Self::pool_block_size();
        // Safety: block_size is a positive page multiple.
        match unsafe { PlatformVmOps::allocate(block_size) } {
            Ok(base_ptr) => {
                let base = base_ptr.as_ptr() as usize;
                let unallocated = align_up_pow2(base + POOL_HEADER_SIZE, Self::GRANULARITY);
                // Safety: the block is ours and unpublished; `pool` was read
                // hazard-clear, so it is the real former head.
                unsafe { layout::init_pool_header(base, unallocated, pool) };
                stats::TOTAL_RESERVED.add(block_size);
                stats::POOL_BLOCKS_LIVE.add(1);
                self.pool.store(base, Ordering::Release);
                self.bump_grow_generation();
                Ok(())
            }
            Err(e) => {
                // Put the head back so another thread may try again.
                self.pool.store(pool, Ordering::Release);
                self.bump_grow_generation();
                Err(HeapError::OutOfMemory(e))
            }
        }
    }

    fn bump_grow_generation(&self) {
        let mut generation = self.grow_generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.grown.notify_all();
    }

    /// Bump allocation by CAS, newest block first; grows the pool when
    /// nothing fits. A pool-head change observed after a fruitless sweep
    /// restarts the sweep without growing.
    fn allocate_on_pool(&self, bytes: usize, alignment: usize) -> Result<usize, HeapError> {
        let mut current_pool = self.pool.load(Ordering::Acquire) & !HAZARD;

        loop {
            let mut block = current_pool;
            while block != 0 {
                // Safety: published pool blocks stay alive until drop.
                let header = unsafe { layout::pool_header(block) };

                loop {
                    let unallocated = header.unallocated.load(Ordering::Acquire);
                    let aligned = align_up_pow2(unallocated + PIECE_FIELDS_SIZE, alignment);
                    let tile = align_up_pow2(aligned + bytes, Self::GRANULARITY);

                    if tile > block + Self::pool_block_size() {
                        break;
                    }

                    if header
                        .unallocated
                        .compare_exchange_weak(
                            unallocated,
                            tile,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        // The span [unallocated, tile) is ours now.
                        // Safety: claimed above; fields fit by construction.
                        unsafe {
                            layout::init_piece_size(unallocated, (tile - unallocated) as isize);
                            layout::store_block_head(aligned, unallocated);
                        }
                        return Ok(aligned);
                    }

                    // Lost the race; the same block may still have room.
                }

                block = header.next;
            }

            let new_pool = self.pool.load(Ordering::Acquire) & !HAZARD;
            if new_pool != current_pool {
                // Somebody else already grew the pool; sweep again.
                current_pool = new_pool;
                continue;
            }

            self.grow_pool()?;
            current_pool = self.pool.load(Ordering::Acquire) & !HAZARD;
        }
    }

    /// Bounded-depth first-fit search with hand-over-hand hazard coupling.
    ///
    /// Best-effort: `None` sends the caller to the pool path.
    fn allocate_on_garbage(&self, bytes: usize, alignment: usize) -> Option<usize> {
        let mut inspected = 0;

        // Lock the anchor; `slot` is always the word we hold the hazard bit
        // of, and `current` its hazard-free payload.
        let mut slot: &AtomicUsize = &self.garbage;
        let mut current = Self::spin_until_clear(|| slot.fetch_or(HAZARD, Ordering::AcqRel));

        loop {
            if current == 0 {
                // Nothing (left) to search; restore the slot and bail out.
                slot.store(current, Ordering::Release);
                return None;
            }

            // Safety: a node reached through a hazard-held slot cannot be
            // repurposed under us.
            let node = unsafe { layout::garbage_header(current) };
            let next_slot = &node.next;
            let node_tile = current + node.size.load(Ordering::Relaxed) as usize;
            let aligned = align_up_pow2(current + PIECE_FIELDS_SIZE, alignment);
            let tile = align_up_pow2(aligned + bytes, Self::GRANULARITY);

            if tile > node_tile {
                // Too small. Give up once the inspection budget is spent.
                inspected += 1;
                if inspected >= P::GARBAGE_SEARCH_DEPTH {
                    slot.store(current, Ordering::Release);
                    return None;
                }

                // Hand-over-hand: take the next slot's bit, then release the
                // current slot unchanged. Only the holder of the current
                // slot's bit may set the next slot's, so a plain tagged
                // store suffices once the bit reads clear.
                let next = Self::spin_until_clear(|| next_slot.load(Ordering::Acquire));
                next_slot.store(next | HAZARD, Ordering::Relaxed);
                slot.store(current, Ordering::Release);

                slot = next_slot;
                current = next;
                continue;
            }

            // The node fits. Its link word must be quiescent before the node
            // can be spliced out or trimmed: a thread ahead of us may still
            // hold the bit it took while stepping through this node.
            let next = Self::spin_until_clear(|| next_slot.load(Ordering::Acquire));

            if tile < node_tile {
                // Keep the consumed span at the node's low address; the
                // remainder becomes the replacement node at `tile`.
                node.size.store((tile - current) as isize, Ordering::Relaxed);
                // Safety: the remainder lies inside the node we just claimed.
                unsafe {
                    layout::init_garbage_header(tile, (node_tile - tile) as isize, next);
                }
                slot.store(tile, Ordering::Release);
            } else {
                slot.store(next, Ordering::Release);
            }

            // Safety: aligned points into the claimed piece-block.
            unsafe { layout::store_block_head(aligned, current) };
            return Some(aligned);
        }
    }
}

impl<P: HeapPolicy> MemoryResource for LockFreeHeap<P> {
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        LockFreeHeap::allocate(self, bytes, alignment)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe { LockFreeHeap::deallocate(self, ptr, bytes, alignment) }
    }
}

impl<P: HeapPolicy> Drop for LockFreeHeap<P> {
    fn drop(&mut self) {
        let block_size = Self::pool_block_size();
        let mut block = self.pool.load(Ordering::Acquire) & !HAZARD;
        while block != 0 {
            // Safety: exclusive access at drop; garbage nodes living inside
            // the block are reclaimed with it. Release errors on teardown
            // are ignored.
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
