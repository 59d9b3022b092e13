//! Loom-based concurrency tests.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Exercise the lock-free variant's synchronization points — the frontier
//! CAS, the garbage prepend/traversal interaction, and the grow election —
//! under every thread interleaving loom can explore.
//!
//! # Design notes
//!
//! Loom enumerates interleavings exhaustively, so:
//!   - Thread counts are kept to 2 and loop bodies to a couple of
//!     operations.
//!   - The model policy uses `SPIN_LIMIT = 1` so contended hazard waits
//!     yield immediately instead of multiplying the state space.
//!   - Every iteration creates a fresh heap; the VM façade is heap-backed
//!     under `cfg(loom)` (see `vm.rs`), so no syscalls are modelled.
//!   - The serialized variant is not modelled: a single mutex leaves loom
//!     nothing to explore that std tests don't already cover.
#[cfg(loom)]
mod tests {
    use crate::resource::layout::PIECE_FIELDS_SIZE;
    use crate::resource::policy::HeapPolicy;
    use crate::resource::{stats, LockFreeHeap};
    use crate::sync::Arc;

    struct ModelPolicy;
    impl HeapPolicy for ModelPolicy {
        const BLOCK_SIZE: usize = 4096;
        const GARBAGE_SEARCH_DEPTH: usize = 4;
        const SPIN_LIMIT: usize = 1;
    }

    type ModelHeap = LockFreeHeap<ModelPolicy>;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(preemption);
        builder
    }

    #[test]
    fn loom_frontier_cas_yields_disjoint_pieces() {
        bounded(3).check(|| {
            let heap = Arc::new(ModelHeap::new().unwrap());

            let h1 = Arc::clone(&heap);
            let t1 = loom::thread::spawn(move || h1.allocate(1, 1).unwrap().as_ptr() as usize);
            let h2 = Arc::clone(&heap);
            let t2 = loom::thread::spawn(move || h2.allocate(1, 1).unwrap().as_ptr() as usize);

            let first = t1.join().unwrap();
            let second = t2.join().unwrap();

            // Piece-blocks are one granularity quantum each; overlapping
            // claims would land the pointers closer than that.
            assert!(first.abs_diff(second) >= 64, "frontier CAS handed out overlapping pieces");
        });
    }

    #[test]
    fn loom_concurrent_prepends_both_recycled() {
        bounded(3).check(|| {
            let heap = Arc::new(ModelHeap::new().unwrap());
            let p1 = heap.allocate(1, 1).unwrap().as_ptr() as usize;
            let p2 = heap.allocate(1, 1).unwrap().as_ptr() as usize;

            let h1 = Arc::clone(&heap);
            let t1 = loom::thread::spawn(move || unsafe {
                h1.deallocate(p1 as *mut u8, 1, 1);
            });
            let h2 = Arc::clone(&heap);
            let t2 = loom::thread::spawn(move || unsafe {
                h2.deallocate(p2 as *mut u8, 1, 1);
            });
            t1.join().unwrap();
            t2.join().unwrap();

            // Both nodes must be on the garbage list: two exact-fit requests
            // drain it without touching the pool.
            let r1 = heap.allocate(1, 1).unwrap().as_ptr() as usize;
            let r2 = heap.allocate(1, 1).unwrap().as_ptr() as usize;
            let mut recycled = [r1, r2];
            recycled.sort_unstable();
            let mut expected = [p1, p2];
            expected.sort_unstable();
            assert_eq!(recycled, expected, "a prepend was lost");
        });
    }

    #[test]
    fn loom_traversal_vs_prepend() {
        bounded(2).check(|| {
            let heap = Arc::new(ModelHeap::new().unwrap());

            // Seed the garbage list with one too-small node so the searcher
            // actually traverses while the prepender races it.
            let small = heap.allocate(1, 1).unwrap();
            let big = heap.allocate(200, 1).unwrap();
            unsafe { heap.deallocate(small.as_ptr(), 1, 1) };

            let h1 = Arc::clone(&heap);
            let searcher = loom::thread::spawn(move || {
                // Needs more than the seeded node offers: walks past it.
                h1.allocate(150, 1).unwrap().as_ptr() as usize
            });
            let h2 = Arc::clone(&heap);
            let big_ptr = big.as_ptr() as usize;
            let prepender = loom::thread::spawn(move || unsafe {
                h2.deallocate(big_ptr as *mut u8, 200, 1);
            });

            let found = searcher.join().unwrap();
            prepender.join().unwrap();

            // The searcher got memory from somewhere sane and the list
            // survived: another over-sized request still succeeds.
            assert_ne!(found, 0);
            let after = heap.allocate(150, 1).unwrap();
            assert_ne!(after.as_ptr() as usize, found);
        });
    }

    #[test]
    fn loom_grow_race_grows_once() {
        bounded(2).check(|| {
            let heap = Arc::new(ModelHeap::new().unwrap());
            // One piece of this shape exhausts a whole block.
            let bytes = ModelHeap::pool_block_capacity() - PIECE_FIELDS_SIZE;

            let h1 = Arc::clone(&heap);
            let t1 = loom::thread::spawn(move || h1.allocate(bytes, 1).unwrap().as_ptr() as usize);
            let h2 = Arc::clone(&heap);
            let t2 = loom::thread::spawn(move || h2.allocate(bytes, 1).unwrap().as_ptr() as usize);

            let first = t1.join().unwrap();
            let second = t2.join().unwrap();
            assert_ne!(first, second);

            // Whoever lost the first block grew the pool exactly once.
            assert_eq!(stats::POOL_BLOCKS_LIVE.get(), 2);
        });
    }
}
