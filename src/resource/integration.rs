//! Cross-variant tests: both resources must satisfy the same external
//! contract, so the bodies here are generic over [`MemoryResource`].

use std::ptr::NonNull;

use super::{stats, Heap, HeapError, LockFreeHeap, MemoryResource, TEST_MUTEX};

fn exercise_mixed_workload<R: MemoryResource>(resource: &R) {
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..64usize {
        let bytes = 1 + (round * 97) % 2000;
        let alignment = 1usize << (round % 7);
        let stamp = (round & 0xFF) as u8;

        let ptr = resource.allocate(bytes, alignment).unwrap();
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        // Safety: freshly allocated region of `bytes` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), stamp, bytes) };
        live.push((ptr, bytes, stamp));

        if round % 3 == 2 {
            let (old, old_bytes, old_stamp) = live.remove(0);
            // Safety: still live, stamped by us.
            unsafe {
                let slice = std::slice::from_raw_parts(old.as_ptr(), old_bytes);
                assert!(slice.iter().all(|&b| b == old_stamp), "piece was clobbered");
                resource.deallocate(old.as_ptr(), old_bytes, 1);
            }
        }
    }

    for (ptr, bytes, stamp) in live {
        // Safety: still live, stamped by us.
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), bytes);
            assert!(slice.iter().all(|&b| b == stamp), "piece was clobbered");
            resource.deallocate(ptr.as_ptr(), bytes, 1);
        }
    }
}

fn exercise_oversize_round_trip<R: MemoryResource>(resource: &R) {
    // Larger than any default pool block: must take the large-block path
    // and come back without disturbing later allocations.
    let bytes = 1 << 17;
    let ptr = resource.allocate(bytes, 4096).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 4096, 0);
    // Safety: the whole region must be committed and writable.
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0x5A, bytes);
        assert_eq!(*ptr.as_ptr().add(bytes - 1), 0x5A);
        resource.deallocate(ptr.as_ptr(), bytes, 4096);
    }

    let small = resource.allocate(32, 8).unwrap();
    // Safety: fresh small piece.
    unsafe { resource.deallocate(small.as_ptr(), 32, 8) };
}

fn rejects_common_invalid_arguments<R: MemoryResource>(resource: &R) {
    assert!(matches!(
        resource.allocate(0, 1),
        Err(HeapError::InvalidSize)
    ));
    assert!(matches!(
        resource.allocate(1, 0),
        Err(HeapError::InvalidAlignment { requested: 0 })
    ));
    assert!(matches!(
        resource.allocate(isize::MAX as usize, 1),
        Err(HeapError::OutOfMemory(_))
    ));
}

#[test]
fn test_serialized_contract() {
    let _guard = TEST_MUTEX.read().unwrap();
    let heap: Heap = Heap::new().unwrap();
    exercise_mixed_workload(&heap);
    exercise_oversize_round_trip(&heap);
    rejects_common_invalid_arguments(&heap);
}

#[test]
fn test_lock_free_contract() {
    let _guard = TEST_MUTEX.read().unwrap();
    let heap: LockFreeHeap = LockFreeHeap::new().unwrap();
    exercise_mixed_workload(&heap);
    exercise_oversize_round_trip(&heap);
    rejects_common_invalid_arguments(&heap);
}

#[test]
fn test_stats_track_reservations() {
    let _guard = TEST_MUTEX.write().unwrap();
    let before = stats::snapshot();

    let heap: LockFreeHeap = LockFreeHeap::new().unwrap();
    let after = stats::snapshot();
    assert!(after.total_reserved > before.total_reserved);
    assert_eq!(after.pool_blocks_live, before.pool_blocks_live + 1);

    let big = heap.allocate(1 << 17, 1).unwrap();
    assert_eq!(stats::snapshot().large_blocks_live, before.large_blocks_live + 1);
    // Safety: fresh large piece from this heap.
    unsafe { heap.deallocate(big.as_ptr(), 1 << 17, 1) };
    assert_eq!(stats::snapshot().large_blocks_live, before.large_blocks_live);

    drop(heap);
    let final_stats = stats::snapshot();
    assert_eq!(final_stats.total_reserved, before.total_reserved);
    assert_eq!(final_stats.pool_blocks_live, before.pool_blocks_live);
}

#[test]
fn test_instances_are_distinct_domains() {
    let _guard = TEST_MUTEX.read().unwrap();
    let a: Heap = Heap::new().unwrap();
    let b: Heap = Heap::new().unwrap();
    assert!(!a.is_equal(&b));

    // Pieces from different instances are distinct even for equal shapes.
    let pa = a.allocate(64, 64).unwrap();
    let pb = b.allocate(64, 64).unwrap();
    assert_ne!(pa, pb);
    // Safety: returned to their own instances.
    unsafe {
        a.deallocate(pa.as_ptr(), 64, 64);
        b.deallocate(pb.as_ptr(), 64, 64);
    }
}
