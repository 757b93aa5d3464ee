use heap_alloc::{ALIGNMENT, AllocError, ArenaBreak, Heap, MIN_BLOCK};

/// A heap over a fresh leaked region of `capacity` bytes.
fn heap_with(capacity: usize) -> Heap<ArenaBreak> {
    let region = Box::leak(vec![0u8; capacity].into_boxed_slice());
    Heap::new(ArenaBreak::from_static(region)).expect("bootstrap")
}

fn heap() -> Heap<ArenaBreak> {
    heap_with(1 << 20)
}

fn fill(ptr: *mut u8, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(ptr, byte, len) };
}

fn assert_filled(ptr: *const u8, len: usize, byte: u8) {
    for i in 0..len {
        assert_eq!(unsafe { ptr.add(i).read() }, byte, "byte {i} differs");
    }
}

#[test]
fn payloads_are_aligned() {
    let mut heap = heap();
    for size in [1, 7, 8, 15, 16, 17, 100, 503, 504, 505, 1000, 4096, 1 << 16] {
        let p = heap.allocate(size);
        assert!(!p.is_null(), "allocate({size})");
        assert_eq!(p as usize % ALIGNMENT, 0, "allocate({size}) misaligned");
        heap.verify().unwrap();
    }
}

#[test]
fn zero_size_allocate_returns_null_without_growth() {
    let mut heap = heap();
    let managed = heap.managed_bytes();

    assert!(heap.allocate(0).is_null());
    assert_eq!(heap.last_error(), Some(AllocError::OutOfMemory));
    assert_eq!(heap.managed_bytes(), managed);
    assert_eq!(heap.free_block_count(), 0);
    heap.verify().unwrap();
}

#[test]
fn tiny_allocations_are_distinct_and_spaced() {
    let mut heap = heap();
    let a = heap.allocate(1) as usize;
    let b = heap.allocate(1) as usize;
    let c = heap.allocate(1) as usize;

    let mut ptrs = [a, b, c];
    ptrs.sort_unstable();
    assert!(ptrs[0] != 0);
    assert!(ptrs[1] - ptrs[0] >= MIN_BLOCK);
    assert!(ptrs[2] - ptrs[1] >= MIN_BLOCK);
    heap.verify().unwrap();
}

#[test]
fn released_block_is_reused_lifo() {
    let mut heap = heap();
    let p = heap.allocate(100);
    fill(p, 100, 0xa5);
    unsafe { heap.release(p) };
    assert_eq!(heap.free_block_count(), 1);
    heap.verify().unwrap();

    // The freed block sits on the unsorted list; the next search takes it.
    let q = heap.allocate(100);
    assert_eq!(q, p);
    heap.verify().unwrap();
}

#[test]
fn adjacent_releases_coalesce() {
    let mut heap = heap();
    let p = heap.allocate(40);
    let q = heap.allocate(40);
    unsafe { heap.release(p) };
    heap.verify().unwrap();
    unsafe { heap.release(q) };
    heap.verify().unwrap();

    // The second release merges with the first: one block, big enough to
    // serve a request neither half could.
    assert_eq!(heap.free_block_count(), 1);
    let r = heap.allocate(100);
    assert_eq!(r, p);
    heap.verify().unwrap();
}

#[test]
fn release_null_is_a_no_op() {
    let mut heap = heap();
    let managed = heap.managed_bytes();
    unsafe { heap.release(std::ptr::null_mut()) };
    assert_eq!(heap.managed_bytes(), managed);
    assert_eq!(heap.free_block_count(), 0);
    heap.verify().unwrap();
}

#[test]
fn resize_to_same_size_returns_same_pointer() {
    let mut heap = heap();
    let p = heap.allocate(64);
    fill(p, 64, 0x5a);

    let q = unsafe { heap.resize(p, 64) };
    assert_eq!(q, p);
    assert_filled(q, 64, 0x5a);
    heap.verify().unwrap();
}

#[test]
fn resize_shrink_splits_and_keeps_payload() {
    let mut heap = heap();
    let p = heap.allocate(200);
    fill(p, 200, 0x3c);

    let q = unsafe { heap.resize(p, 50) };
    assert_eq!(q, p);
    assert_filled(q, 50, 0x3c);
    // The trimmed tail went back to the free pool.
    assert_eq!(heap.free_block_count(), 1);
    heap.verify().unwrap();
}

#[test]
fn resize_grows_in_place_at_the_heap_end() {
    let mut heap = heap_with(1 << 21);
    let p = heap.allocate(16);
    fill(p, 16, 0x77);

    // Nothing was allocated after `p`, so it is the last block before the
    // epilogue and can grow by stretching the heap underneath it.
    let q = unsafe { heap.resize(p, 1 << 20) };
    assert_eq!(q, p);
    assert_filled(q, 16, 0x77);
    heap.verify().unwrap();
}

#[test]
fn resize_moves_when_blocked_and_keeps_prefix() {
    let mut heap = heap();
    let p = heap.allocate(16);
    fill(p, 16, 0x42);
    // Cap `p` with a live allocation so it cannot grow in place.
    let cap = heap.allocate(16);

    let q = unsafe { heap.resize(p, 1024) };
    assert!(!q.is_null());
    assert_ne!(q, p);
    assert_filled(q, 16, 0x42);
    heap.verify().unwrap();

    // The old block was retired and is available again.
    let r = heap.allocate(16);
    assert_eq!(r, p);
    let _ = cap;
    heap.verify().unwrap();
}

#[test]
fn resize_null_behaves_as_allocate() {
    let mut heap = heap();
    let p = unsafe { heap.resize(std::ptr::null_mut(), 100) };
    assert!(!p.is_null());
    assert_eq!(p as usize % ALIGNMENT, 0);
    heap.verify().unwrap();
}

#[test]
fn resize_to_zero_releases() {
    let mut heap = heap();
    let p = heap.allocate(100);
    let q = unsafe { heap.resize(p, 0) };
    assert!(q.is_null());
    // Not a failure: no error is recorded for the release-by-resize.
    assert_eq!(heap.last_error(), None);
    assert_eq!(heap.free_block_count(), 1);
    heap.verify().unwrap();
}

#[test]
fn zeroed_allocation_is_all_zero() {
    let mut heap = heap();
    // Dirty the region first so the zeroing actually has work to do.
    let p = heap.allocate(256);
    fill(p, 256, 0xff);
    unsafe { heap.release(p) };

    let q = heap.allocate_zeroed(40, 3);
    assert!(!q.is_null());
    assert_filled(q, 120, 0);
    heap.verify().unwrap();
}

#[test]
fn zeroed_overflow_is_detected() {
    let mut heap = heap();
    let managed = heap.managed_bytes();
    let p = heap.allocate_zeroed(usize::MAX, 2);
    assert!(p.is_null());
    assert_eq!(heap.last_error(), Some(AllocError::OutOfMemory));
    assert_eq!(heap.managed_bytes(), managed);
    heap.verify().unwrap();
}

#[test]
fn oversized_allocate_fails_cleanly() {
    let mut heap = heap();
    let p = heap.allocate(usize::MAX - 8);
    assert!(p.is_null());
    assert_eq!(heap.last_error(), Some(AllocError::OutOfMemory));
    heap.verify().unwrap();
}

#[test]
fn exhaustion_fails_then_recovers_after_release() {
    let mut heap = heap_with(4096);
    let a = heap.allocate(1024);
    let b = heap.allocate(1024);
    let c = heap.allocate(1024);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    // The arena cannot hold a fourth kilobyte block.
    let d = heap.allocate(1024);
    assert!(d.is_null());
    assert_eq!(heap.last_error(), Some(AllocError::OutOfMemory));
    heap.verify().unwrap();

    // Releasing the middle block makes room for a same-size request.
    unsafe { heap.release(b) };
    let e = heap.allocate(1000);
    assert_eq!(e, b);
    heap.verify().unwrap();
}

#[test]
fn failed_resize_leaves_the_original_intact() {
    let mut heap = heap_with(4096);
    let p = heap.allocate(512);
    fill(p, 512, 0x9d);
    let cap = heap.allocate(512);
    let filler = heap.allocate(2048);
    assert!(!cap.is_null() && !filler.is_null());

    // `p` cannot grow in place (capped) and nothing else fits: the resize
    // fails, and `p` must come through unharmed.
    let q = unsafe { heap.resize(p, 3000) };
    assert!(q.is_null());
    assert_eq!(heap.last_error(), Some(AllocError::OutOfMemory));
    assert_filled(p, 512, 0x9d);
    heap.verify().unwrap();

    unsafe { heap.release(p) };
    heap.verify().unwrap();
}

#[test]
fn bootstrap_fails_on_a_hopeless_region() {
    let region = Box::leak(vec![0u8; 8].into_boxed_slice());
    assert_eq!(
        Heap::new(ArenaBreak::from_static(region)).err(),
        Some(AllocError::OutOfMemory)
    );
}

#[test]
fn sweep_files_blocks_into_exact_buckets() {
    let mut heap = heap();
    let mut ptrs = Vec::new();
    for _ in 0..5 {
        ptrs.push(heap.allocate(48));
    }
    // Release the odd ones out; no two released blocks are adjacent.
    for &p in [ptrs[0], ptrs[2], ptrs[4]].iter() {
        unsafe { heap.release(p) };
        heap.verify().unwrap();
    }

    // A large request drains the unsorted list into the buckets (and takes
    // none of the small blocks).
    let big = heap.allocate(1000);
    assert!(!big.is_null());
    heap.verify().unwrap();

    // The sweep filed in LIFO order, so the bucket head is the first-freed
    // block (the last-freed one was stretched into the large request's
    // block, being the block before the epilogue).
    let q = heap.allocate(48);
    assert_eq!(q, ptrs[0]);
    heap.verify().unwrap();
}

#[test]
fn large_buckets_are_searched_by_size() {
    let mut heap = heap();
    let small = heap.allocate(520); // block of 536 bytes: first doubling bucket
    let _spacer1 = heap.allocate(16);
    let large = heap.allocate(990); // block of 1008 bytes: same bucket
    let _spacer2 = heap.allocate(16);

    unsafe { heap.release(small) };
    unsafe { heap.release(large) };
    heap.verify().unwrap();

    // Drain the unsorted list into the buckets without touching either.
    let drain = heap.allocate(2000);
    assert!(!drain.is_null());
    heap.verify().unwrap();

    // Both freed blocks share a bucket; the chain walk must skip the
    // too-small one and land on the other.
    let q = heap.allocate(985);
    assert_eq!(q, large);
    heap.verify().unwrap();
}

#[test]
fn verify_catches_a_header_scribble() {
    let mut heap = heap();
    let p = heap.allocate(32);
    assert!(heap.verify().is_ok());

    // Stomp the block header the way a buggy caller would.
    unsafe { p.sub(8).cast::<u64>().write(0) };
    assert!(heap.verify().is_err());
}

#[test]
fn mixed_workload_stays_consistent() {
    let mut heap = heap_with(4 << 20);
    let mut rng: u64 = 0x853c_49e6_748f_ea9b;
    let mut next = move || {
        rng = rng
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (rng >> 33) as usize
    };

    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
    for round in 0..300 {
        match next() % 4 {
            // Allocate and pattern-fill.
            0 | 1 => {
                let len = 1 + next() % 700;
                let byte = (round % 251) as u8;
                let p = heap.allocate(len);
                assert!(!p.is_null(), "allocate({len}) in round {round}");
                fill(p, len, byte);
                live.push((p, len, byte));
            }
            // Release a random survivor.
            2 => {
                if !live.is_empty() {
                    let (p, len, byte) = live.swap_remove(next() % live.len());
                    assert_filled(p, len, byte);
                    unsafe { heap.release(p) };
                }
            }
            // Resize a random survivor; the common prefix must survive.
            _ => {
                if !live.is_empty() {
                    let slot = next() % live.len();
                    let (p, len, byte) = live[slot];
                    let new_len = 1 + next() % 900;
                    let q = unsafe { heap.resize(p, new_len) };
                    assert!(!q.is_null(), "resize to {new_len} in round {round}");
                    assert_filled(q, len.min(new_len), byte);
                    let byte = (byte ^ 0x55).wrapping_add(1);
                    fill(q, new_len, byte);
                    live[slot] = (q, new_len, byte);
                }
            }
        }
        heap.verify().unwrap();
    }

    for (p, len, byte) in live.drain(..) {
        assert_filled(p, len, byte);
        unsafe { heap.release(p) };
        heap.verify().unwrap();
    }

    // One more search coalesces whatever the releases left unsorted.
    let p = heap.allocate(64);
    assert!(!p.is_null());
    heap.verify().unwrap();
}
