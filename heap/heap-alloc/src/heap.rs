use crate::block::Block;
use crate::free_list::{FreeTable, LIST_COUNT, MAX_SMALL, find_list_index};
use crate::tag::BlockTag;
use crate::{ALIGNMENT, MIN_BLOCK, WORD};
use core::ptr::{self, NonNull};
use heap_brk::ProgramBreak;
use log::{debug, error, trace};

/// A segregated-fit heap with deferred coalescing over a growable data
/// segment.
///
/// The heap manages one contiguous region bracketed by two sentinel blocks
/// (*prologue* and *epilogue*) whose permanently-allocated, zero-size tags
/// stop every physical-neighbor walk at the region edges. Free blocks live
/// on one of 75 doubly-linked lists: list 0 is the *unsorted
/// list* that receives every freshly freed block, the rest are keyed by
/// block size. Searches drain the unsorted list first, coalescing each
/// block on the way, so merge work is amortized across allocations and the
/// most recently freed memory is reused first.
///
/// All process-global state of the classical design (list table, sentinels,
/// error indicator) lives in this object; one instance is one heap. The
/// design is single-threaded: every operation takes `&mut self` and no
/// internal synchronization exists.
///
/// # Invariants
/// - Every block size is a multiple of [`ALIGNMENT`] and at least
///   [`MIN_BLOCK`]; payload addresses are [`ALIGNMENT`]-aligned.
/// - Free blocks carry a footer equal to their header; allocated blocks keep
///   their footer word up to date too, but callers never see it (payload
///   capacity is `size - 2 * WORD`).
/// - No two physically adjacent coalescable free blocks exist when a public
///   operation returns.
/// - A free block is on exactly one list; only list 0 may hold blocks whose
///   size does not match the list's bucket.
pub struct Heap<B: ProgramBreak> {
    brk: B,
    pub(crate) free_lists: FreeTable,
    pub(crate) prologue: Block,
    pub(crate) epilogue: Block,
    last_error: Option<AllocError>,
}

// Safety: the raw block pointers all point into the segment owned by `brk`,
// which moves with the heap.
unsafe impl<B: ProgramBreak + Send> Send for Heap<B> {}

impl<B: ProgramBreak> Heap<B> {
    /// Bootstrap a heap on top of `brk`.
    ///
    /// Claims just enough of the segment to place the two sentinels, padding
    /// first so that the prologue lands on an [`ALIGNMENT`] boundary and
    /// every payload handed out afterwards is aligned.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the segment cannot supply the first
    /// few words.
    pub fn new(mut brk: B) -> Result<Self, AllocError> {
        let Ok(end) = brk.advance(0) else {
            error!("heap bootstrap: cannot query the data segment");
            return Err(AllocError::OutOfMemory);
        };
        let end_addr = end.as_ptr() as usize;
        let pad = end_addr.next_multiple_of(ALIGNMENT) - end_addr;
        if brk.advance(pad + 2 * WORD).is_err() {
            error!("heap bootstrap: data segment refused {} bytes", pad + 2 * WORD);
            return Err(AllocError::OutOfMemory);
        }

        // Safety: the claim above covers [end + pad, end + pad + 2 * WORD),
        // exactly the two sentinel headers.
        let (prologue, epilogue) = unsafe {
            let prologue = Block::from_header(end.as_ptr().add(pad));
            let epilogue = Block::from_header(prologue.header().add(WORD));
            prologue.make_sentinel();
            epilogue.make_sentinel();
            (prologue, epilogue)
        };
        debug!("heap bootstrapped at {:#x} ({pad} pad bytes)", prologue.addr());

        Ok(Self {
            brk,
            free_lists: FreeTable::new(),
            prologue,
            epilogue,
            last_error: None,
        })
    }

    /// Allocate `size` bytes.
    ///
    /// Returns a payload pointer aligned to [`ALIGNMENT`], or null for a
    /// zero-size request, on arithmetic overflow, or when the segment is
    /// exhausted. Null returns record [`AllocError::OutOfMemory`] in
    /// [`last_error`](Self::last_error).
    #[must_use]
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        match self.try_allocate(size) {
            Ok(payload) => payload.as_ptr(),
            Err(error) => self.fail(error),
        }
    }

    /// Allocate `count * size` bytes and zero them.
    ///
    /// Returns null (recording the error) if the byte count overflows or the
    /// allocation fails.
    #[must_use]
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            error!("allocate_zeroed: {count} x {size} bytes overflows");
            return self.fail(AllocError::OutOfMemory);
        };
        let payload = self.allocate(total);
        if !payload.is_null() {
            // Safety: a successful allocation covers at least `total` bytes.
            unsafe { ptr::write_bytes(payload, 0, total) };
        }
        payload
    }

    /// Release a payload pointer. Null is ignored.
    ///
    /// The block is coalesced with its physical neighbors and parked on the
    /// unsorted list; it finds its size bucket lazily, during a later
    /// search.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this heap and
    /// not released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        // Safety: per this function's contract, `payload` is a live payload
        // of this heap.
        unsafe {
            let block = Block::from_payload(payload);
            // Coalesce on the way onto the unsorted list as well as off it,
            // so the list never accumulates immediately mergeable shards.
            let merged = self.coalesce(block);
            self.free_lists.insert(merged, true);
        }
    }

    /// Resize the allocation at `ptr` to `new_size` bytes, in place when
    /// possible, moving it otherwise.
    ///
    /// - Null `ptr` behaves as [`allocate`](Self::allocate).
    /// - `new_size == 0` releases `ptr` and returns null; that null means
    ///   "no allocation", not failure.
    /// - On failure, null is returned (recording the error), the original
    ///   block stays allocated, and `ptr` stays valid.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this heap and
    /// not released since.
    #[must_use]
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            // Safety: forwarded contract.
            unsafe { self.release(payload.as_ptr()) };
            return ptr::null_mut();
        }
        let Some(size) = block_size_for(new_size) else {
            error!("resize: request of {new_size} bytes overflows");
            return self.fail(AllocError::OutOfMemory);
        };

        // Safety: per this function's contract, `payload` is a live payload
        // of this heap.
        unsafe {
            let mut block = Block::from_payload(payload);
            let original_payload = block.size() - 2 * WORD;

            if size > block.size() {
                // Coalesce until the block stops growing: the merges would
                // happen on release anyway, and they often make the move
                // unnecessary.
                loop {
                    let before = block.size();
                    block = self.coalesce(block);
                    if block.size() == before {
                        break;
                    }
                }
            }

            if block.size() < size {
                return self.resize_grow(block, payload, size, original_payload);
            }

            // Shrinking, or coalescing made enough room in place.
            if !block.is_allocated() {
                self.free_lists.remove(block);
            }
            let new_payload = block.payload();
            if new_payload != payload {
                // The block start moved left; slide the payload down. The
                // ranges overlap, `copy` tolerates that.
                let keep = usize::min(original_payload, size - 2 * WORD);
                ptr::copy(payload.as_ptr(), new_payload.as_ptr(), keep);
            }
            // Split only after the copy so a shrink cannot clobber live
            // bytes.
            self.split(block, size);
            new_payload.as_ptr()
        }
    }

    /// The most recent failure, if any.
    ///
    /// Set on every failed operation and never cleared by successes, in the
    /// manner of a process-global error indicator.
    #[inline]
    #[must_use]
    pub const fn last_error(&self) -> Option<AllocError> {
        self.last_error
    }

    fn fail(&mut self, error: AllocError) -> *mut u8 {
        self.last_error = Some(error);
        ptr::null_mut()
    }

    fn try_allocate(&mut self, user_size: usize) -> Result<NonNull<u8>, AllocError> {
        if user_size == 0 {
            return Err(AllocError::OutOfMemory);
        }
        let size = block_size_for(user_size).ok_or_else(|| {
            error!("allocate: request of {user_size} bytes overflows");
            AllocError::OutOfMemory
        })?;
        // Safety: all blocks handled below live in the managed region.
        unsafe {
            let block = self.obtain_block(size)?;
            Ok(block.payload())
        }
    }

    /// Produce an allocated block of at least `size` bytes, detached from
    /// every list and split down to `size` when the leftovers can stand
    /// alone.
    ///
    /// # Safety
    /// `size` must be an [`ALIGNMENT`] multiple of at least [`MIN_BLOCK`].
    unsafe fn obtain_block(&mut self, size: usize) -> Result<Block, AllocError> {
        unsafe {
            let block = match self.find_block(size) {
                Some(found) => found,
                None => self.grow_for(size)?,
            };
            if !block.is_allocated() {
                // Straight off a segregated list; detach it.
                self.free_lists.remove(block);
            }
            self.split(block, size);
            Ok(block)
        }
    }

    /// No free block fits: grow the heap. If the block right before the
    /// epilogue is free, stretch it by the missing bytes instead of
    /// appending a whole new block behind it.
    ///
    /// # Safety
    /// As [`obtain_block`](Self::obtain_block).
    unsafe fn grow_for(&mut self, size: usize) -> Result<Block, AllocError> {
        unsafe {
            let last = self.epilogue.prev_physical();
            if last.is_allocated() {
                self.extend(size)
            } else {
                self.extend(size - last.size())?;
                self.free_lists.remove(last);
                last.set_size(size);
                Ok(last)
            }
        }
    }

    /// Grow the managed region by `size` bytes. The old epilogue position
    /// becomes the header of the returned block (allocated, `size` bytes)
    /// and a fresh epilogue is placed behind it.
    ///
    /// On failure nothing changes: no block is created, no list is touched.
    fn extend(&mut self, size: usize) -> Result<Block, AllocError> {
        debug_assert!(size.is_multiple_of(ALIGNMENT));
        if self.brk.advance(size).is_err() {
            error!("heap extension: data segment refused {size} bytes");
            return Err(AllocError::OutOfMemory);
        }
        trace!("extended heap by {size} bytes");
        // Safety: the segment just grew by `size` bytes starting at the old
        // epilogue header, so the whole new extent is ours.
        unsafe {
            let block = self.epilogue;
            block.set_tag(block.tag().with_allocated(true).with_quick(false));
            block.set_size(size);
            self.epilogue = block.next_physical();
            self.epilogue.make_sentinel();
            Ok(block)
        }
    }

    /// Merge `block` with whichever physical neighbors are coalescable,
    /// detaching the absorbed blocks (and `block` itself, if it was free)
    /// from their lists. Returns the merged block, which is on no list; the
    /// caller decides where it goes.
    ///
    /// # Safety
    /// `block` must be a regular block of this heap.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        unsafe {
            let mut start = block;
            let mut merged = block.size();

            if block.prev_footer().coalescable() {
                let prev = block.prev_physical();
                self.free_lists.remove(prev);
                merged += prev.size();
                // The earlier neighbor is now the start of the merged block.
                start = prev;
            }
            let next = block.next_physical();
            if next.tag().coalescable() {
                self.free_lists.remove(next);
                merged += next.size();
            }

            if merged != block.size() {
                if !block.is_allocated() {
                    self.free_lists.remove(block);
                }
                start.set_size(merged);
            }
            start
        }
    }

    /// Trim `block` down to `size` bytes; the cut-off tail goes to the
    /// unsorted list. Does nothing when the tail would be too small to stand
    /// alone (internal fragmentation below [`MIN_BLOCK`] is tolerated).
    ///
    /// # Safety
    /// `block` must be a regular block of this heap, detached from every
    /// list, with `size` an [`ALIGNMENT`] multiple `<= block.size()`.
    unsafe fn split(&mut self, block: Block, size: usize) {
        unsafe {
            let excess = block.size() - size;
            if excess < MIN_BLOCK {
                return;
            }
            block.set_size(size);
            let tail = block.next_physical();
            tail.set_tag(BlockTag::new().with_allocated(true));
            tail.set_size(excess);
            // The tail retires like any other block: coalesced first, then
            // parked on the unsorted list. The left neighbor is the block
            // being trimmed, so the merge can only ever reach right (a
            // shrinking resize may expose a free block there).
            let merged = self.coalesce(tail);
            self.free_lists.insert(merged, true);
        }
    }

    /// One pass over the unsorted list, then over the segregated buckets.
    ///
    /// Each unsorted block is coalesced and detached; a fit is returned on
    /// the spot, everything else gets filed into its size bucket. The bucket
    /// scan then starts at the first index that can hold `size`. A block
    /// returned from the sweep is detached and marked allocated; one from a
    /// bucket is still linked in and free.
    ///
    /// # Safety
    /// As [`obtain_block`](Self::obtain_block).
    unsafe fn find_block(&mut self, size: usize) -> Option<Block> {
        unsafe {
            while let Some(head) = self.free_lists.unsorted_head() {
                let merged = self.coalesce(head);
                if !merged.is_allocated() {
                    // No growth, so the block still sits on the unsorted
                    // list.
                    self.free_lists.remove(merged);
                }
                if merged.size() >= size {
                    return Some(merged);
                }
                self.free_lists.insert(merged, false);
            }

            for index in find_list_index(size)..LIST_COUNT {
                if let Some(found) = self.find_in_list(index, size) {
                    return Some(found);
                }
            }
            None
        }
    }

    /// First fit within one bucket.
    ///
    /// Small requests take the head without a size check: every block in an
    /// exact-size bucket at or past the request's own bucket is big enough,
    /// and the doubling buckets start at 512 which exceeds every small
    /// request.
    ///
    /// # Safety
    /// The bucket's links must be intact (heap invariants).
    unsafe fn find_in_list(&self, index: usize, size: usize) -> Option<Block> {
        unsafe {
            if size <= MAX_SMALL {
                return self.free_lists.head(index);
            }
            let mut cursor = self.free_lists.head(index);
            while let Some(block) = cursor {
                if block.size() >= size {
                    return Some(block);
                }
                cursor = block.next_free();
            }
            None
        }
    }

    /// Grow path of [`resize`](Self::resize): coalescing was not enough.
    ///
    /// # Safety
    /// As [`resize`](Self::resize); `block` is the (possibly merged) block
    /// whose payload started at `payload`.
    unsafe fn resize_grow(
        &mut self,
        block: Block,
        payload: NonNull<u8>,
        size: usize,
        original_payload: usize,
    ) -> *mut u8 {
        unsafe {
            let new_payload;
            let mut retired = None;
            if block.next_physical() == self.epilogue {
                // Last block in the heap: stretch the heap underneath it.
                // The search would reach the same conclusion only after
                // walking every remaining bucket.
                if let Err(error) = self.extend(size - block.size()) {
                    return self.fail(error);
                }
                if !block.is_allocated() {
                    // Coalescing can leave the block filed as free; reclaim
                    // it while the bucket math still sees the old size.
                    self.free_lists.remove(block);
                }
                block.set_size(size);
                new_payload = block.payload();
            } else {
                let fresh = match self.obtain_block(size) {
                    Ok(fresh) => fresh,
                    Err(error) => return self.fail(error),
                };
                new_payload = fresh.payload();
                retired = Some(block);
            }

            if new_payload != payload {
                ptr::copy(payload.as_ptr(), new_payload.as_ptr(), original_payload);
            }
            if let Some(old) = retired {
                // Retire the replaced block, but only when the new one sits
                // higher; a lower address would mean the ranges overlapped
                // and the bytes have already moved.
                if new_payload.as_ptr() as usize > payload.as_ptr() as usize {
                    self.release(old.payload().as_ptr());
                }
            }
            new_payload.as_ptr()
        }
    }
}

/// Required block size for `user_size` payload bytes: header plus tail word,
/// rounded up to the alignment quantum. `None` on arithmetic overflow.
fn block_size_for(user_size: usize) -> Option<usize> {
    user_size
        .checked_add(2 * WORD)?
        .checked_next_multiple_of(ALIGNMENT)
}

/// Failure of a heap operation.
///
/// There is a single user-visible failure mode: the heap cannot produce the
/// requested bytes, whether because the data segment refused to grow, a size
/// computation overflowed, or the request was for zero bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The heap cannot satisfy the request.
    #[error("out of memory")]
    OutOfMemory,
}
