//! Heap self-checking.
//!
//! [`Heap::verify`] walks the managed region twice, once along the physical
//! chain and once along every free list, and reports the first structural
//! violation it finds. The test suite calls it after every operation; it is
//! also a serviceable debugging aid when hunting corruption in code that
//! embeds the heap.

use crate::block::Block;
use crate::free_list::{LIST_COUNT, find_list_index};
use crate::heap::Heap;
use crate::tag::BlockTag;
use crate::{ALIGNMENT, MIN_BLOCK, WORD};
use heap_brk::ProgramBreak;

impl<B: ProgramBreak> Heap<B> {
    /// Size of the managed region in bytes, prologue through epilogue.
    ///
    /// Grows with every heap extension and never shrinks.
    #[inline]
    #[must_use]
    pub fn managed_bytes(&self) -> usize {
        self.epilogue.addr() - self.prologue.addr()
    }

    /// Number of blocks currently on the free lists.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        for index in 0..LIST_COUNT {
            let mut cursor = self.free_lists.head(index);
            while let Some(block) = cursor {
                count += 1;
                // Safety: listed blocks are live free blocks of this heap.
                cursor = unsafe { block.next_free() };
            }
        }
        count
    }

    /// Check every structural invariant of the heap.
    ///
    /// Walks the physical chain from prologue to epilogue, then every free
    /// list, and cross-checks the two views.
    ///
    /// # Errors
    /// The first violation found, as a [`VerifyError`]. A healthy heap
    /// returns `Ok(())`; anything else means allocator state has been
    /// corrupted (or a caller scribbled outside its payload).
    pub fn verify(&self) -> Result<(), VerifyError> {
        // Safety throughout: the walks only touch words between the
        // sentinels, and stop at the first inconsistency before using a
        // suspect size for further arithmetic.
        unsafe {
            let sentinel = BlockTag::sentinel().into_bits();
            if self.prologue.tag().into_bits() != sentinel {
                return Err(VerifyError::BadSentinel {
                    at: self.prologue.addr(),
                });
            }
            if self.epilogue.tag().into_bits() != sentinel {
                return Err(VerifyError::BadSentinel {
                    at: self.epilogue.addr(),
                });
            }

            let walked = self.verify_physical()?;
            let listed = self.verify_lists(walked)?;
            if listed != walked {
                return Err(VerifyError::CountMismatch { listed, walked });
            }
            Ok(())
        }
    }

    /// Physical pass: contiguity, sizes, tags, and the no-adjacent-free
    /// rule. Returns the number of free blocks seen.
    unsafe fn verify_physical(&self) -> Result<usize, VerifyError> {
        unsafe {
            let end = self.epilogue.addr();
            let mut block = Block::from_header(self.prologue.header().wrapping_add(WORD));
            let mut free_blocks = 0;
            // The prologue cannot merge with anything.
            let mut prev_coalescable = false;

            while block != self.epilogue {
                let at = block.addr();
                let tag = block.tag();
                let size = tag.size();

                if size < MIN_BLOCK || !size.is_multiple_of(ALIGNMENT) {
                    return Err(VerifyError::BadBlockSize { at, size });
                }
                if !(at + WORD).is_multiple_of(ALIGNMENT) {
                    return Err(VerifyError::MisalignedBlock { at });
                }
                if at + size > end {
                    return Err(VerifyError::WalkEscaped { at });
                }

                if tag.allocated() {
                    prev_coalescable = false;
                } else {
                    free_blocks += 1;
                    if block.footer().into_bits() != tag.into_bits() {
                        return Err(VerifyError::TornTags { at });
                    }
                    if prev_coalescable && tag.coalescable() {
                        return Err(VerifyError::UncoalescedNeighbors { at });
                    }
                    prev_coalescable = tag.coalescable();
                }

                block = block.next_physical();
            }
            Ok(free_blocks)
        }
    }

    /// List pass: link integrity, bucket placement, and membership count.
    /// `walked` bounds each chain so a cycle cannot hang the check.
    unsafe fn verify_lists(&self, walked: usize) -> Result<usize, VerifyError> {
        unsafe {
            let mut listed = 0;
            for index in 0..LIST_COUNT {
                if let Some(head) = self.free_lists.head(index)
                    && head.prev_free().is_some()
                {
                    return Err(VerifyError::BadBackLink { at: head.addr() });
                }

                let mut cursor = self.free_lists.head(index);
                let mut chain_len = 0;
                while let Some(block) = cursor {
                    let at = block.addr();
                    chain_len += 1;
                    if chain_len > walked {
                        // More members than free blocks exist: a cycle or a
                        // double listing.
                        return Err(VerifyError::CountMismatch {
                            listed: listed + chain_len,
                            walked,
                        });
                    }
                    if at <= self.prologue.addr() || at >= self.epilogue.addr() {
                        return Err(VerifyError::WalkEscaped { at });
                    }
                    let tag = block.tag();
                    if tag.allocated() {
                        return Err(VerifyError::AllocatedOnList { at, index });
                    }
                    if index != 0 && find_list_index(tag.size()) != index {
                        return Err(VerifyError::WrongBucket {
                            at,
                            index,
                            expected: find_list_index(tag.size()),
                        });
                    }
                    if let Some(next) = block.next_free()
                        && next.prev_free() != Some(block)
                    {
                        return Err(VerifyError::BadBackLink { at: next.addr() });
                    }
                    cursor = block.next_free();
                }
                listed += chain_len;
            }
            Ok(listed)
        }
    }
}

/// A structural invariant violation found by [`Heap::verify`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// A sentinel header no longer reads as allocated-and-empty.
    #[error("sentinel tag overwritten at {at:#x}")]
    BadSentinel { at: usize },

    /// A block's size is below the minimum or not an alignment multiple.
    #[error("block at {at:#x} has invalid size {size}")]
    BadBlockSize { at: usize, size: usize },

    /// A block's payload would not be alignment-aligned.
    #[error("block at {at:#x} is misaligned")]
    MisalignedBlock { at: usize },

    /// The physical walk stepped past the epilogue, or a listed block lies
    /// outside the managed region.
    #[error("walk escapes the managed region at {at:#x}")]
    WalkEscaped { at: usize },

    /// A free block's header and footer disagree.
    #[error("free block at {at:#x} has header and footer out of sync")]
    TornTags { at: usize },

    /// Two adjacent coalescable free blocks survived an operation.
    #[error("adjacent coalescable free blocks at {at:#x}")]
    UncoalescedNeighbors { at: usize },

    /// A block marked allocated is linked on a free list.
    #[error("allocated block at {at:#x} linked on free list {index}")]
    AllocatedOnList { at: usize, index: usize },

    /// A block sits on a segregated list that does not match its size.
    #[error("block at {at:#x} filed in bucket {index} but sized for bucket {expected}")]
    WrongBucket {
        at: usize,
        index: usize,
        expected: usize,
    },

    /// A doubly-linked-list back link does not point where it must.
    #[error("free-list back link broken at {at:#x}")]
    BadBackLink { at: usize },

    /// The lists and the physical walk disagree about how many free blocks
    /// exist.
    #[error("{listed} listed free blocks but {walked} in the physical walk")]
    CountMismatch { listed: usize, walked: usize },
}
