use crate::block::Block;

/// Number of free lists: the unsorted list plus 74 size buckets.
pub(crate) const LIST_COUNT: usize = 75;

/// Largest block size served by the exact-size buckets.
///
/// Blocks up to this size land in a bucket holding exactly one size, so a
/// search can take any bucket head without checking it. Larger blocks fall
/// into power-of-two buckets and must be size-checked.
pub(crate) const MAX_SMALL: usize = 504;

/// Index of the unsorted list, the landing pad for every freshly freed block.
const UNSORTED: usize = 0;

/// Map a block size to its bucket.
///
/// - Sizes below 512 map to an exact bucket per 8-byte step:
///   `(size >> 3) - 1`.
/// - From 512 upward, buckets double: `[512, 1024)` maps to 63, `[2^10,
///   2^11)` to 64, and so on, with the final bucket absorbing everything the
///   ladder would push past it.
///
/// Never returns [`UNSORTED`]; the unsorted list is chosen explicitly on
/// insert, not by size.
#[inline]
pub(crate) fn find_list_index(size: usize) -> usize {
    if size < 512 {
        (size >> 3) - 1
    } else {
        let kib = size >> 10;
        // One-indexed position of the highest set bit; zero for sizes in [512, 1024).
        let rung = (usize::BITS - kib.leading_zeros()) as usize;
        usize::min(63 + rung, LIST_COUNT - 1)
    }
}

/// The table of free-list heads.
///
/// All lists are doubly linked through the link words embedded in their
/// member blocks and are maintained LIFO: inserts push at the head, so the
/// most recently filed block of a size is found first.
pub(crate) struct FreeTable {
    heads: [Option<Block>; LIST_COUNT],
}

impl FreeTable {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; LIST_COUNT],
        }
    }

    /// Head of the list at `index`.
    #[inline]
    #[must_use]
    pub(crate) const fn head(&self, index: usize) -> Option<Block> {
        self.heads[index]
    }

    /// Head of the unsorted list.
    #[inline]
    #[must_use]
    pub(crate) const fn unsorted_head(&self) -> Option<Block> {
        self.heads[UNSORTED]
    }

    /// File `block` as free: clear both flag bits, reseal the footer, and
    /// push it at the head of the unsorted list (if `unsorted`) or of the
    /// bucket matching its size.
    ///
    /// # Safety
    /// `block` must be a regular block owned by the allocator and currently
    /// on no list.
    pub(crate) unsafe fn insert(&mut self, block: Block, unsorted: bool) {
        unsafe {
            block.set_tag(block.tag().with_allocated(false).with_quick(false));
            block.seal_footer();

            let index = if unsorted {
                UNSORTED
            } else {
                find_list_index(block.size())
            };
            let old_head = self.heads[index];
            block.set_next_free(old_head);
            block.set_prev_free(None);
            if let Some(old_head) = old_head {
                old_head.set_prev_free(Some(block));
            }
            self.heads[index] = Some(block);
        }
    }

    /// Unlink `block` from whichever list holds it, mark it allocated, and
    /// reseal the footer.
    ///
    /// The block can only be on the unsorted list or on its size bucket. If
    /// it heads one of those lists the head is advanced; otherwise its back
    /// link is populated and an ordinary splice suffices, without ever
    /// knowing which list it was.
    ///
    /// # Safety
    /// `block` must be free and linked by a previous
    /// [`insert`](Self::insert).
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        unsafe {
            let bucket = find_list_index(block.size());
            if self.heads[bucket] == Some(block) || self.heads[UNSORTED] == Some(block) {
                let index = if self.heads[bucket] == Some(block) {
                    bucket
                } else {
                    UNSORTED
                };
                self.heads[index] = block.next_free();
                if let Some(new_head) = self.heads[index] {
                    new_head.set_prev_free(None);
                }
            } else {
                // Not a head, so the back link is populated.
                debug_assert!(block.prev_free().is_some());
                if let Some(prev) = block.prev_free() {
                    prev.set_next_free(block.next_free());
                }
            }
            if let Some(next) = block.next_free() {
                next.set_prev_free(block.prev_free());
            }

            block.set_tag(block.tag().with_allocated(true).with_quick(false));
            block.seal_footer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_BLOCK;

    #[test]
    fn exact_buckets_step_by_eight() {
        assert_eq!(find_list_index(MIN_BLOCK), 3);
        assert_eq!(find_list_index(40), 4);
        assert_eq!(find_list_index(64), 7);
        assert_eq!(find_list_index(MAX_SMALL), 62);
    }

    #[test]
    fn doubling_buckets_start_at_512() {
        assert_eq!(find_list_index(512), 63);
        assert_eq!(find_list_index(1023), 63);
        assert_eq!(find_list_index(1024), 64);
        assert_eq!(find_list_index(2047), 64);
        assert_eq!(find_list_index(2048), 65);
        assert_eq!(find_list_index(1 << 19), 73);
    }

    #[test]
    fn last_bucket_absorbs_the_rest() {
        assert_eq!(find_list_index(1 << 20), LIST_COUNT - 1);
        assert_eq!(find_list_index(1 << 22), LIST_COUNT - 1);
        assert_eq!(find_list_index(usize::MAX & !0xf), LIST_COUNT - 1);
    }
}
