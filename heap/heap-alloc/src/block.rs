use crate::WORD;
use crate::tag::BlockTag;
use core::ptr::NonNull;

/// A block in the managed region, addressed by its header word.
///
/// ```text
/// free block:
/// +--------+--------+--------+~~~~~~~~~~~~~~~~~+--------+
/// | header |  next  |  prev  |     unused      | footer |
/// +--------+--------+--------+~~~~~~~~~~~~~~~~~+--------+
/// ^ header address            (size bytes total)
///
/// allocated block:
/// +--------+-----------------------------------+--------+
/// | header |          payload                  | (tail) |
/// +--------+-----------------------------------+--------+
///          ^ payload address = header + WORD
/// ```
///
/// The tail word of an allocated block is never part of the caller's payload
/// (capacity is `size - 2 * WORD`), so the footer slot stays writable at all
/// times and both physical-neighbor walks below work for allocated and free
/// blocks alike.
///
/// Two distinct link structures run over the same blocks: the *physical*
/// chain via size arithmetic and boundary tags ([`next_physical`],
/// [`prev_physical`]) and the *free-list* chain via the embedded link words
/// ([`next_free`], [`prev_free`]). They must never be mixed up.
///
/// [`next_physical`]: Block::next_physical
/// [`prev_physical`]: Block::prev_physical
/// [`next_free`]: Block::next_free
/// [`prev_free`]: Block::prev_free
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Block(NonNull<u8>);

/// Byte offset of the `next` free-list link from the header.
const NEXT_OFFSET: usize = WORD;
/// Byte offset of the `prev` free-list link from the header.
const PREV_OFFSET: usize = 2 * WORD;

impl Block {
    /// Wrap the header at `header`.
    ///
    /// # Safety
    /// `header` must be non-null. It is the caller's business that it really
    /// addresses a block header; the accessors below dereference it.
    #[inline]
    #[must_use]
    pub(crate) const unsafe fn from_header(header: *mut u8) -> Self {
        debug_assert!(!header.is_null());
        // Safety: non-null per the contract above.
        Self(unsafe { NonNull::new_unchecked(header) })
    }

    /// Recover the block from a payload pointer handed to a caller.
    ///
    /// # Safety
    /// `payload` must have been produced by [`Block::payload`] on a live
    /// block; anything else is the undefined programmer-error territory of
    /// the public contract.
    #[inline]
    #[must_use]
    pub(crate) const unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // Safety: payload sits one word past a live header, so the
        // subtraction stays inside the same region and non-null.
        unsafe { Self::from_header(payload.as_ptr().wrapping_sub(WORD)) }
    }

    /// The header address.
    #[inline]
    #[must_use]
    pub(crate) const fn header(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The header address as an integer, for ordering comparisons.
    #[inline]
    #[must_use]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The caller-visible payload, one word past the header.
    #[inline]
    #[must_use]
    pub(crate) const fn payload(self) -> NonNull<u8> {
        // Safety: one word past a non-null header cannot wrap to null; every
        // block is at least MIN_BLOCK bytes, so the payload is in bounds.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().wrapping_add(WORD)) }
    }

    /// Read the header tag.
    ///
    /// # Safety
    /// The header word must be initialized and owned by the allocator.
    #[inline]
    #[must_use]
    pub(crate) unsafe fn tag(self) -> BlockTag {
        // Safety: headers are word-aligned by construction.
        unsafe { self.header().cast::<BlockTag>().read() }
    }

    /// Overwrite the header tag. Does not touch the footer.
    ///
    /// # Safety
    /// As [`tag`](Self::tag).
    #[inline]
    pub(crate) unsafe fn set_tag(self, tag: BlockTag) {
        // Safety: headers are word-aligned by construction.
        unsafe { self.header().cast::<BlockTag>().write(tag) }
    }

    /// Block size in bytes.
    ///
    /// # Safety
    /// As [`tag`](Self::tag).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn size(self) -> usize {
        unsafe { self.tag().size() }
    }

    /// Whether the block is in use by a caller (or is a sentinel).
    ///
    /// # Safety
    /// As [`tag`](Self::tag).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn is_allocated(self) -> bool {
        unsafe { self.tag().allocated() }
    }

    /// Copy the header into the footer slot, the last word of the block.
    ///
    /// Every size or flag mutation on a regular block must end with this so
    /// that the upward neighbor's [`prev_footer`](Self::prev_footer) stays
    /// truthful. Sentinels have no footer; never call this on one.
    ///
    /// # Safety
    /// The block's whole extent must be owned by the allocator and span at
    /// least two words.
    #[inline]
    pub(crate) unsafe fn seal_footer(self) {
        unsafe {
            let tag = self.tag();
            // Heap extension briefly forms a header-and-footer-only stretch
            // block before it is absorbed, so two words is the floor here.
            debug_assert!(tag.size() >= 2 * WORD);
            let footer = self.header().wrapping_add(tag.size() - WORD);
            footer.cast::<BlockTag>().write(tag);
        }
    }

    /// Read the footer tag, the last word of the block.
    ///
    /// # Safety
    /// As [`seal_footer`](Self::seal_footer).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn footer(self) -> BlockTag {
        unsafe {
            let size = self.size();
            self.header().wrapping_add(size - WORD).cast::<BlockTag>().read()
        }
    }

    /// Write a new size, preserving the flag bits, and reseal the footer.
    ///
    /// # Safety
    /// As [`seal_footer`](Self::seal_footer); additionally the new extent
    /// `[header, header + size)` must be owned by the allocator.
    #[inline]
    pub(crate) unsafe fn set_size(self, size: usize) {
        unsafe {
            self.set_tag(self.tag().with_size(size));
            self.seal_footer();
        }
    }

    /// Turn this position into a sentinel: size zero, allocated, no footer.
    ///
    /// # Safety
    /// The header word must be owned by the allocator.
    #[inline]
    pub(crate) unsafe fn make_sentinel(self) {
        unsafe { self.set_tag(BlockTag::sentinel()) }
    }

    /// The next block in the raw address space.
    ///
    /// # Safety
    /// As [`tag`](Self::tag). The result is a real block only while the heap
    /// invariants hold (the epilogue sentinel stops every walk before the
    /// region edge).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn next_physical(self) -> Self {
        unsafe { Self::from_header(self.header().wrapping_add(self.size())) }
    }

    /// The footer of the physically preceding block.
    ///
    /// For the block right after the prologue this reads the prologue header
    /// instead, which carries the same allocated-and-empty shape as any
    /// sentinel footer would.
    ///
    /// # Safety
    /// As [`tag`](Self::tag); the word below the header must belong to the
    /// managed region, which the prologue sentinel guarantees.
    #[inline]
    #[must_use]
    pub(crate) unsafe fn prev_footer(self) -> BlockTag {
        unsafe { self.header().wrapping_sub(WORD).cast::<BlockTag>().read() }
    }

    /// The previous block in the raw address space, located via its footer.
    ///
    /// # Safety
    /// As [`prev_footer`](Self::prev_footer); only meaningful when that
    /// footer is coalescable (sentinels stop the walk before this is used
    /// on the region edge).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn prev_physical(self) -> Self {
        unsafe { Self::from_header(self.header().wrapping_sub(self.prev_footer().size())) }
    }

    /// The `next` free-list link.
    ///
    /// # Safety
    /// The block must be free and linked by
    /// [`FreeTable`](crate::free_list::FreeTable).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn next_free(self) -> Option<Self> {
        unsafe {
            let raw = self.header().add(NEXT_OFFSET).cast::<*mut u8>().read();
            NonNull::new(raw).map(Self)
        }
    }

    /// Store the `next` free-list link.
    ///
    /// # Safety
    /// As [`next_free`](Self::next_free).
    #[inline]
    pub(crate) unsafe fn set_next_free(self, next: Option<Self>) {
        unsafe {
            let raw = next.map_or(core::ptr::null_mut(), |block| block.header());
            self.header().add(NEXT_OFFSET).cast::<*mut u8>().write(raw);
        }
    }

    /// The `prev` free-list link.
    ///
    /// # Safety
    /// As [`next_free`](Self::next_free).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn prev_free(self) -> Option<Self> {
        unsafe {
            let raw = self.header().add(PREV_OFFSET).cast::<*mut u8>().read();
            NonNull::new(raw).map(Self)
        }
    }

    /// Store the `prev` free-list link.
    ///
    /// # Safety
    /// As [`next_free`](Self::next_free).
    #[inline]
    pub(crate) unsafe fn set_prev_free(self, prev: Option<Self>) {
        unsafe {
            let raw = prev.map_or(core::ptr::null_mut(), |block| block.header());
            self.header().add(PREV_OFFSET).cast::<*mut u8>().write(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A word-aligned scratch region with a block laid out at word 1.
    fn scratch() -> Box<[u64; 32]> {
        Box::new([0; 32])
    }

    fn block_at(region: &mut [u64; 32], word: usize) -> Block {
        unsafe { Block::from_header(region.as_mut_ptr().add(word).cast()) }
    }

    #[test]
    fn payload_sits_one_word_past_header() {
        let mut region = scratch();
        let block = block_at(&mut region, 1);
        assert_eq!(block.payload().as_ptr() as usize - block.addr(), WORD);
        let roundtrip = unsafe { Block::from_payload(block.payload()) };
        assert_eq!(roundtrip, block);
    }

    #[test]
    fn footer_mirrors_header() {
        let mut region = scratch();
        let block = block_at(&mut region, 1);
        unsafe {
            block.set_tag(BlockTag::new().with_allocated(true));
            block.set_size(4 * WORD);
        }
        // Footer is the last word of the 4-word block: words 1..=4, footer at 4.
        assert_eq!(region[4], region[1]);
        assert!(unsafe { block.is_allocated() });
        assert_eq!(unsafe { block.size() }, 4 * WORD);
    }

    #[test]
    fn physical_walk_crosses_adjacent_blocks() {
        let mut region = scratch();
        let first = block_at(&mut region, 1);
        unsafe {
            first.set_tag(BlockTag::new());
            first.set_size(4 * WORD);
            let second = first.next_physical();
            second.set_tag(BlockTag::new().with_allocated(true));
            second.set_size(6 * WORD);

            assert_eq!(second.addr() - first.addr(), 4 * WORD);
            // Walking back through the footer lands on the first header.
            assert_eq!(second.prev_footer().size(), 4 * WORD);
            assert!(second.prev_footer().coalescable());
            assert_eq!(second.prev_physical(), first);
        }
    }

    #[test]
    fn free_links_roundtrip() {
        let mut region = scratch();
        let a = block_at(&mut region, 1);
        let b = block_at(&mut region, 8);
        unsafe {
            a.set_next_free(Some(b));
            a.set_prev_free(None);
            b.set_prev_free(Some(a));
            b.set_next_free(None);

            assert_eq!(a.next_free(), Some(b));
            assert_eq!(a.prev_free(), None);
            assert_eq!(b.prev_free(), Some(a));
            assert_eq!(b.next_free(), None);
        }
    }
}
