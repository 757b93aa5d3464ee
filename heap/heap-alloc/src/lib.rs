//! # Segregated-Fit Heap with Deferred Coalescing
//!
//! A classical dynamic memory allocator over a single contiguous data
//! segment that only ever grows, in the manner of a Unix program break. It
//! serves the four canonical operations (allocate, release, zeroed
//! allocate, resize) and aligns every payload to twice the machine word.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Public operations (Heap)                    │
//! │   allocate / release / allocate_zeroed / resize      │
//! └────────────────┬─────────────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────────────┐
//! │          Search, split, coalesce, extend             │
//! │   unsorted-list sweep → segregated scan → grow       │
//! └────────────────┬─────────────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────────────┐
//! │          Free lists and boundary tags                │
//! │   75 LIFO lists; header/footer words (BlockTag)      │
//! └────────────────┬─────────────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────────────┐
//! │          Program break (heap-brk)                    │
//! │   advance-only segment growth, e.g. ArenaBreak       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The managed region is bracketed by two zero-size, permanently allocated
//! sentinel blocks; physical-neighbor walks read boundary tags and stop at
//! the sentinels without ever branching on a region edge.
//!
//! Free blocks are filed on one of 75 doubly-linked lists:
//!
//! | List    | Holds |
//! |---------|-------|
//! | 0       | the *unsorted list*: every freshly released block |
//! | 1..=62  | one exact size each, 8-byte steps up to 504 bytes |
//! | 63..=74 | doubling ranges from 512 bytes up; 74 absorbs the rest |
//!
//! Releasing coalesces with the physical neighbors and pushes the result
//! onto the unsorted list. The next search drains that list, coalescing
//! again and filing blocks into their buckets, so merge work rides along
//! with allocation and the most recently freed memory is reused first.
//!
//! ## Concurrency
//!
//! None. Every operation takes `&mut self`; there are no locks and no
//! atomics. One heap is one single-threaded arena.
//!
//! ## Example
//!
//! ```rust
//! use heap_alloc::{ALIGNMENT, ArenaBreak, Heap};
//!
//! let region = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
//! let mut heap = Heap::new(ArenaBreak::from_static(region)).unwrap();
//!
//! let p = heap.allocate(100);
//! assert!(!p.is_null());
//! assert_eq!(p as usize % ALIGNMENT, 0);
//! unsafe { heap.release(p) };
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod block;
mod free_list;
mod heap;
mod tag;
mod verify;

pub use heap::{AllocError, Heap};
pub use verify::VerifyError;

// The break provider lives in its own crate; re-exported so callers (and the
// test suite) need only one dependency.
pub use heap_brk::{ArenaBreak, BreakError, ProgramBreak};

/// Machine word size in bytes. Boundary tags and free-list links are single
/// words; payloads begin one word past the block header.
pub(crate) const WORD: usize = size_of::<u64>();

/// Alignment quantum: twice the machine word. Every payload address and
/// every block size is a multiple of this.
pub const ALIGNMENT: usize = 2 * WORD;

/// Smallest legal block: header, two free-list links, footer. Requests are
/// rounded up so that any block can later hold the free-block bookkeeping.
pub const MIN_BLOCK: usize = 4 * WORD;
