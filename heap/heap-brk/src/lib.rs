//! # Program-Break Abstraction
//!
//! The heap allocator in this workspace grows a single contiguous data
//! segment by advancing a *program break*: a pointer to the first byte past
//! the managed region. This crate defines that seam as a trait plus the one
//! provider shipped with the workspace, an owned-region bump pointer.
//!
//! ## Design outline
//! - [`ProgramBreak`] is the whole OS-facing surface: advance the break by
//!   `n` bytes and hand back the *previous* end. Advancing by zero queries
//!   the current end without side effects.
//! - [`ArenaBreak`] implements the trait over a caller-supplied region. The
//!   break moves monotonically towards the region's end and is never given
//!   back; that matches the segment semantics the allocator is built for.
//! - Hosted platforms that want the real process break can implement
//!   [`ProgramBreak`] over it in a few lines; nothing here assumes an OS.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod arena;

pub use arena::ArenaBreak;

use core::ptr::NonNull;

/// Interface to the primitive that grows the managed data segment.
///
/// Implementations hand out raw memory; they never inspect or retain it.
/// The segment must be contiguous: two consecutive successful calls return
/// ends exactly `increment` bytes apart.
pub trait ProgramBreak {
    /// Advance the end of the data segment by `increment` bytes and return
    /// the **previous** end.
    ///
    /// An `increment` of zero queries the current end without changing
    /// anything.
    ///
    /// # Errors
    /// [`BreakError::Exhausted`] if the segment cannot supply `increment`
    /// more bytes. The break is unchanged on failure.
    fn advance(&mut self, increment: usize) -> Result<NonNull<u8>, BreakError>;
}

/// Failure to move the program break.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakError {
    /// The backing segment cannot supply the requested number of bytes.
    #[error("data segment exhausted")]
    Exhausted,
}
