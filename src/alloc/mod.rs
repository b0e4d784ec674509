//! Where the pages under a [`MappedRegion`](crate::MappedRegion) come from.

use std::ptr::NonNull;

use crate::error::Result;

pub mod reservation;
pub mod tracked;

pub use reservation::Reservation;
pub use tracked::TrackedBuffer;

/// An owned range of memory that a mapping can be laid over with `MAP_FIXED`.
///
/// # Safety
///
/// Implementors must guarantee that
/// - `base()` never changes for the lifetime of the carrier
/// - `[base(), base() + capacity())` is owned by the carrier and nobody else,
///   so it is fine to replace its pages out from under it (first with a
///   mapping, then with fresh anonymous memory) as long as that is undone
///   before the carrier is dropped
/// - after aligning `base()` up to a page boundary, at least
///   `page_round(len)` bytes remain, where `len` is what was passed to
///   `acquire()`
pub unsafe trait Carrier: Sized {
    /// Get a carrier with room for a page-aligned run of `len` bytes. The
    /// contents are unspecified. Running out of memory is not an error, it's
    /// `handle_alloc_error()`.
    fn acquire(len: usize) -> Result<Self>;

    fn base(&self) -> NonNull<u8>;

    fn capacity(&self) -> usize;
}
