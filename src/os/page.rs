use std::sync::LazyLock;

use crate::util::num::{checked_round_up, round_up};

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(page_size::get);

/// The platform page size. Queried once, then cached.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Compute the first page boundary at or after `addr`.
///
/// Returns `(aligned, skip)` where `aligned == addr + skip` and
/// `skip == (page_size - addr % page_size) % page_size`, so an already aligned
/// address comes back unchanged with a `skip` of 0.
pub fn align_up(addr: usize) -> (usize, usize) {
    align_up_to(addr, page_size())
}

pub(crate) fn align_up_to(addr: usize, page: usize) -> (usize, usize) {
    let skip = (page - addr % page) % page;
    (addr + skip, skip)
}

/// [`align_up()`] for pointers. Keeps provenance.
pub fn align_ptr_up(ptr: *mut u8) -> (*mut u8, usize) {
    let (_, skip) = align_up(ptr as usize);
    (ptr.wrapping_add(skip), skip)
}

/// `len` rounded up to a whole number of pages
pub fn page_round(len: usize) -> usize {
    round_up(len, page_size())
}

/// `len` rounded up to a whole number of pages, `None` on overflow
pub fn checked_page_round(len: usize) -> Option<usize> {
    checked_round_up(len, page_size())
}
