use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::{
    error::{Error, Result},
    os::page::page_size,
    util::num::checked_round_up,
};

use super::Carrier;

/// A plain global-allocator buffer, big enough that a page-aligned run of the
/// requested length fits inside it wherever the allocator happens to put it.
///
/// ```plaintext
/// +------------------+ <- base()          (anywhere)
/// | skip             |   < 1 page
/// +------------------+ <- page boundary
/// | mapped pages     |   page_round(len)
/// +------------------+
/// | leftover slack   |
/// +------------------+ <- base() + capacity()
/// ```
pub struct TrackedBuffer {
    data: NonNull<u8>,
    layout: Layout,
}

// SAFETY: uniquely owned heap memory, same as `Box<[u8]>`
unsafe impl Send for TrackedBuffer {}
unsafe impl Sync for TrackedBuffer {}

/// `ceil((len + page) / page) * page`: `len` plus at least one whole page of
/// slack for alignment
pub fn container_len(len: usize, page: usize) -> Option<usize> {
    checked_round_up(len.checked_add(page)?, page)
}

// SAFETY:
// - the allocation never moves
// - it is ours until `dealloc()`, and the allocator keeps its own bookkeeping
//   outside of it
// - `skip < page`, and `container_len()` leaves a full page of slack on top of
//   `page_round(len)`
unsafe impl Carrier for TrackedBuffer {
    fn acquire(len: usize) -> Result<Self> {
        let size = container_len(len, page_size()).ok_or(Error::LengthOverflow { len })?;
        let layout = Layout::from_size_align(size, 1).map_err(|_| Error::LengthOverflow { len })?;
        // SAFETY: `size` is at least one page, so never zero. Contents are left
        // uninitialized, they're about to be mapped over anyway.
        let data = unsafe { alloc::alloc(layout) };
        let Some(data) = NonNull::new(data) else {
            alloc::handle_alloc_error(layout)
        };
        log::debug!("TrackedBuffer::acquire({len}): {size} bytes at {data:p}");
        Ok(Self { data, layout })
    }

    fn base(&self) -> NonNull<u8> {
        self.data
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `acquire()` with exactly this layout
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::page::{align_up, page_round};

    #[test]
    fn container_len_leaves_a_page_of_slack() {
        assert_eq!(container_len(1, 4096), Some(8192));
        assert_eq!(container_len(4096, 4096), Some(8192));
        assert_eq!(container_len(4097, 4096), Some(12288));
        assert_eq!(container_len(10000, 4096), Some(16384));
        assert_eq!(container_len(usize::MAX - 100, 4096), None);
    }

    #[test]
    fn aligned_run_always_fits() {
        for len in [1, 100, 4095, 4096, 4097, 3 * 4096 + 1] {
            let buf = TrackedBuffer::acquire(len).unwrap();
            let (aligned, skip) = align_up(buf.base().as_ptr() as usize);
            assert_eq!(aligned % page_size(), 0);
            assert!(buf.capacity() - skip >= page_round(len), "len = {len}");
        }
    }

    #[test]
    fn huge_lengths_are_refused() {
        assert!(matches!(
            TrackedBuffer::acquire(usize::MAX),
            Err(Error::LengthOverflow { len: usize::MAX })
        ));
    }
}
