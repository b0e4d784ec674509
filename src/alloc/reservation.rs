use std::{alloc::Layout, ptr::NonNull};

use crate::{
    error::{fatal, Error, Result},
    os::{
        mem::{map_noreserve, unmap},
        page::{checked_page_round, page_size},
    },
};

use super::Carrier;

/// A page-aligned run of pages straight from the OS, used as nothing but a
/// placeholder for the mapping that goes on top of it. Returned with
/// `munmap()` on drop.
pub struct Reservation {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: uniquely owned, like `Box<[u8]>`
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

// SAFETY:
// - nobody but us knows where the reservation is, and the OS doesn't move it
// - it's already page-aligned (`skip == 0`) and exactly `page_round(len)` long
unsafe impl Carrier for Reservation {
    fn acquire(len: usize) -> Result<Self> {
        let size = checked_page_round(len).ok_or(Error::LengthOverflow { len })?;
        let layout =
            Layout::from_size_align(size, page_size()).map_err(|_| Error::LengthOverflow { len })?;
        let ptr = match map_noreserve(size) {
            Ok(ptr) => ptr,
            Err(err) => {
                log::error!("Reservation::acquire({len}): mmap() failed: {err}");
                std::alloc::handle_alloc_error(layout)
            }
        };
        log::debug!("Reservation::acquire({len}): {size} bytes at {ptr:p}");
        Ok(Self { ptr, size })
    }

    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn capacity(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size. It came from
        //   `mmap()` so it is.
        // - We own every page of `[ptr, ptr + size)` and nothing borrows them
        //   anymore, since we are being dropped.
        if let Err(err) = unsafe { unmap(self.ptr, self.size) } {
            fatal(format_args!(
                "munmap({:p}, {}) of a reservation failed: {err}",
                self.ptr, self.size
            ));
        }
    }
}
