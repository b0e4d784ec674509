//! Thin wrappers around `mmap()` and friends. Nothing in here keeps any state;
//! ownership of the ranges these functions touch is tracked one level up.

use std::{
    fmt, io,
    mem::MaybeUninit,
    os::fd::RawFd,
    ptr::{self, NonNull},
};

use bitflags::bitflags;
use libc::{c_int, c_void, off_t, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE};

use crate::util::assert::aligned_to;

use super::page::page_size;

bitflags! {
    /// `PROT_*` bits for a mapping. The empty set is `PROT_NONE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Protection: c_int {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    /// `MAP_*` bits for a mapping. Exactly one of `SHARED` or `PRIVATE` should
    /// be set. Bits without a name here are passed through to the OS as they
    /// are (use [`MapFlags::from_bits_retain()`]), except for `MAP_FIXED`,
    /// which is always added, and `MAP_ANONYMOUS`, which follows the
    /// [`Backing`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: c_int {
        const SHARED = libc::MAP_SHARED;
        const PRIVATE = libc::MAP_PRIVATE;
        const NORESERVE = libc::MAP_NORESERVE;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const POPULATE = libc::MAP_POPULATE;

        const _ = !0;
    }
}

/// What a mapping is backed by
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Bytes `[offset, offset + len)` of an open file. `offset` must be a
    /// multiple of the page size, or the OS will reject the mapping.
    File { fd: RawFd, offset: u64 },
    /// Zero-filled memory with nothing behind it
    Anonymous,
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::File { fd, offset } => write!(f, "fd {fd} @ {offset}"),
            Backing::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Keep calling `mmap()` until it stops reporting `EINTR`. Anything else is
/// returned as is.
fn retry_interrupted<F>(mut call: F) -> io::Result<*mut u8>
where
    F: FnMut() -> *mut c_void,
{
    loop {
        let addr = call();
        if addr != MAP_FAILED {
            return Ok(addr as *mut u8);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        log::trace!("mmap() interrupted, retrying");
    }
}

/// `mmap()` `backing` at exactly `addr`, replacing whatever is mapped there.
/// Returns the address the OS actually used, which the caller must check.
///
/// # Safety
/// - `[addr, addr + len)` must be owned by the caller, and nothing may hold a
///   reference into it. Whatever was mapped there is gone once this returns
///   `Ok`.
pub(crate) unsafe fn map_fixed(
    addr: NonNull<u8>,
    len: usize,
    prot: Protection,
    flags: MapFlags,
    backing: Backing,
) -> io::Result<*mut u8> {
    debug_assert!(aligned_to(addr.as_ptr(), page_size()));
    debug_assert!(len > 0);

    let (fd, offset, anon) = match backing {
        Backing::File { fd, offset } => {
            // The kernel says the same thing for offsets it can't represent
            let offset = off_t::try_from(offset)
                .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
            (fd, offset, 0)
        }
        Backing::Anonymous => (-1, 0, MAP_ANONYMOUS),
    };
    let flags = flags.bits() | anon | MAP_FIXED;

    retry_interrupted(|| {
        // SAFETY: `MAP_FIXED` only ever touches `[addr, addr + len)`, which the
        // caller has handed over to us.
        unsafe { libc::mmap(addr.as_ptr().cast(), len, prot.bits(), flags, fd, offset) }
    })
}

/// Overwrite `[addr, addr + len)` with fresh private read/write memory. This
/// is how a mapping is undone without giving the range back to the OS.
///
/// # Safety
/// Same as [`map_fixed()`].
pub(crate) unsafe fn remap_anonymous(addr: NonNull<u8>, len: usize) -> io::Result<*mut u8> {
    // SAFETY: passed on to the caller
    unsafe {
        map_fixed(
            addr,
            len,
            Protection::READ | Protection::WRITE,
            MapFlags::PRIVATE,
            Backing::Anonymous,
        )
    }
}

/// `mmap()` a read/write, page-aligned range of `len` bytes somewhere the OS
/// likes. No swap is reserved for it.
pub(crate) fn map_noreserve(len: usize) -> io::Result<NonNull<u8>> {
    debug_assert!(len > 0);
    let addr = retry_interrupted(|| {
        // SAFETY: no `MAP_FIXED`, so this can't clobber anything
        unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        }
    })?;
    NonNull::new(addr).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
}

/// # Safety
/// - `[addr, addr + len)` must have been mapped by us and nothing may
///   reference it anymore
pub(crate) unsafe fn unmap(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: passed on to the caller
    if unsafe { libc::munmap(addr.as_ptr().cast(), len) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Write dirty pages in `[addr, addr + len)` back to their file and wait for it
pub(crate) fn sync(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: `msync()` doesn't read or write through the pointer from our
    // point of view, and reports `ENOMEM` for ranges that aren't mapped.
    if unsafe { libc::msync(addr.as_ptr().cast(), len, libc::MS_SYNC) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Size in bytes of whatever `fd` refers to
pub(crate) fn fd_len(fd: RawFd) -> io::Result<u64> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `fstat()` fully initializes `stat` when it returns 0
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    u64::try_from(stat.st_size).map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_noreserve_is_page_aligned_and_writable() {
        let len = 3 * page_size();
        let addr = map_noreserve(len).expect("mmap() failed");
        assert!(aligned_to(addr.as_ptr(), page_size()));
        unsafe {
            addr.as_ptr().write_bytes(0xab, len);
            assert_eq!(*addr.as_ptr().add(len - 1), 0xab);
            unmap(addr, len).expect("munmap() failed");
        }
    }

    #[test]
    fn remap_anonymous_zeroes_the_range_in_place() {
        let len = 2 * page_size();
        let addr = map_noreserve(len).unwrap();
        unsafe {
            addr.as_ptr().write_bytes(0xcd, len);
            let got = remap_anonymous(addr, len).unwrap();
            assert_eq!(got, addr.as_ptr());
            assert_eq!(*addr.as_ptr(), 0);
            assert_eq!(*addr.as_ptr().add(len - 1), 0);
            unmap(addr, len).unwrap();
        }
    }

    #[test]
    fn map_fixed_reports_bad_descriptors_verbatim() {
        let len = page_size();
        let addr = map_noreserve(len).unwrap();
        let err = unsafe {
            map_fixed(
                addr,
                len,
                Protection::READ,
                MapFlags::SHARED,
                Backing::File { fd: -1, offset: 0 },
            )
        }
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        unsafe { unmap(addr, len).unwrap() };
    }

    #[test]
    fn unnamed_map_flags_survive() {
        let flags = MapFlags::from_bits_retain(libc::MAP_SHARED | 0x4000_0000);
        assert_eq!(flags.bits(), libc::MAP_SHARED | 0x4000_0000);
    }

    #[test]
    fn backing_display() {
        assert_eq!(Backing::File { fd: 3, offset: 4096 }.to_string(), "fd 3 @ 4096");
        assert_eq!(Backing::Anonymous.to_string(), "anonymous");
    }
}
