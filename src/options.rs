use std::os::fd::AsRawFd;

use crate::{
    alloc::{Carrier, Reservation},
    error::{Error, Result},
    os::mem::{self, Backing, MapFlags, Protection},
    region::{require_readable, MappedRegion},
};

/// Builder for [`MappedRegion`]s, for when the defaults of
/// [`establish_mapping()`](crate::establish_mapping) are a bit bare.
///
/// Defaults to a read-only, `MAP_SHARED` view starting at offset 0, covering
/// the rest of the file.
#[derive(Clone, Copy, Debug)]
pub struct MapOptions {
    offset: u64,
    len: Option<usize>,
    prot: Protection,
    flags: MapFlags,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl MapOptions {
    pub const fn new() -> Self {
        Self {
            offset: 0,
            len: None,
            prot: Protection::READ,
            flags: MapFlags::SHARED,
        }
    }

    /// Where in the file the mapping starts. Must be page-aligned.
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = offset;
        self
    }

    /// How many bytes to map. Without this, file mappings run to the end of
    /// the file, and anonymous mappings fail with [`Error::ZeroLength`].
    pub fn len(&mut self, len: usize) -> &mut Self {
        self.len = Some(len);
        self
    }

    pub fn protection(&mut self, prot: Protection) -> &mut Self {
        self.prot = prot;
        self
    }

    pub fn flags(&mut self, flags: MapFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Shorthand for `protection(READ | WRITE)`
    pub fn writable(&mut self) -> &mut Self {
        self.protection(Protection::READ | Protection::WRITE)
    }

    /// Shorthand for `flags(PRIVATE)`: writes stay in this process
    pub fn copy_on_write(&mut self) -> &mut Self {
        self.flags(MapFlags::PRIVATE)
    }

    /// # Errors
    /// [`Error::Unreadable`] without [`Protection::READ`], [`Error::Stat`] if
    /// the file's length is needed and can't be had, and anything
    /// [`MappedRegion::establish()`] returns.
    ///
    /// # Safety
    /// See [`MappedRegion::establish()`].
    pub unsafe fn map_file<F: AsRawFd>(&self, file: &F) -> Result<MappedRegion> {
        // SAFETY: passed on to the caller
        unsafe { self.map_file_in(file) }
    }

    /// Like [`map_file()`](Self::map_file), but over a carrier of your choice
    ///
    /// # Safety
    /// See [`MappedRegion::establish()`].
    pub unsafe fn map_file_in<C: Carrier, F: AsRawFd>(&self, file: &F) -> Result<MappedRegion<C>> {
        require_readable(self.prot)?;
        let fd = file.as_raw_fd();
        let backing = Backing::File {
            fd,
            offset: self.offset,
        };
        let len = match self.len {
            Some(len) => len,
            None => {
                let file_len = mem::fd_len(fd).map_err(|source| Error::Stat { fd, source })?;
                let rest = file_len.saturating_sub(self.offset);
                usize::try_from(rest).map_err(|_| Error::LengthOverflow { len: usize::MAX })?
            }
        };
        // SAFETY: passed on to the caller
        unsafe { MappedRegion::establish(backing, len, self.prot, self.flags) }
    }

    /// Zeroed memory. Always private, whatever the flags say.
    ///
    /// # Errors
    /// [`Error::Unreadable`] without [`Protection::READ`], and anything
    /// [`MappedRegion::establish()`] returns.
    pub fn map_anonymous(&self) -> Result<MappedRegion> {
        self.map_anonymous_in::<Reservation>()
    }

    pub fn map_anonymous_in<C: Carrier>(&self) -> Result<MappedRegion<C>> {
        require_readable(self.prot)?;
        let flags = (self.flags - MapFlags::SHARED) | MapFlags::PRIVATE;
        // SAFETY: private anonymous memory can't be changed or truncated by
        // anyone else, and it's readable
        unsafe {
            MappedRegion::establish(Backing::Anonymous, self.len.unwrap_or(0), self.prot, flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{alloc::TrackedBuffer, os::page::page_size};

    fn scratch_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn length_defaults_to_the_rest_of_the_file() {
        let page = page_size();
        let contents: Vec<u8> = (0..2 * page + 10).map(|i| (i % 251) as u8).collect();
        let file = scratch_file(&contents);

        let whole = unsafe { MapOptions::new().map_file(file.as_file()) }.unwrap();
        assert_eq!(&whole[..], &contents[..]);

        let tail = unsafe { MapOptions::new().offset(page as u64).map_file(file.as_file()) }.unwrap();
        assert_eq!(&tail[..], &contents[page..]);
    }

    #[test]
    fn empty_files_are_zero_length() {
        let file = scratch_file(&[]);
        assert!(matches!(
            unsafe { MapOptions::new().map_file(file.as_file()) },
            Err(Error::ZeroLength)
        ));
    }

    #[test]
    fn copy_on_write_keeps_the_file_intact() {
        let file = scratch_file(b"hello, world");
        let mut region = unsafe {
            MapOptions::new()
                .writable()
                .copy_on_write()
                .map_file_in::<TrackedBuffer, _>(file.as_file())
        }
        .unwrap();
        region.as_mut_slice().unwrap()[..5].copy_from_slice(b"HELLO");
        assert_eq!(&region[..], b"HELLO, world");
        drop(region);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello, world");
    }

    #[test]
    fn anonymous_ignores_shared() {
        let region = MapOptions::new().len(10).map_anonymous().unwrap();
        assert!(region.flags().contains(MapFlags::PRIVATE));
        assert!(!region.flags().contains(MapFlags::SHARED));
    }

    #[test]
    fn unreadable_protections_are_refused() {
        for prot in [Protection::empty(), Protection::EXEC, Protection::WRITE] {
            let err = MapOptions::new().len(16).protection(prot).map_anonymous().unwrap_err();
            assert!(matches!(err, Error::Unreadable { .. }), "{err}");

            let err = MapOptions::new()
                .len(16)
                .protection(prot)
                .map_anonymous_in::<TrackedBuffer>()
                .unwrap_err();
            assert!(matches!(err, Error::Unreadable { .. }), "{err}");
        }

        let file = scratch_file(b"not for your eyes");
        let err = unsafe { MapOptions::new().protection(Protection::empty()).map_file(file.as_file()) }
            .unwrap_err();
        assert!(matches!(err, Error::Unreadable { .. }), "{err}");
    }

    struct BadFd;

    impl AsRawFd for BadFd {
        fn as_raw_fd(&self) -> std::os::fd::RawFd {
            -1
        }
    }

    #[test]
    fn failed_fstat_is_reported_as_such() {
        let err = unsafe { MapOptions::new().map_file(&BadFd) }.unwrap_err();
        assert!(matches!(err, Error::Stat { fd: -1, .. }), "{err}");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn anonymous_needs_a_length() {
        assert!(matches!(MapOptions::new().map_anonymous(), Err(Error::ZeroLength)));
    }
}
