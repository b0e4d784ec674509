use std::{fmt, io, os::fd::RawFd, process};

use crate::os::mem::{Backing, Protection};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong with a mapping, short of the things that can't
/// be allowed to go wrong at all (those abort, see `fatal()`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// We don't hand out empty mappings
    #[error("refusing to map 0 bytes")]
    ZeroLength,

    /// `len` plus the alignment slack doesn't fit in the address space
    #[error("cannot map {len} bytes: length overflows the address space")]
    LengthOverflow { len: usize },

    /// Safe constructors only hand out regions that can be read
    #[error("refusing to map without PROT_READ ({prot:?})")]
    Unreadable { prot: Protection },

    /// `mmap()` said no. `source` is exactly what the OS reported.
    #[error("mmap({backing}, len = {len}) failed: {source}")]
    Map {
        backing: Backing,
        len: usize,
        #[source]
        source: io::Error,
    },

    /// `fstat()` on the file to be mapped said no
    #[error("fstat(fd {fd}) failed: {source}")]
    Stat {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// `msync()` said no
    #[error("msync() failed: {source}")]
    Flush {
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The errno behind this error, if the OS produced one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Map { source, .. } | Error::Stat { source, .. } | Error::Flush { source } => {
                source.raw_os_error()
            }
            Error::ZeroLength | Error::LengthOverflow { .. } | Error::Unreadable { .. } => None,
        }
    }
}

/// Log `args` and abort the process. Used when the address space is no longer
/// in a state we can describe: a `MAP_FIXED` mapping that landed elsewhere, or
/// an undo mapping that failed.
///
/// Not a `panic!()`: a caught panic would leave the dangling mapping in place.
#[cold]
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("{args}");
    eprintln!("gcmmap: fatal: {args}");
    process::abort()
}
