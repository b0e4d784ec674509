//! `mmap()` regions that unmap themselves once nothing refers to them anymore.
//!
//! A [`MappedRegion`] owns a range of pages (its [`Carrier`]) and lays a
//! mapping over them with `MAP_FIXED`. Dropping the region replaces that
//! mapping with plain anonymous memory, exactly once, and only then gives the
//! pages back. Share a region with [`MappedRegion::into_shared()`] and it goes
//! away with the last clone.
//!
//! ```no_run
//! use std::fs::File;
//!
//! let file = File::open("/bin/sh")?;
//! let region = unsafe { gcmmap::MapOptions::new().map_file(&file)? };
//! assert_eq!(gcmmap::active_count(), 1);
//! drop(region);
//! assert_eq!(gcmmap::active_count(), 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod accounting;
pub mod alloc;
pub mod error;
pub mod options;
pub mod os;
pub mod region;
mod util;

pub use accounting::{active_bytes, active_count};
pub use alloc::{Carrier, Reservation, TrackedBuffer};
pub use error::{Error, Result};
pub use options::MapOptions;
pub use os::{
    mem::{Backing, MapFlags, Protection},
    page::page_size,
};
pub use region::{establish_mapping, MappedRegion, SharedRegion};
