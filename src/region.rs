use std::{fmt, ops::Deref, ptr::NonNull, slice, sync::Arc};

use crate::{
    accounting::Accounting,
    alloc::{Carrier, Reservation},
    error::{fatal, Error, Result},
    os::{
        mem::{self, Backing, MapFlags, Protection},
        page::{align_ptr_up, checked_page_round, page_size},
    },
    util::{assert::aligned_to, hint::cold},
};

/// A region shared between several owners. The mapping is undone when the
/// last clone is dropped.
pub type SharedRegion<C = Reservation> = Arc<MappedRegion<C>>;

/// A mapping laid over a page-aligned part of a carrier `C`, which the region
/// owns.
///
/// The region is the only handle to the mapping. When it is dropped, the
/// mapped range is replaced with fresh anonymous memory (so the backing file
/// is no longer referenced), the global accounting is updated, and only then
/// is the carrier released. There is no way to unmap a region that is still
/// reachable, and no way to unmap it twice.
pub struct MappedRegion<C: Carrier = Reservation> {
    ptr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
    backing: Backing,
    prot: Protection,
    flags: MapFlags,
    // Dropped after `Drop::drop()` has undone the mapping
    carrier: C,
}

// SAFETY: the region owns its pages exclusively, just like `Box<[u8]>`, and
// only hands out references through `&self`/`&mut self`.
unsafe impl<C: Carrier + Send> Send for MappedRegion<C> {}
unsafe impl<C: Carrier + Sync> Sync for MappedRegion<C> {}

impl<C: Carrier> MappedRegion<C> {
    /// Map `len` bytes of `backing` with `prot` and `flags` (`MAP_FIXED` is
    /// added for you). The returned region is exactly `len` bytes long; the
    /// mapping itself covers whole pages.
    ///
    /// # Errors
    /// - [`Error::ZeroLength`] if `len == 0`
    /// - [`Error::LengthOverflow`] if `len` can't be rounded to a page
    /// - [`Error::Map`] with the OS error if `mmap()` fails. Nothing is leaked
    ///   and the accounting is untouched.
    ///
    /// # Aborts
    /// If the OS places the mapping anywhere but where it was told to.
    ///
    /// # Safety
    /// For file backings, the file must not be truncated below
    /// `offset + len` while the region is alive (touching pages past the end
    /// of a file is `SIGBUS`), and the caller must be fine with the bytes
    /// changing underneath them if something else writes to the file.
    ///
    /// If `prot` doesn't contain [`Protection::READ`], the region must not be
    /// read through [`as_slice()`](Self::as_slice) or `Deref`.
    pub unsafe fn establish(
        backing: Backing,
        len: usize,
        prot: Protection,
        flags: MapFlags,
    ) -> Result<Self> {
        if len == 0 {
            return Err(Error::ZeroLength);
        }
        let mapped_len = checked_page_round(len).ok_or(Error::LengthOverflow { len })?;

        let carrier = C::acquire(len)?;
        let (aligned, skip) = align_ptr_up(carrier.base().as_ptr());
        debug_assert!(carrier.capacity() - skip >= mapped_len);
        // SAFETY: `aligned` is `base + skip`, inside a live allocation
        let aligned = unsafe { NonNull::new_unchecked(aligned) };

        // SAFETY: the carrier owns `[aligned, aligned + mapped_len)` and we
        // haven't given out any references into it.
        let addr = match unsafe { mem::map_fixed(aligned, mapped_len, prot, flags, backing) } {
            Ok(addr) => addr,
            Err(source) => {
                return Err(cold(|| {
                    log::debug!("mmap({backing}, {len}) failed: {source}");
                    Error::Map { backing, len, source }
                }))
            }
        };
        if addr != aligned.as_ptr() {
            fatal(format_args!(
                "mmap() with MAP_FIXED chose {addr:p} instead of {aligned:p} ({backing}, len = {len})"
            ));
        }

        Accounting::global().established(mapped_len);
        log::trace!("established {backing} at {aligned:p}, len = {len} ({mapped_len} mapped)");

        Ok(Self {
            ptr: aligned,
            len,
            mapped_len,
            backing,
            prot,
            flags,
            carrier,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Exactly the length that was asked for
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: zero-length regions are refused.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// [`len()`](Self::len) rounded up to whole pages. This is how much the
    /// region contributes to [`active_bytes()`](crate::active_bytes).
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn protection(&self) -> Protection {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// The mapped bytes. Regions from the safe constructors are always
    /// readable; for [`establish()`](Self::establish) see its `# Safety`.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `[ptr, ptr + len)` is mapped for as long as `self` is alive
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, or `None` if the region wasn't mapped writable
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.prot.contains(Protection::WRITE) {
            return None;
        }
        // SAFETY: as for `as_slice()`, and `&mut self` makes it unique
        Some(unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Write any changes back to the backing file and wait until that's done.
    /// Only does anything interesting for `MAP_SHARED` file mappings.
    pub fn flush(&self) -> Result<()> {
        mem::sync(self.ptr, self.mapped_len).map_err(|source| Error::Flush { source })
    }

    pub fn into_shared(self) -> SharedRegion<C> {
        Arc::new(self)
    }
}

impl MappedRegion<Reservation> {
    /// `len` bytes of private, zeroed memory
    ///
    /// # Errors
    /// [`Error::Unreadable`] if `prot` lacks [`Protection::READ`], on top of
    /// everything [`establish()`](Self::establish) can return.
    pub fn anonymous(len: usize, prot: Protection) -> Result<Self> {
        require_readable(prot)?;
        // SAFETY: private anonymous memory can't change under us or be
        // truncated, and it's readable
        unsafe { Self::establish(Backing::Anonymous, len, prot, MapFlags::PRIVATE) }
    }
}

impl<C: Carrier> Drop for MappedRegion<C> {
    fn drop(&mut self) {
        let (aligned, _) = align_ptr_up(self.carrier.base().as_ptr());
        debug_assert_eq!(aligned, self.ptr.as_ptr());
        debug_assert!(aligned_to(aligned, page_size()));

        // SAFETY:
        // - the range belongs to our carrier, which is still alive
        // - we are being dropped, so no references into it remain
        match unsafe { mem::remap_anonymous(self.ptr, self.mapped_len) } {
            Ok(addr) if addr == self.ptr.as_ptr() => {}
            Ok(addr) => fatal(format_args!(
                "mmap() with MAP_FIXED chose {addr:p} instead of {:p} while undoing {}",
                self.ptr, self.backing
            )),
            Err(err) => fatal(format_args!(
                "undoing {} at {:p} (len = {}) failed: {err}",
                self.backing, self.ptr, self.mapped_len
            )),
        }

        Accounting::global().reclaimed(self.mapped_len);
        log::trace!("reclaimed {} at {:p}", self.backing, self.ptr);
    }
}

impl<C: Carrier> Deref for MappedRegion<C> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<C: Carrier> AsRef<[u8]> for MappedRegion<C> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<C: Carrier> fmt::Debug for MappedRegion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("mapped_len", &self.mapped_len)
            .field("backing", &self.backing)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Safe constructors only give out regions that `Deref` can read
pub(crate) fn require_readable(prot: Protection) -> Result<()> {
    if prot.contains(Protection::READ) {
        Ok(())
    } else {
        Err(Error::Unreadable { prot })
    }
}

/// Map `len` bytes of `backing` into memory that is unmapped again when the
/// returned region is dropped. See [`MappedRegion::establish()`].
///
/// # Safety
/// See [`MappedRegion::establish()`].
pub unsafe fn establish_mapping(
    backing: Backing,
    len: usize,
    prot: Protection,
    flags: MapFlags,
) -> Result<MappedRegion> {
    // SAFETY: passed on to the caller
    unsafe { MappedRegion::establish(backing, len, prot, flags) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TrackedBuffer;

    #[test]
    fn anonymous_regions_are_zeroed_and_writable() {
        let mut region = MappedRegion::anonymous(100, Protection::READ | Protection::WRITE).unwrap();
        assert_eq!(region.len(), 100);
        assert_eq!(region.mapped_len(), page_size());
        assert!(region.iter().all(|&b| b == 0));

        let bytes = region.as_mut_slice().unwrap();
        bytes[0] = 1;
        bytes[99] = 2;
        assert_eq!((region[0], region[99]), (1, 2));
    }

    #[test]
    fn read_only_regions_refuse_mut_access() {
        let mut region = MappedRegion::anonymous(10, Protection::READ).unwrap();
        assert!(region.as_mut_slice().is_none());
    }

    #[test]
    fn heap_carried_regions_round_trip() {
        let mut region = unsafe {
            MappedRegion::<TrackedBuffer>::establish(
                Backing::Anonymous,
                3 * page_size() + 7,
                Protection::READ | Protection::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .unwrap();
        assert!(aligned_to(region.as_ptr(), page_size()));
        region.as_mut_slice().unwrap().fill(0x5a);
        assert!(region.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn zero_length_is_refused() {
        assert!(matches!(
            MappedRegion::anonymous(0, Protection::READ),
            Err(Error::ZeroLength)
        ));
    }

    #[test]
    fn unreadable_anonymous_regions_are_refused() {
        for prot in [Protection::empty(), Protection::EXEC, Protection::WRITE] {
            assert!(
                matches!(MappedRegion::anonymous(16, prot), Err(Error::Unreadable { prot: p }) if p == prot),
                "{prot:?}"
            );
        }
    }

    #[test]
    fn debug_does_not_dump_contents() {
        let region = MappedRegion::anonymous(1, Protection::READ).unwrap();
        let dbg = format!("{region:?}");
        assert!(dbg.starts_with("MappedRegion"));
        assert!(dbg.contains("len: 1"));
    }
}
