//! Process-wide count of live mappings.
//!
//! Both counters start at zero, go up when a region is established and back
//! down when it is reclaimed. They are never reset. They're here so that tests
//! and diagnostics can see whether mappings are actually being released;
//! don't make decisions based on them.

use std::sync::atomic::{AtomicUsize, Ordering};

static ACCOUNTING: Accounting = Accounting::new();

pub struct Accounting {
    count: AtomicUsize,
    bytes: AtomicUsize,
}

/// A reading of both counters. The two loads are independent, so with other
/// threads mapping and unmapping the pair may never have existed at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub count: usize,
    pub bytes: usize,
}

impl Accounting {
    const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }

    /// The one and only [`Accounting`]
    pub fn global() -> &'static Accounting {
        &ACCOUNTING
    }

    pub fn active_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn active_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            count: self.active_count(),
            bytes: self.active_bytes(),
        }
    }

    pub(crate) fn established(&self, mapped_len: usize) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(mapped_len, Ordering::AcqRel);
    }

    pub(crate) fn reclaimed(&self, mapped_len: usize) {
        let count = self.count.fetch_sub(1, Ordering::AcqRel);
        let bytes = self.bytes.fetch_sub(mapped_len, Ordering::AcqRel);
        debug_assert!(count >= 1 && bytes >= mapped_len, "accounting underflow");
    }
}

/// Number of mappings that have been established and not yet reclaimed
pub fn active_count() -> usize {
    ACCOUNTING.active_count()
}

/// Sum of the page-rounded lengths of all live mappings
pub fn active_bytes() -> usize {
    ACCOUNTING.active_bytes()
}

pub fn snapshot() -> Snapshot {
    ACCOUNTING.snapshot()
}
