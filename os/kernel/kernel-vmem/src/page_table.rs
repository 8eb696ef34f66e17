//! # Two-level x86 page tables
//!
//! - [`PageDirectory`]: the root, 1024 entries indexed by [`DirIndex`].
//! - [`PageTable`]: a second-level table, 1024 entries indexed by [`TableIndex`].
//!
//! Both are 4 KiB-aligned and hold raw [`PageEntryBits`]. They carry no
//! policy; reference counting and table allocation live in
//! [`AddressSpace`](crate::AddressSpace).

use crate::PageEntryBits;
use kernel_memory_addresses::{DirIndex, ENTRIES_PER_TABLE, TableIndex};

/// The page directory (root): 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageDirectory {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

/// A second-level page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

impl PageDirectory {
    /// Create a fully zeroed directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: DirIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    /// Mutable access to a single entry.
    #[inline]
    pub const fn entry_mut(&mut self, i: TableIndex) -> &mut PageEntryBits {
        &mut self.entries[i.as_usize()]
    }

    /// Present entries with their indices.
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.present())
    }
}
