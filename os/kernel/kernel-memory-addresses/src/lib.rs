//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses, page bases and
//! frame numbers used by the two-level x86 paging code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | A (page-table translated) virtual address. |
//! | [`VirtualPage`] | The page-aligned base of a 4 KiB virtual page. |
//! | [`PhysicalAddress`] | A physical byte address. |
//! | [`PhysicalFrame`] | A physical **frame number** (`address >> 12`). |
//!
//! Frame numbers and addresses are distinct types so that a reference count
//! table indexed by frame number can never be handed a virtual address.
//!
//! ## Address decomposition
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//! ```
//!
//! - [`DirIndex`] selects one of 1024 entries in the page directory.
//! - [`TableIndex`] selects one of 1024 entries in the second-level table.
//! - The low 12 bits select the byte within the 4 KiB page.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_3123);
//! assert_eq!(va.dir_index().as_usize(), 1);
//! assert_eq!(va.table_index().as_usize(), 3);
//! assert_eq!(va.page_offset(), 0x123);
//! assert_eq!(VirtualAddress::from_indices(va.dir_index(), va.table_index()).as_u32(), 0x0040_3000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always, clippy::cast_possible_truncation)]

mod physical_address;
mod physical_frame;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_frame::PhysicalFrame;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Bytes per page (and per physical frame).
pub const PAGE_SIZE: u32 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Shift of the directory index within a virtual address.
pub const DIR_SHIFT: u32 = 22;

/// Entries per page directory and per page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes of virtual memory covered by one second-level table.
pub const TABLE_SPAN: u32 = 1 << DIR_SHIFT;

/// Index into the page directory (virtual address bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

/// Index into a second-level page table (virtual address bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl DirIndex {
    /// Construct from a raw index.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All 1024 directory indices in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self)
    }
}

impl TableIndex {
    /// Construct from a raw index.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All 1024 table indices in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self)
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,    4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// Returns `None` if the aligned value does not fit into 32 bits.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,    4096), Some(0));
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
