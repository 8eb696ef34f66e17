use crate::{DIR_SHIFT, DirIndex, PAGE_SHIFT, PAGE_SIZE, TableIndex, VirtualPage, align_up};
use core::fmt;

/// Virtual memory address.
///
/// Carries the *kind* of address at the type level so that virtual and
/// physical values are never mixed up. No canonicality checks are performed.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x0000_2FFC);
/// assert_eq!(va.page().base().as_u32(), 0x2000);
/// assert_eq!(va.page_offset(), 0xFFC);
/// assert_eq!(va.round_up().unwrap().as_u32(), 0x3000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Compose the base address of the page selected by `dir` and `table`.
    #[inline]
    #[must_use]
    pub const fn from_indices(dir: DirIndex, table: TableIndex) -> Self {
        Self(((dir.as_usize() as u32) << DIR_SHIFT) | ((table.as_usize() as u32) << PAGE_SHIFT))
    }

    /// Page directory index (bits `[31:22]`).
    #[inline]
    #[must_use]
    pub const fn dir_index(self) -> DirIndex {
        DirIndex::new((self.0 >> DIR_SHIFT) as u16)
    }

    /// Page table index (bits `[21:12]`).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> TableIndex {
        TableIndex::new(((self.0 >> PAGE_SHIFT) & 0x3FF) as u16)
    }

    /// Offset within the 4 KiB page (bits `[11:0]`).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// The page containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing_address(self)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Round up to the next page boundary, `None` on 32-bit overflow.
    #[inline]
    #[must_use]
    pub const fn round_up(self) -> Option<Self> {
        match align_up(self.0, PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: u32) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#010x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<VirtualAddress> for u32 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.0
    }
}
