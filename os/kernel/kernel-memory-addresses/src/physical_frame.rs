use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Physical frame **number**.
///
/// Opaque handle for one 4 KiB frame of physical memory. The frame
/// allocator hands these out, page table entries store them and the frame
/// reference table is indexed by them.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u32);

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn from_number(n: u32) -> Self {
        debug_assert!(n < (1 << (32 - PAGE_SHIFT)));
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    /// Frame number as a table index.
    #[inline]
    #[must_use]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// First byte of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {:#x}", self.0)
    }
}
