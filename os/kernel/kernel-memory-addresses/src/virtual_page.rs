use crate::{PAGE_SIZE, VirtualAddress, align_down};
use core::fmt;

/// Page-aligned base of a 4 KiB virtual page.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// The page that contains `va`.
    #[inline]
    #[must_use]
    pub const fn containing_address(va: VirtualAddress) -> Self {
        Self(VirtualAddress::new(align_down(va.as_u32(), PAGE_SIZE)))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The page directly after this one, `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The page directly below this one, `None` for page zero.
    #[inline]
    #[must_use]
    pub const fn previous(self) -> Option<Self> {
        match self.0.checked_sub(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Iterate the pages covering `[start, end)`. `start` is rounded down.
    pub fn range(start: VirtualAddress, end: VirtualAddress) -> impl DoubleEndedIterator<Item = Self> {
        let first = align_down(start.as_u32(), PAGE_SIZE);
        let end = end.as_u32();
        (first..end)
            .step_by(PAGE_SIZE as usize)
            .map(|a| Self(VirtualAddress::new(a)))
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#010x})", self.0.as_u32())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(p: VirtualPage) -> Self {
        p.0
    }
}
