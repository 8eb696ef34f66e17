use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalFrame;

/// A single 32-bit x86 page directory or page table entry in raw bitfield form.
///
/// The directory and the second-level tables share this layout. Bit 9 is
/// one of the three bits the processor leaves to the operating system; the
/// kernel uses it to tag copy-on-write pages.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P`             | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (leaf only) |
/// | 7      | `PS` / `PAT`    | Large page in a PDE, PAT in a PTE |
/// | 8      | `G`             | Global (leaf only) |
/// | 9      | `COW`           | Copy-on-write (OS defined) |
/// | 10–11  | OS avail        | Reserved for OS use |
/// | 12–31  | `frame`         | Physical frame number |
///
/// ### Invariants kept by the page table manager
/// - A present entry names a frame whose reference count is at least one.
/// - `writable` and `copy_on_write` are never both set.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalFrame;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::user_rw().with_present(true).with_frame(PhysicalFrame::from_number(0x42));
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.frame().number(), 0x42);
/// assert_eq!(e.into_bits(), 0x0004_2007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Never set by this kernel.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// Copy-on-write (bit 9, OS available).
    ///
    /// The frame is shared with at least one other address space; a write
    /// must fault and be resolved with a private copy.
    pub copy_on_write: bool,

    /// Remaining OS-available bits (10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_bits: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.frame_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalFrame) -> Self {
        self.with_frame_bits(frame.number())
    }

    /// The permission/status bits without the frame number.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> Self {
        self.with_frame_bits(0)
    }

    /// Writable, user-accessible permission set for fresh user pages.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_writable(true).with_user_access(true)
    }

    /// Permission bits a directory entry gets when it names a user table.
    ///
    /// Generous on purpose: the leaf entries restrict access further.
    #[inline]
    #[must_use]
    pub const fn table_link(frame: PhysicalFrame) -> Self {
        Self::user_rw().with_present(true).with_frame(frame)
    }

    /// Present, user-accessible, read-only and tagged copy-on-write.
    ///
    /// `self` keeps all other bits.
    #[inline]
    #[must_use]
    pub const fn downgraded_to_cow(self) -> Self {
        self.with_writable(false).with_copy_on_write(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_bit_is_os_bit_nine() {
        assert_eq!(PageEntryBits::new().with_copy_on_write(true).into_bits(), 1 << 9);
    }

    #[test]
    fn downgrade_clears_write_and_keeps_frame() {
        let e = PageEntryBits::table_link(PhysicalFrame::from_number(7)).downgraded_to_cow();
        assert!(e.present());
        assert!(!e.writable());
        assert!(e.copy_on_write());
        assert!(e.user_access());
        assert_eq!(e.frame().number(), 7);
    }

    #[test]
    fn flags_strip_frame() {
        let e = PageEntryBits::user_rw().with_present(true).with_frame(PhysicalFrame::from_number(0xABCDE));
        assert_eq!(e.flags().into_bits(), 0x7);
    }
}
