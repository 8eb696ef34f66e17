//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, TABLE_SPAN, VirtualAddress};

/// First kernel virtual address; user memory is `[0, KERNBASE)`.
pub const KERNBASE: u32 = 0x8000_0000;

/// Start of extended memory (1 MiB). Below it lives the I/O hole.
pub const EXTMEM: u32 = 0x0010_0000;

/// Where the kernel image is linked.
pub const KERNLINK: u32 = KERNBASE + EXTMEM;

/// Top of physical memory the kernel manages.
pub const PHYSTOP: u32 = 0x0E00_0000;

/// Memory-mapped devices live from here to the top of the address space.
pub const DEVSPACE: u32 = 0xFE00_0000;

/// Virtual address of the kernel's writable data section.
///
/// # Kernel Build
/// Matches the `data` symbol of the kernel linker script.
pub const KERNEL_DATA: u32 = KERNLINK + 0x0010_0000;

/// Maximum size of a user stack in bytes, guard page excluded.
pub const MAX_STACK_SIZE: u32 = 16 * PAGE_SIZE;

/// Maximum number of arguments passed to a new program image.
pub const MAX_ARGS: usize = 32;

/// Bytes of a process name, terminator included.
pub const PROC_NAME_LEN: usize = 16;

const _: () = {
    assert!(KERNBASE.is_multiple_of(TABLE_SPAN));
    assert!(KERNEL_DATA.is_multiple_of(PAGE_SIZE));
    assert!(MAX_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNBASE as u64 + PHYSTOP as u64 <= DEVSPACE as u64);
};

/// One fixed mapping of the kernel half.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelRegion {
    /// First virtual address of the mapping.
    pub virt: VirtualAddress,
    /// First physical address backing it.
    pub phys_start: PhysicalAddress,
    /// Length of the mapping in bytes (page multiple).
    pub length: u32,
    /// Whether the kernel may write through the mapping.
    pub writable: bool,
}

/// Runtime memory layout.
///
/// [`MemoryLayout::STANDARD`] mirrors the compile-time constants. Hosts that
/// emulate a smaller machine construct their own value; every address space
/// built from the same layout shares the same kernel half.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Split between user and kernel space.
    pub kernel_base: u32,
    /// Size of the low physical I/O region.
    pub ext_mem: u32,
    /// Virtual start of the kernel's writable data.
    pub kernel_data: u32,
    /// Top of managed physical memory.
    pub phys_top: u32,
    /// Start of the device window.
    pub dev_space: u32,
    /// Maximum user stack size in bytes.
    pub max_stack_size: u32,
    /// Maximum number of program arguments.
    pub max_args: usize,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl MemoryLayout {
    pub const STANDARD: Self = Self {
        kernel_base: KERNBASE,
        ext_mem: EXTMEM,
        kernel_data: KERNEL_DATA,
        phys_top: PHYSTOP,
        dev_space: DEVSPACE,
        max_stack_size: MAX_STACK_SIZE,
        max_args: MAX_ARGS,
    };

    /// Link address of the kernel image.
    #[inline]
    #[must_use]
    pub const fn kernel_link(&self) -> u32 {
        self.kernel_base + self.ext_mem
    }

    /// Whether `va` belongs to the user half.
    #[inline]
    #[must_use]
    pub const fn is_user(&self, va: VirtualAddress) -> bool {
        va.as_u32() < self.kernel_base
    }

    /// Kernel virtual address to physical address for the direct map.
    #[inline]
    #[must_use]
    pub const fn v2p(&self, va: u32) -> u32 {
        va - self.kernel_base
    }

    /// The four fixed mappings shared by every address space.
    ///
    /// # Panics
    /// Panics if the direct map of physical memory would overlap the
    /// device window.
    #[must_use]
    pub fn kernel_regions(&self) -> [KernelRegion; 4] {
        assert!(
            u64::from(self.kernel_base) + u64::from(self.phys_top) <= u64::from(self.dev_space),
            "PHYSTOP too high"
        );
        let link = self.kernel_link();
        [
            KernelRegion {
                virt: VirtualAddress::new(self.kernel_base),
                phys_start: PhysicalAddress::new(0),
                length: self.ext_mem,
                writable: true,
            },
            KernelRegion {
                virt: VirtualAddress::new(link),
                phys_start: PhysicalAddress::new(self.v2p(link)),
                length: self.kernel_data - link,
                writable: false,
            },
            KernelRegion {
                virt: VirtualAddress::new(self.kernel_data),
                phys_start: PhysicalAddress::new(self.v2p(self.kernel_data)),
                length: self.phys_top - self.v2p(self.kernel_data),
                writable: true,
            },
            KernelRegion {
                virt: VirtualAddress::new(self.dev_space),
                phys_start: PhysicalAddress::new(self.dev_space),
                length: 0u32.wrapping_sub(self.dev_space),
                writable: true,
            },
        ]
    }
}
