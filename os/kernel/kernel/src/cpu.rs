//! Per-CPU state the memory core needs: identity, the faulting address
//! latched at trap entry, and the loaded page directory.

use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_vmem::TranslationCache;
use log::trace;

#[derive(Debug)]
pub struct Cpu {
    id: usize,
    fault_address: VirtualAddress,
    active_root: Option<PhysicalFrame>,
    invalidations: usize,
    activations: usize,
}

impl Cpu {
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            fault_address: VirtualAddress::zero(),
            active_root: None,
            invalidations: 0,
            activations: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Latch CR2. The trap entry stub calls this before interrupts are
    /// re-enabled, so a nested fault cannot overwrite it.
    #[inline]
    pub const fn latch_fault_address(&mut self, cr2: u32) {
        self.fault_address = VirtualAddress::new(cr2);
    }

    /// The address of the last page fault on this CPU.
    #[inline]
    #[must_use]
    pub const fn fault_address(&self) -> VirtualAddress {
        self.fault_address
    }

    /// Single-page invalidations issued so far.
    #[inline]
    #[must_use]
    pub const fn invalidations(&self) -> usize {
        self.invalidations
    }

    /// Directory switches (full flushes) issued so far.
    #[inline]
    #[must_use]
    pub const fn activations(&self) -> usize {
        self.activations
    }
}

impl TranslationCache for Cpu {
    fn active_root(&self) -> Option<PhysicalFrame> {
        self.active_root
    }

    fn activate(&mut self, root: PhysicalFrame) {
        trace!("cpu{}: cr3 <- {root}", self.id);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: `root` is the directory of a live address space that maps
        // the kernel half identically to every other space.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.base().as_u32(), options(nostack, preserves_flags));
        }
        self.active_root = Some(root);
        self.activations += 1;
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: invlpg has no memory effects beyond the TLB.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let _ = va;
        self.invalidations += 1;
    }
}
