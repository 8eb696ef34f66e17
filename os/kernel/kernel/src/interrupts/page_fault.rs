//! # Page fault resolution
//!
//! A user-mode fault is classified first and resolved second. The
//! classification is a pure function of the error code, the faulting
//! address, the stack pointer and the process's regions; the first matching
//! cause wins:
//!
//! | Order | Cause | Condition | Resolution |
//! |:------|:------|:----------|:-----------|
//! | 1 | [`FaultCause::CopyOnWrite`] | P+W+U error, entry present and COW | private copy, writable |
//! | 2 | [`FaultCause::LazyHeap`] | inside `[heap.start, heap.start + heap.size)`, not present | zero-filled page |
//! | 3 | [`FaultCause::StackGuard`] | write to the guard page by a push (`esp == addr + 4`) | stack grows one page |
//! | 4 | [`FaultCause::Invalid`] | anything else | kill |
//!
//! A guard page touch that would take the stack past its maximum size is
//! [`FaultCause::StackOverflow`] and kills the process as well.
//!
//! The alarm trampoline reuses [`resolve_fault`] to make the pages of its
//! continuation record writable before touching them.

use crate::proc::Process;
use crate::trap::TrapFrame;
use crate::{Cpu, Kernel};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress, VirtualPage};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MmArea, PageEntryBits, PhysMapper, PhysicalMemory, TranslationCache, VmError,
    invalidate_if_active,
};
use log::{error, trace};

/// Page-fault error code layout (i386).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    #[bits(28)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    /// Error code of a user-mode write, as the alarm trampoline issues it on
    /// behalf of the process.
    #[must_use]
    pub const fn user_write(present: bool) -> Self {
        Self::new().with_present(present).with_write(true).with_user(true)
    }
}

/// One fault to classify.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fault {
    pub addr: VirtualAddress,
    pub err: PageFaultError,
    /// User stack pointer at the faulting instruction. `None` when the
    /// kernel touches the page itself, which waives the push check.
    pub esp: Option<u32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultCause {
    CopyOnWrite,
    LazyHeap,
    StackGuard,
    StackOverflow,
    Invalid,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid access")]
    Invalid,
}

impl From<VmError> for FaultError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::OutOfMemory,
            VmError::StackLimit => Self::StackOverflow,
            _ => Self::Invalid,
        }
    }
}

/// Decide why `fault` happened. First match wins.
#[must_use]
pub fn classify(fault: &Fault, space: &AddressSpace, heap: &MmArea, stack: &MmArea, max_stack: u32) -> FaultCause {
    let entry = space.entry(fault.addr).unwrap_or_default();

    if fault.err.present()
        && fault.err.write()
        && fault.err.user()
        && entry.present()
        && entry.copy_on_write()
    {
        return FaultCause::CopyOnWrite;
    }

    if heap.contains(fault.addr) && !entry.present() {
        return FaultCause::LazyHeap;
    }

    let pushed = fault
        .esp
        .is_none_or(|esp| fault.addr.checked_add(4).is_some_and(|a| a.as_u32() == esp));
    if stack.guard_page() == Some(fault.addr.page()) && fault.err.write() && pushed {
        if u64::from(stack.size) + u64::from(kernel_memory_addresses::PAGE_SIZE) > u64::from(max_stack) {
            return FaultCause::StackOverflow;
        }
        return FaultCause::StackGuard;
    }

    FaultCause::Invalid
}

/// Classify `fault` against `proc` and repair the mapping when possible.
///
/// On success the page is present, writable and user-accessible, and its
/// stale translation is dropped from `cache` if `proc`'s space is active.
///
/// # Errors
/// The [`FaultError`] that makes the fault fatal. Nothing leaks on error.
///
/// # Panics
/// Panics if `proc` has no address space.
pub fn resolve_fault<M, C>(
    mem: &mut PhysicalMemory<M>,
    cache: &mut C,
    proc: &mut Process,
    fault: &Fault,
    max_stack: u32,
) -> Result<FaultCause, FaultError>
where
    M: FrameAlloc + PhysMapper,
    C: TranslationCache + ?Sized,
{
    let Some(vm) = proc.vm() else {
        panic!("page fault: process has no address space");
    };
    let cause = classify(fault, vm.space, vm.heap, vm.stack, max_stack);
    let page = fault.addr.page();
    trace!("fault at {} ({}): {cause:?}", fault.addr, fault.err.explain());

    match cause {
        FaultCause::CopyOnWrite => {
            let shared = vm.space.user_frame(page.base())?;
            let copy = mem.alloc_copy_of(shared)?;
            install(mem, vm.space, page, copy)?;
        }
        FaultCause::LazyHeap => {
            let frame = mem.alloc_zeroed()?;
            install(mem, vm.space, page, frame)?;
        }
        FaultCause::StackGuard => {
            let page = vm.stack.extend_down(max_stack)?;
            let grown = mem
                .alloc_zeroed()
                .and_then(|frame| install(mem, vm.space, page, frame));
            if let Err(e) = grown {
                vm.stack.retract_up();
                return Err(e.into());
            }
        }
        FaultCause::StackOverflow => return Err(FaultError::StackOverflow),
        FaultCause::Invalid => return Err(FaultError::Invalid),
    }

    invalidate_if_active(cache, vm.space, page.base());
    Ok(cause)
}

/// Map a fresh private `frame` at `page`, dropping whatever was there.
fn install<M: FrameAlloc + PhysMapper>(
    mem: &mut PhysicalMemory<M>,
    space: &mut AddressSpace,
    page: VirtualPage,
    frame: PhysicalFrame,
) -> Result<(), VmError> {
    if let Err(e) = space.map(mem, page.base(), frame, PageEntryBits::user_rw()) {
        mem.free_unreferenced(frame);
        return Err(e);
    }
    Ok(())
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Page fault trap from user mode: resolve it or mark `proc` killed.
    pub(crate) fn page_fault(&self, cpu: &mut Cpu, tf: &TrapFrame, proc: &mut Process) {
        let fault = Fault {
            addr: cpu.fault_address(),
            err: PageFaultError::from_bits(tf.err),
            esp: Some(tf.esp),
        };
        let result = {
            let mut mem = self.memory.lock_on(cpu.id());
            resolve_fault(&mut *mem, cpu, proc, &fault, self.layout.max_stack_size)
        };
        if let Err(e) = result {
            error!(
                "pid {} {}: trap {} err {} on cpu {} eip {:#x} addr {:#x} ({e})--kill proc",
                proc.pid(),
                proc.name(),
                tf.trapno,
                tf.err,
                cpu.id(),
                tf.eip,
                fault.addr.as_u32()
            );
            proc.killed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PAGE_SIZE;

    #[test]
    fn error_code_bits() {
        let err = PageFaultError::from_bits(0b111);
        assert!(err.present() && err.write() && err.user());
        assert_eq!(PageFaultError::user_write(false).into_bits(), 0b110);
        assert_eq!(PageFaultError::from_bits(0b100).explain(), "Non-present page");
        assert_eq!(PageFaultError::from_bits(0b101).explain(), "Read access to protected page");
    }

    #[test]
    fn vm_errors_map_to_fault_errors() {
        assert_eq!(FaultError::from(VmError::OutOfMemory), FaultError::OutOfMemory);
        assert_eq!(FaultError::from(VmError::StackLimit), FaultError::StackOverflow);
        assert_eq!(
            FaultError::from(VmError::Unmapped(VirtualAddress::zero())),
            FaultError::Invalid
        );
    }

    #[test]
    fn guard_page_is_directly_below_stack() {
        let stack = MmArea::new(VirtualAddress::new(0x5000), PAGE_SIZE);
        assert_eq!(stack.guard_page().map(VirtualPage::base), Some(VirtualAddress::new(0x4000)));
    }
}
