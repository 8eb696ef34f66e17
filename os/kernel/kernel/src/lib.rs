//! # Kernel core
//!
//! Process memory and fault handling for a small 32-bit multiprocessor
//! kernel. The pieces below sit on top of [`kernel_vmem`]:
//!
//! - [`proc`]: the per-process memory context (address space, regions,
//!   alarm state).
//! - [`trap`]: the single trap entry point with its return checkpoints.
//! - [`interrupts`]: the page fault resolver and the timer tick.
//! - [`alarm`]: the periodic user callback and its continuation record.
//! - [`exec`] / [`elf`]: replacing a process image from an ELF32 file.
//! - [`syscall`]: the system call table for the calls above.
//! - [`logger`]: the `log` backend writing to a console sink.
//!
//! Collaborators the core does not implement (file system, scheduler,
//! interrupt controller) are reached through the traits in [`platform`].
//!
//! ## Locking
//!
//! [`Kernel`] is shared by reference between CPUs. Physical memory (the
//! frame allocator together with the reference table) sits behind the
//! `kmem` spin lock and the tick counter behind `time`. A process's page
//! tables are only touched through `&mut Process`, which the scheduler hands
//! to one CPU at a time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::missing_panics_doc, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod alarm;
pub mod cpu;
pub mod elf;
pub mod exec;
pub mod interrupts;
pub mod logger;
pub mod platform;
pub mod proc;
pub mod syscall;
pub mod trap;
mod vmem;

use crate::proc::Pid;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::MemoryLayout;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, PhysicalMemory, VmError};
use log::info;

pub use crate::alarm::{AlarmError, AlarmPhase, AlarmState, ContinuationRecord, SavedRegisters};
pub use crate::cpu::Cpu;
pub use crate::elf::ElfError;
pub use crate::exec::ExecError;
pub use crate::interrupts::page_fault::{Fault, FaultCause, FaultError, PageFaultError};
pub use crate::platform::{FileSystem, Inode, InterruptController, Irq, Platform, Scheduler};
pub use crate::proc::{ProcState, Process};
pub use crate::syscall::SyscallError;
pub use crate::trap::{TrapFrame, TrapOutcome};

/// State shared by every CPU.
pub struct Kernel<M> {
    memory: SpinLock<PhysicalMemory<M>>,
    kernel_space: Arc<AddressSpace>,
    layout: MemoryLayout,
    ticks: SpinLock<u32>,
    next_pid: AtomicU32,
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Take over `frames` and build the kernel template mapping of `layout`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the kernel's page tables do not fit.
    pub fn boot(frames: M, layout: MemoryLayout) -> Result<Self, VmError> {
        let mut memory = PhysicalMemory::new(frames);
        let kernel_space = AddressSpace::new_kernel(&mut memory, &layout)?;
        info!(
            "kernel template {} ready, {} frames free",
            kernel_space.root(),
            memory.free_frames()
        );
        Ok(Self {
            memory: SpinLock::named("kmem", memory),
            kernel_space: Arc::new(kernel_space),
            layout,
            ticks: SpinLock::named("time", 0),
            next_pid: AtomicU32::new(1),
        })
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// The address space holding only the kernel mapping.
    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    /// Run `f` with the physical memory lock held on behalf of `cpu`.
    pub fn with_memory<R>(&self, cpu: &Cpu, f: impl FnOnce(&mut PhysicalMemory<M>) -> R) -> R {
        let mut mem = self.memory.lock_on(cpu.id());
        f(&mut mem)
    }

    fn allocate_pid(&self) -> Pid {
        Pid::new(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }
}
