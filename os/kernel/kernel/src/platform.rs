//! Collaborators of the core.
//!
//! The file system, the scheduler with its process table and the interrupt
//! controller live outside this crate. The trap path reaches them through
//! these traits; [`Platform`] bundles the three for call sites that need
//! all of them.

use crate::proc::Process;
use crate::trap::TrapFrame;

/// Handle of an on-disk file as returned by [`FileSystem::find_file`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Inode(pub u32);

pub trait FileSystem {
    /// Resolve `path` to a file.
    fn find_file(&mut self, path: &str) -> Option<Inode>;

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is short at end of file.
    fn read_file(&mut self, node: Inode, buf: &mut [u8], offset: u32) -> usize;
}

/// The process table and the CPU scheduler.
pub trait Scheduler {
    /// `proc` has terminated and released its memory. It never runs again.
    fn exit(&mut self, proc: &mut Process);

    /// Give up the CPU for one scheduling round.
    fn yield_now(&mut self, proc: &mut Process);

    /// Wake everything sleeping on the tick counter, which now reads `ticks`.
    fn wakeup_ticks(&mut self, ticks: u32);

    /// Enter a freshly forked child into the process table. It resumes in
    /// user mode with `tf`.
    fn spawn(&mut self, child: Process, tf: TrapFrame);
}

/// Device interrupts handled by drivers outside the core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Irq {
    Ide,
    Keyboard,
    Com1,
}

pub trait InterruptController {
    /// Acknowledge the interrupt being served on `cpu`.
    fn end_of_interrupt(&mut self, cpu: usize);

    /// Run the driver for `irq`.
    fn device_interrupt(&mut self, irq: Irq);
}

/// Everything the trap path talks to.
pub trait Platform: FileSystem + Scheduler + InterruptController {}

impl<T: FileSystem + Scheduler + InterruptController + ?Sized> Platform for T {}
