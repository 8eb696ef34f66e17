//! Global tick counter, advanced by CPU 0's timer interrupt.

use crate::platform::Scheduler;
use crate::{Cpu, Kernel};
use kernel_vmem::{FrameAlloc, PhysMapper};

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Advance the tick counter and wake its sleepers.
    pub(crate) fn tick<S: Scheduler + ?Sized>(&self, cpu: &Cpu, sched: &mut S) {
        let mut ticks = self.ticks.lock_on(cpu.id());
        *ticks = ticks.wrapping_add(1);
        sched.wakeup_ticks(*ticks);
    }

    /// Ticks since boot.
    #[must_use]
    pub fn uptime(&self, cpu: &Cpu) -> u32 {
        *self.ticks.lock_on(cpu.id())
    }
}
