//! Process-level memory operations: creation, fork, heap resizing and
//! teardown.

use crate::platform::Scheduler;
use crate::proc::{Pid, ProcState, Process};
use crate::trap::TrapFrame;
use crate::{Cpu, Kernel};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, FrameAlloc, MmArea, PhysMapper, TranslationCache, VmError, copy_address_space};
use log::{debug, info};

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// A new process with an empty user half, ready for [`exec`](Self::exec).
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the page directory cannot be allocated.
    pub fn create_process(&self, cpu: &Cpu, name: &str) -> Result<Process, VmError> {
        let space = self.with_memory(cpu, |mem| AddressSpace::new_user(mem, self.kernel_space()))?;
        let proc = Process::new(self.allocate_pid(), name, space);
        debug!("pid {} {}: created", proc.pid(), proc.name());
        Ok(proc)
    }

    /// Release every frame and table of `proc`'s address space and reset its
    /// regions and alarm. The space must not be active on any CPU.
    pub fn release(&self, cpu: &Cpu, proc: &mut Process) {
        if let Some(space) = proc.space.take() {
            debug_assert_ne!(cpu.active_root(), Some(space.root()), "freeing the active page directory");
            self.with_memory(cpu, |mem| space.destroy(mem));
        }
        proc.text_data = MmArea::default();
        proc.stack = MmArea::default();
        proc.heap = MmArea::default();
        proc.alarm.clear();
    }

    /// Move the heap break of `proc` by `delta` bytes and return the new
    /// break.
    ///
    /// Growing only moves the break; pages appear on first touch. Shrinking
    /// unmaps every page wholly above the new break at once and flushes this
    /// CPU's translations when `proc` is active. `delta == 0` changes
    /// nothing.
    ///
    /// # Errors
    /// [`VmError::InvalidDelta`] when the break would fall below the heap
    /// start or rise past the kernel base.
    pub fn grow_or_shrink_heap(&self, cpu: &mut Cpu, proc: &mut Process, delta: i32) -> Result<VirtualAddress, VmError> {
        let limit = VirtualAddress::new(self.layout.kernel_base);
        let Some(vm) = proc.vm() else {
            return Err(VmError::InvalidAddress(limit));
        };
        if delta >= 0 {
            vm.heap.grow_heap(delta, limit)?;
        } else {
            self.with_memory(cpu, |mem| vm.heap.shrink_heap(delta, vm.space, mem))?;
            if cpu.active_root() == Some(vm.space.root()) {
                cpu.activate(vm.space.root());
            }
        }
        Ok(vm.heap.limit())
    }

    /// Duplicate `parent` copy-on-write. The child gets a fresh pid, the
    /// parent's regions, a disarmed alarm and `tf` with `eax = 0`, and is
    /// handed to `sched`. Returns the child's pid.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; nothing of the child survives.
    pub fn fork<S: Scheduler + ?Sized>(
        &self,
        cpu: &mut Cpu,
        tf: &TrapFrame,
        parent: &mut Process,
        sched: &mut S,
    ) -> Result<Pid, VmError> {
        let areas = parent.regions();
        let Some(space) = parent.space.as_mut() else {
            return Err(VmError::InvalidAddress(VirtualAddress::zero()));
        };
        let child_space = {
            let mut mem = self.memory.lock_on(cpu.id());
            copy_address_space(space, &areas, &mut *mem, cpu)?
        };

        let mut child = Process::new(self.allocate_pid(), parent.name().as_str(), child_space);
        child.text_data = parent.text_data;
        child.stack = parent.stack;
        child.heap = parent.heap;
        child.state = ProcState::Runnable;

        let mut child_tf = *tf;
        child_tf.eax = 0;
        let pid = child.pid();
        info!("pid {} {}: forked child {pid}", parent.pid(), parent.name());
        sched.spawn(child, child_tf);
        Ok(pid)
    }
}
