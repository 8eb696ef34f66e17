//! # Trap dispatch
//!
//! Every exception, interrupt and system call funnels into [`Kernel::trap`]
//! with the register snapshot the entry stub pushed.
//!
//! ```text
//!  user ──int──► vector stub ──► alltraps ──► Kernel::trap ──► checkpoints ──► iret
//! ```
//!
//! The killed flag is only acted upon at the checkpoints after dispatch, and
//! only when the trap came from user mode. A process killed while running
//! kernel code keeps going until it reaches the system call return.

use crate::interrupts::page_fault::PageFaultError;
use crate::platform::{Irq, Platform};
use crate::proc::{ProcState, Process};
use crate::{Cpu, Kernel};
use kernel_syscall::SYSCALL_VECTOR;
use kernel_vmem::{FrameAlloc, PhysMapper, TranslationCache};
use log::{error, info};

pub const T_DIVIDE: u32 = 0;
pub const T_GPFLT: u32 = 13;
/// Page fault.
pub const T_PGFLT: u32 = 14;
pub const T_SYSCALL: u32 = SYSCALL_VECTOR;

/// IRQ 0 corresponds to vector `T_IRQ0`.
pub const T_IRQ0: u32 = 32;

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_SPURIOUS: u32 = 31;

/// Requested privilege level of user segments.
pub const DPL_USER: u16 = 3;

/// Selectors as laid out by the GDT: kernel code, kernel data, user code,
/// user data.
pub const KERNEL_CS: u16 = 1 << 3;
pub const KERNEL_DS: u16 = 2 << 3;
pub const USER_CS: u16 = (3 << 3) | DPL_USER;
pub const USER_DS: u16 = (4 << 3) | DPL_USER;

/// Register snapshot built by the hardware and the `alltraps` stub.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TrapFrame {
    // pushal
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored by popal.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,
    pub trapno: u32,

    // Pushed by the CPU.
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    // Only present when crossing rings.
    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

const _: () = assert!(size_of::<TrapFrame>() == 76);

/// Interrupt enable flag in `eflags`.
pub const FL_IF: u32 = 0x200;

impl TrapFrame {
    /// A frame for trap `trapno` taken in user mode at `eip` with stack
    /// pointer `esp`.
    #[must_use]
    pub fn user(trapno: u32, eip: u32, esp: u32) -> Self {
        Self {
            trapno,
            eip,
            esp,
            cs: USER_CS,
            ds: USER_DS,
            es: USER_DS,
            ss: USER_DS,
            eflags: FL_IF,
            ..Self::default()
        }
    }

    /// A frame for trap `trapno` taken while running kernel code.
    #[must_use]
    pub fn kernel(trapno: u32, eip: u32) -> Self {
        Self {
            trapno,
            eip,
            cs: KERNEL_CS,
            ds: KERNEL_DS,
            es: KERNEL_DS,
            ss: KERNEL_DS,
            ..Self::default()
        }
    }

    /// Whether the trap interrupted user code.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == DPL_USER
    }
}

/// How the current process leaves the trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapOutcome {
    /// Return to the interrupted code with the (possibly modified) frame.
    Resume,
    /// The process exited and released its memory; it must not resume.
    Exited,
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Handle one trap on `cpu`.
    ///
    /// `proc` is the process the CPU was running, if any. Its frame is `tf`.
    ///
    /// # Panics
    /// Panics on an unexpected trap from kernel mode or without a process,
    /// and on a page fault the kernel itself caused.
    pub fn trap<P: Platform + ?Sized>(
        &self,
        cpu: &mut Cpu,
        tf: &mut TrapFrame,
        mut proc: Option<&mut Process>,
        env: &mut P,
    ) -> TrapOutcome {
        if tf.trapno == T_SYSCALL {
            let Some(proc) = proc else {
                panic!("syscall from cpu {} without a process", cpu.id());
            };
            if proc.killed {
                return self.exit(cpu, proc, env);
            }
            self.syscall(cpu, tf, proc, env);
            if proc.state == ProcState::Zombie {
                return TrapOutcome::Exited;
            }
            if proc.killed {
                return self.exit(cpu, proc, env);
            }
            return TrapOutcome::Resume;
        }

        match tf.trapno {
            t if t == T_IRQ0 + IRQ_TIMER => {
                if cpu.id() == 0 {
                    self.tick(cpu, env);
                }
                if let Some(p) = proc.as_deref_mut()
                    && tf.from_user()
                {
                    self.alarm_tick(cpu, tf, p);
                }
                env.end_of_interrupt(cpu.id());
            }
            t if t == T_IRQ0 + IRQ_IDE => {
                env.device_interrupt(Irq::Ide);
                env.end_of_interrupt(cpu.id());
            }
            t if t == T_IRQ0 + IRQ_IDE + 1 => {
                // Bochs generates spurious IDE1 interrupts.
            }
            t if t == T_IRQ0 + IRQ_KBD => {
                env.device_interrupt(Irq::Keyboard);
                env.end_of_interrupt(cpu.id());
            }
            t if t == T_IRQ0 + IRQ_COM1 => {
                env.device_interrupt(Irq::Com1);
                env.end_of_interrupt(cpu.id());
            }
            t if t == T_IRQ0 + 7 || t == T_IRQ0 + IRQ_SPURIOUS => {
                info!("cpu{}: spurious interrupt at {:x}:{:x}", cpu.id(), tf.cs, tf.eip);
                env.end_of_interrupt(cpu.id());
            }
            T_PGFLT if proc.is_some() && PageFaultError::from_bits(tf.err).user() => {
                if let Some(p) = proc.as_deref_mut() {
                    self.page_fault(cpu, tf, p);
                }
            }
            _ => match proc.as_deref_mut() {
                Some(p) if tf.from_user() => {
                    error!(
                        "pid {} {}: trap {} err {} on cpu {} eip {:#x} addr {:#x}--kill proc",
                        p.pid(),
                        p.name(),
                        tf.trapno,
                        tf.err,
                        cpu.id(),
                        tf.eip,
                        cpu.fault_address().as_u32()
                    );
                    p.killed = true;
                }
                _ => {
                    error!(
                        "unexpected trap {} from cpu {} eip {:x} (cr2={:#x})",
                        tf.trapno,
                        cpu.id(),
                        tf.eip,
                        cpu.fault_address().as_u32()
                    );
                    panic!("trap");
                }
            },
        }

        let Some(proc) = proc else {
            return TrapOutcome::Resume;
        };

        if proc.killed && tf.from_user() {
            return self.exit(cpu, proc, env);
        }

        if proc.state == ProcState::Running && tf.trapno == T_IRQ0 + IRQ_TIMER {
            env.yield_now(proc);
        }

        if proc.killed && tf.from_user() {
            return self.exit(cpu, proc, env);
        }

        TrapOutcome::Resume
    }

    /// Terminate `proc`: switch this CPU back to the kernel mapping,
    /// release the process's memory and hand it to the scheduler.
    pub(crate) fn exit<P: Platform + ?Sized>(&self, cpu: &mut Cpu, proc: &mut Process, env: &mut P) -> TrapOutcome {
        if let Some(space) = &proc.space
            && cpu.active_root() == Some(space.root())
        {
            cpu.activate(self.kernel_space().root());
        }
        self.release(cpu, proc);
        proc.state = ProcState::Zombie;
        env.exit(proc);
        TrapOutcome::Exited
    }
}
