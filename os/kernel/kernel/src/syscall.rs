//! # System calls
//!
//! The number arrives in `eax`, arguments on the user stack above the
//! return address of the library stub:
//!
//! ```text
//!   esp + 4 + 4·n   argument n
//!   esp             return address into the caller
//! ```
//!
//! The result goes back in `eax`; every failure becomes `-1`.

use crate::alarm::AlarmError;
use crate::exec::ExecError;
use crate::platform::Platform;
use crate::proc::Process;
use crate::trap::TrapFrame;
use crate::{Cpu, Kernel};
use alloc::string::String;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{SYSCALL_FAILED, Sysno};
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, PhysicalMemory, VmError};
use log::{trace, warn};

/// Longest path `exec` accepts, terminator included.
pub const MAX_PATH: usize = 128;

/// Longest single argument string `exec` copies in.
pub const MAX_ARG_LEN: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    #[error("unknown system call {0}")]
    Unknown(u32),
    #[error("argument {0} is out of range")]
    BadArgument(usize),
    #[error("string at {0} is not terminated or not UTF-8")]
    BadString(VirtualAddress),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Alarm(#[from] AlarmError),
}

/// Word argument `n` of the current call.
fn arg_u32<M: FrameAlloc + PhysMapper>(
    mem: &PhysicalMemory<M>,
    space: &AddressSpace,
    tf: &TrapFrame,
    n: u32,
) -> Result<u32, SyscallError> {
    let at = tf
        .esp
        .checked_add(4 + 4 * n)
        .ok_or(SyscallError::BadArgument(n as usize))?;
    Ok(space.read_u32(mem, VirtualAddress::new(at))?)
}

/// A NUL-terminated string of at most `max` bytes at `va`.
fn fetch_str<M: FrameAlloc + PhysMapper>(
    mem: &PhysicalMemory<M>,
    space: &AddressSpace,
    va: VirtualAddress,
    max: usize,
) -> Result<String, SyscallError> {
    let mut bytes = Vec::new();
    let mut at = va;
    let mut byte = [0u8; 1];
    loop {
        space.copy_in(mem, at, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        if bytes.len() >= max {
            return Err(SyscallError::BadString(va));
        }
        at = at.checked_add(1).ok_or(SyscallError::BadString(va))?;
    }
    String::from_utf8(bytes).map_err(|_| SyscallError::BadString(va))
}

/// Path and argument vector of an `exec` call.
fn fetch_exec_args<M: FrameAlloc + PhysMapper>(
    mem: &PhysicalMemory<M>,
    space: &AddressSpace,
    tf: &TrapFrame,
    max_args: usize,
) -> Result<(String, Vec<String>), SyscallError> {
    let path = VirtualAddress::new(arg_u32(mem, space, tf, 0)?);
    let uargv = arg_u32(mem, space, tf, 1)?;
    let path = fetch_str(mem, space, path, MAX_PATH)?;

    let mut argv = Vec::new();
    loop {
        let slot = (argv.len() as u32)
            .checked_mul(4)
            .and_then(|off| uargv.checked_add(off))
            .ok_or(SyscallError::BadArgument(1))?;
        let ptr = space.read_u32(mem, VirtualAddress::new(slot))?;
        if ptr == 0 {
            break;
        }
        if argv.len() >= max_args {
            return Err(ExecError::TooManyArgs.into());
        }
        argv.push(fetch_str(mem, space, VirtualAddress::new(ptr), MAX_ARG_LEN)?);
    }
    Ok((path, argv))
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Run the call numbered `tf.eax` and store its result in `tf.eax`.
    pub(crate) fn syscall<P: Platform + ?Sized>(
        &self,
        cpu: &mut Cpu,
        tf: &mut TrapFrame,
        proc: &mut Process,
        env: &mut P,
    ) {
        let num = tf.eax;
        let Some(sysno) = Sysno::from_raw(num) else {
            warn!("pid {} {}: unknown sys call {num}", proc.pid(), proc.name());
            tf.eax = SYSCALL_FAILED;
            return;
        };
        trace!("pid {}: {sysno:?}", proc.pid());

        let result = match sysno {
            Sysno::Exit => {
                self.exit(cpu, proc, env);
                return;
            }
            Sysno::Fork => self.fork(cpu, tf, proc, env).map(|pid| pid.as_u32()).map_err(Into::into),
            Sysno::Getpid => Ok(proc.pid().as_u32()),
            Sysno::Uptime => Ok(self.uptime(cpu)),
            Sysno::Sbrk => self.sys_sbrk(cpu, tf, proc),
            Sysno::Exec => self.sys_exec(cpu, tf, proc, env),
            Sysno::Alarm => self.sys_alarm(cpu, tf, proc),
            Sysno::AlarmReturn => self.restore_from_handler(cpu, tf, proc).map_err(Into::into),
        };

        tf.eax = match result {
            Ok(value) => value,
            Err(e) => {
                trace!("pid {}: {sysno:?} failed: {e}", proc.pid());
                SYSCALL_FAILED
            }
        };
    }

    fn with_args<R>(
        &self,
        cpu: &Cpu,
        proc: &Process,
        f: impl FnOnce(&PhysicalMemory<M>, &AddressSpace) -> Result<R, SyscallError>,
    ) -> Result<R, SyscallError> {
        let Some(space) = proc.space.as_ref() else {
            return Err(SyscallError::BadArgument(0));
        };
        self.with_memory(cpu, |mem| f(mem, space))
    }

    /// `sbrk(n)`: returns the break before the change.
    fn sys_sbrk(&self, cpu: &mut Cpu, tf: &TrapFrame, proc: &mut Process) -> Result<u32, SyscallError> {
        let n = self.with_args(cpu, proc, |mem, space| arg_u32(mem, space, tf, 0))?;
        let old = proc.heap.limit();
        self.grow_or_shrink_heap(cpu, proc, n.cast_signed())?;
        Ok(old.as_u32())
    }

    /// `alarm(period, handler, restore)`.
    fn sys_alarm(&self, cpu: &Cpu, tf: &TrapFrame, proc: &mut Process) -> Result<u32, SyscallError> {
        let (period, handler, restore) = self.with_args(cpu, proc, |mem, space| {
            Ok((
                arg_u32(mem, space, tf, 0)?,
                arg_u32(mem, space, tf, 1)?,
                arg_u32(mem, space, tf, 2)?,
            ))
        })?;
        if period.cast_signed() < 0 {
            return Err(SyscallError::BadArgument(0));
        }
        self.arm_alarm(proc, period, VirtualAddress::new(handler), VirtualAddress::new(restore))?;
        Ok(0)
    }

    /// `exec(path, argv)`.
    fn sys_exec<P: Platform + ?Sized>(
        &self,
        cpu: &mut Cpu,
        tf: &mut TrapFrame,
        proc: &mut Process,
        env: &mut P,
    ) -> Result<u32, SyscallError> {
        let max_args = self.layout.max_args;
        let (path, argv) = self.with_args(cpu, proc, |mem, space| fetch_exec_args(mem, space, tf, max_args))?;
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.exec(cpu, tf, proc, env, &path, &argv)?;
        Ok(0)
    }
}
