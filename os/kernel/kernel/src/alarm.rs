//! # Alarm trampoline
//!
//! A process may ask for a callback every `period` timer ticks it spends in
//! user mode. On expiry the interrupted registers are saved in a
//! continuation record on the user stack and the process resumes in its
//! handler. The handler returns into a user-supplied restore routine, which
//! hands the record back through the `alarm_return` system call.
//!
//! ```text
//!            ┌──────────────────────┐ ◄── interrupted esp
//!   +28      │ saved esp            │
//!   +24      │ saved edx            │
//!   +20      │ saved ecx            │
//!   +16      │ saved eax            │
//!   +12      │ saved eip            │ ◄── record address
//!   +8       │ record address       │   argument of the restore routine
//!   +4       │ 0xffffffff           │   its fake return address
//!   +0       │ restore entry        │   return address of the handler
//!            └──────────────────────┘ ◄── esp in the handler
//! ```
//!
//! At most one delivery is outstanding: expiries while the handler runs
//! only re-arm the countdown.

use crate::interrupts::page_fault::{Fault, PageFaultError, resolve_fault};
use crate::proc::Process;
use crate::trap::TrapFrame;
use crate::{Cpu, Kernel};
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalMemory, TranslationCache, VmError};
use log::{debug, error, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AlarmError {
    #[error("entry point {0} is not a user address")]
    BadEntry(VirtualAddress),
    #[error("no alarm handler is running")]
    NotInHandler,
    #[error("record at {found} does not match {expected}")]
    RecordMismatch {
        expected: VirtualAddress,
        found: VirtualAddress,
    },
    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlarmPhase {
    Disarmed,
    Armed,
    InHandler,
}

/// Per-process alarm bookkeeping.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct AlarmState {
    period: u32,
    ticks_left: u32,
    handler: VirtualAddress,
    restore: VirtualAddress,
    /// Address of the saved registers while the handler runs.
    record: Option<VirtualAddress>,
}

impl AlarmState {
    #[must_use]
    pub const fn phase(&self) -> AlarmPhase {
        if self.record.is_some() {
            AlarmPhase::InHandler
        } else if self.period != 0 {
            AlarmPhase::Armed
        } else {
            AlarmPhase::Disarmed
        }
    }

    #[inline]
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }

    #[inline]
    #[must_use]
    pub const fn ticks_left(&self) -> u32 {
        self.ticks_left
    }

    #[inline]
    #[must_use]
    pub const fn record(&self) -> Option<VirtualAddress> {
        self.record
    }

    /// Start counting down from `period`. A period of zero disarms; a
    /// delivery already in progress stays restorable either way.
    pub const fn arm(&mut self, period: u32, handler: VirtualAddress, restore: VirtualAddress) {
        self.period = period;
        self.ticks_left = period;
        self.handler = handler;
        self.restore = restore;
    }

    /// Forget everything, including a delivery in progress.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Count one user-mode tick. Returns whether a delivery is due.
    pub const fn tick(&mut self) -> bool {
        if self.period == 0 {
            return false;
        }
        self.ticks_left = self.ticks_left.saturating_sub(1);
        if self.ticks_left != 0 {
            return false;
        }
        self.ticks_left = self.period;
        self.record.is_none()
    }
}

/// Registers preserved across a handler invocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SavedRegisters {
    pub eip: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esp: u32,
}

impl SavedRegisters {
    pub const SIZE: usize = 20;

    #[must_use]
    pub const fn capture(tf: &TrapFrame) -> Self {
        Self {
            eip: tf.eip,
            eax: tf.eax,
            ecx: tf.ecx,
            edx: tf.edx,
            esp: tf.esp,
        }
    }

    pub const fn apply(&self, tf: &mut TrapFrame) {
        tf.eip = self.eip;
        tf.eax = self.eax;
        tf.ecx = self.ecx;
        tf.edx = self.edx;
        tf.esp = self.esp;
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (slot, word) in out
            .chunks_exact_mut(4)
            .zip([self.eip, self.eax, self.ecx, self.edx, self.esp])
        {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            eip: word(0),
            eax: word(4),
            ecx: word(8),
            edx: word(12),
            esp: word(16),
        }
    }
}

/// The frame pushed below the interrupted stack pointer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ContinuationRecord {
    /// Where the handler returns to.
    pub restore: VirtualAddress,
    pub saved: SavedRegisters,
}

impl ContinuationRecord {
    pub const SIZE: u32 = 32;
    /// Offset of the saved registers from the start of the frame.
    pub const SAVED_OFFSET: u32 = 12;
    /// Return slot of the restore routine; it never returns.
    pub const FAKE_RETURN: u32 = 0xffff_ffff;

    /// Where the frame goes for a stack pointer of `esp`: 32 bytes below,
    /// word aligned.
    #[must_use]
    pub fn placement(esp: u32) -> Option<VirtualAddress> {
        esp.checked_sub(Self::SIZE).map(|a| VirtualAddress::new(a & !3))
    }

    /// The frame as it appears in memory when placed at `at`.
    #[must_use]
    pub fn to_bytes(&self, at: VirtualAddress) -> [u8; Self::SIZE as usize] {
        let record = at.as_u32().wrapping_add(Self::SAVED_OFFSET);
        let mut out = [0u8; Self::SIZE as usize];
        out[0..4].copy_from_slice(&self.restore.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&Self::FAKE_RETURN.to_le_bytes());
        out[8..12].copy_from_slice(&record.to_le_bytes());
        out[12..].copy_from_slice(&self.saved.to_bytes());
        out
    }
}

/// Make every page of `[start, start + len)` present and privately
/// writable for `proc`, resolving it the way a user write would.
///
/// Pages are taken from the top down so that a record reaching below the
/// guard page first turns the guard page into stack.
fn ensure_user_writable<M, C>(
    mem: &mut PhysicalMemory<M>,
    cache: &mut C,
    proc: &mut Process,
    start: VirtualAddress,
    len: u32,
    max_stack: u32,
) -> Result<(), VmError>
where
    M: FrameAlloc + PhysMapper,
    C: TranslationCache + ?Sized,
{
    let end = start.checked_add(len).ok_or(VmError::InvalidAddress(start))?;
    for page in VirtualPage::range(start, end).rev() {
        let entry = proc
            .space
            .as_ref()
            .and_then(|s| s.entry(page.base()))
            .unwrap_or_default();
        if entry.present() && entry.user_access() && entry.writable() {
            continue;
        }
        let fault = Fault {
            addr: page.base(),
            err: PageFaultError::user_write(entry.present()),
            esp: None,
        };
        resolve_fault(mem, cache, proc, &fault, max_stack).map_err(|e| {
            debug!("alarm frame page {} not writable: {e}", page.base());
            VmError::Unmapped(page.base())
        })?;
    }
    Ok(())
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Arm (or with `period == 0` disarm) the alarm of `proc`.
    ///
    /// # Errors
    /// [`AlarmError::BadEntry`] if `handler` or `restore` is not a user
    /// address. The alarm is left unchanged.
    pub fn arm_alarm(
        &self,
        proc: &mut Process,
        period: u32,
        handler: VirtualAddress,
        restore: VirtualAddress,
    ) -> Result<(), AlarmError> {
        if period != 0 {
            for entry in [handler, restore] {
                if !self.layout.is_user(entry) {
                    return Err(AlarmError::BadEntry(entry));
                }
            }
        }
        proc.alarm.arm(period, handler, restore);
        debug!("pid {}: alarm every {period} ticks, handler {handler}", proc.pid());
        Ok(())
    }

    /// Timer tick taken in user mode: count down and deliver when due.
    pub(crate) fn alarm_tick(&self, cpu: &mut Cpu, tf: &mut TrapFrame, proc: &mut Process) {
        if !proc.alarm.tick() {
            return;
        }
        if let Err(e) = self.deliver_alarm(cpu, tf, proc) {
            error!("pid {} {}: cannot deliver alarm: {e}--kill proc", proc.pid(), proc.name());
            proc.alarm.clear();
            proc.killed = true;
        }
    }

    /// Push the continuation record and redirect `tf` into the handler.
    fn deliver_alarm(&self, cpu: &mut Cpu, tf: &mut TrapFrame, proc: &mut Process) -> Result<(), VmError> {
        let at = ContinuationRecord::placement(tf.esp).ok_or(VmError::InvalidAddress(VirtualAddress::new(tf.esp)))?;
        let record = ContinuationRecord {
            restore: proc.alarm.restore,
            saved: SavedRegisters::capture(tf),
        };

        let mut mem = self.memory.lock_on(cpu.id());
        ensure_user_writable(&mut *mem, cpu, proc, at, ContinuationRecord::SIZE, self.layout.max_stack_size)?;
        let Some(space) = proc.space.as_ref() else {
            panic!("alarm: process has no address space");
        };
        space.copy_out(&mut *mem, at, &record.to_bytes(at))?;
        drop(mem);

        let saved_at = VirtualAddress::new(at.as_u32() + ContinuationRecord::SAVED_OFFSET);
        proc.alarm.record = Some(saved_at);
        tf.eip = proc.alarm.handler.as_u32();
        tf.esp = at.as_u32();
        debug!("pid {}: alarm delivered, record at {saved_at}", proc.pid());
        Ok(())
    }

    /// Return from an alarm handler: restore the registers saved in the
    /// record whose address the restore routine passed at `esp + 4`.
    ///
    /// Returns the saved `eax`, so that storing the system call result
    /// leaves the interrupted `eax` intact.
    ///
    /// # Errors
    /// - [`AlarmError::NotInHandler`] if no delivery is outstanding.
    /// - [`AlarmError::RecordMismatch`] if the argument names another address.
    /// - [`AlarmError::Vm`] if the stack or the record cannot be read.
    pub fn restore_from_handler(&self, cpu: &Cpu, tf: &mut TrapFrame, proc: &mut Process) -> Result<u32, AlarmError> {
        let Some(expected) = proc.alarm.record else {
            return Err(AlarmError::NotInHandler);
        };
        let Some(space) = proc.space.as_ref() else {
            return Err(AlarmError::NotInHandler);
        };

        let saved = {
            let mem = self.memory.lock_on(cpu.id());
            let arg = VirtualAddress::new(tf.esp.wrapping_add(4));
            let found = VirtualAddress::new(space.read_u32(&*mem, arg)?);
            if found != expected {
                warn!("pid {}: alarm_return with {found}, expected {expected}", proc.pid());
                return Err(AlarmError::RecordMismatch { expected, found });
            }
            let mut bytes = [0u8; SavedRegisters::SIZE];
            space.copy_in(&*mem, expected, &mut bytes)?;
            SavedRegisters::from_bytes(&bytes)
        };

        saved.apply(tf);
        proc.alarm.record = None;
        Ok(saved.eax)
    }
}
