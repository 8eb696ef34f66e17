/// Interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u32 = 64;

/// Value placed in `eax` when a system call fails.
pub const SYSCALL_FAILED: u32 = u32::MAX;

/// System calls served by the memory and trap core.
///
/// Numbers follow the classic xv6 table; calls handled elsewhere (files,
/// pipes, sleeping) are not listed and decode to `None`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// Duplicate the calling process with copy-on-write memory.
    Fork = 1,
    /// Terminate the calling process.
    Exit = 2,
    /// Replace the process image: `exec(path, argv)`.
    Exec = 7,
    /// Process id of the caller.
    Getpid = 11,
    /// Move the heap break by a signed delta, returning the previous break.
    Sbrk = 12,
    /// Ticks since boot.
    Uptime = 14,
    /// `alarm(period, handler, restore)`; a period of zero disarms.
    Alarm = 24,
    /// Called by the restore routine with the continuation record address.
    AlarmReturn = 25,
}

impl Sysno {
    /// Decode the number found in `eax`.
    #[must_use]
    pub const fn from_raw(n: u32) -> Option<Self> {
        Some(match n {
            1 => Self::Fork,
            2 => Self::Exit,
            7 => Self::Exec,
            11 => Self::Getpid,
            12 => Self::Sbrk,
            14 => Self::Uptime,
            24 => Self::Alarm,
            25 => Self::AlarmReturn,
            _ => return None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_numbers_decode() {
        assert_eq!(Sysno::from_raw(12), Some(Sysno::Sbrk));
        assert_eq!(Sysno::from_raw(25), Some(Sysno::AlarmReturn));
        assert_eq!(Sysno::Alarm.as_u32(), 24);
        assert_eq!(Sysno::from_raw(0), None);
        assert_eq!(Sysno::from_raw(3), None);
        assert_eq!(Sysno::from_raw(26), None);
    }
}
