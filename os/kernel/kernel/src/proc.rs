//! The memory side of a process.

use crate::alarm::AlarmState;
use core::fmt;
use kernel_info::memory::PROC_NAME_LEN;
use kernel_vmem::{AddressSpace, MmArea};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcState {
    Embryo,
    Runnable,
    Running,
    Zombie,
}

/// Process name for diagnostics: at most `PROC_NAME_LEN - 1` bytes.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ProcName([u8; PROC_NAME_LEN]);

impl ProcName {
    /// The last component of `path`, truncated.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let last = path.rsplit('/').next().unwrap_or(path);
        let mut name = [0u8; PROC_NAME_LEN];
        let n = last.len().min(PROC_NAME_LEN - 1);
        name[..n].copy_from_slice(&last.as_bytes()[..n]);
        Self(name)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        let bytes = &self.0[..len];
        match core::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
        }
    }
}

impl fmt::Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// A process as the memory core sees it.
///
/// ### Invariants
/// - `text_data.start == 0`.
/// - `stack.end <= heap.start`; the heap starts at the stack top.
/// - Every present user mapping of `space` lies in one of the three regions.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    name: ProcName,
    pub state: ProcState,
    /// Set when the process must die; acted upon at the next return to
    /// user mode.
    pub killed: bool,
    /// `None` only before the first image is loaded and after release.
    pub space: Option<AddressSpace>,
    pub text_data: MmArea,
    pub stack: MmArea,
    pub heap: MmArea,
    pub alarm: AlarmState,
}

/// Disjoint mutable views of a process's address space and regions.
pub struct ProcessVm<'a> {
    pub space: &'a mut AddressSpace,
    pub text_data: &'a mut MmArea,
    pub stack: &'a mut MmArea,
    pub heap: &'a mut MmArea,
}

impl Process {
    #[must_use]
    pub fn new(pid: Pid, name: &str, space: AddressSpace) -> Self {
        Self {
            pid,
            name: ProcName::from_path(name),
            state: ProcState::Embryo,
            killed: false,
            space: Some(space),
            text_data: MmArea::default(),
            stack: MmArea::default(),
            heap: MmArea::default(),
            alarm: AlarmState::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &ProcName {
        &self.name
    }

    pub fn set_name(&mut self, path: &str) {
        self.name = ProcName::from_path(path);
    }

    /// The three regions in the order fork walks them.
    #[must_use]
    pub const fn regions(&self) -> [MmArea; 3] {
        [self.text_data, self.stack, self.heap]
    }

    /// Borrow the address space together with the regions.
    pub fn vm(&mut self) -> Option<ProcessVm<'_>> {
        let space = self.space.as_mut()?;
        Some(ProcessVm {
            space,
            text_data: &mut self.text_data,
            stack: &mut self.stack,
            heap: &mut self.heap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_last_path_component() {
        assert_eq!(ProcName::from_path("/bin/alarmtest").as_str(), "alarmtest");
        assert_eq!(ProcName::from_path("init").as_str(), "init");
        assert_eq!(ProcName::from_path("/usr/").as_str(), "");
    }

    #[test]
    fn name_is_truncated() {
        let name = ProcName::from_path("a_rather_long_program_name");
        assert_eq!(name.as_str(), "a_rather_long_p");
        assert_eq!(name.as_str().len(), PROC_NAME_LEN - 1);
    }

    #[test]
    fn truncation_never_splits_a_character() {
        // 14 ASCII bytes followed by a two-byte character.
        let name = ProcName::from_path("abcdefghijklmnä");
        assert_eq!(name.as_str(), "abcdefghijklmn");
    }

    #[test]
    fn pid_displays_as_number() {
        assert_eq!(alloc::format!("{}", Pid::new(42)), "42");
    }
}
