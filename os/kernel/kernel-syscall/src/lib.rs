//! # System call numbers
//!
//! Shared between the kernel's dispatcher and user programs. A system call
//! is raised with `int 64`; the number travels in `eax`, arguments live on
//! the user stack above the return address and the result comes back in
//! `eax` (`-1` on failure).

#![cfg_attr(not(any(test, doctest)), no_std)]

mod syscall;

pub use syscall::{SYSCALL_FAILED, SYSCALL_VECTOR, Sysno};
