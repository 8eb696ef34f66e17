//! # Kernel synchronization primitives
//!
//! A single named spin lock that remembers which CPU holds it. The kernel
//! uses it for the physical memory context and for the global tick counter.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{NO_CPU, SpinLock, SpinLockGuard};
