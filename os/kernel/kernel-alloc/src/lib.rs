//! # Kernel Physical Frame Allocation
//!
//! [`RamFrames`](frame_alloc::RamFrames) owns a contiguous range of
//! physical frames, hands them out from a free list and gives the kernel
//! byte access to them. It implements both capabilities the virtual memory
//! core consumes:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ kernel-vmem PhysicalMemory    │  reference counts, zeroing, copying
//! └──────────────┬────────────────┘
//!                │ FrameAlloc + PhysMapper
//! ┌──────────────▼────────────────┐
//! │ RamFrames                     │  free list over [first, limit)
//! └───────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::frame_alloc::RamFrames;
//! use kernel_vmem::FrameAlloc;
//!
//! let mut frames = RamFrames::new(0x100, 4);
//! let f = frames.alloc_frame().unwrap();
//! assert_eq!(f.number(), 0x100);
//! assert_eq!(frames.free_frames(), 3);
//! frames.free_frame(f);
//! assert_eq!(frames.free_frames(), 4);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::cast_possible_truncation)]

extern crate alloc;

pub mod frame_alloc;
