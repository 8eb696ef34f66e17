//! # Kernel Configuration
//!
//! This crate defines the memory layout constants and the runtime layout
//! configuration shared by the page table manager, the image loader and the
//! trap path. It is the single place where the split between user and
//! kernel virtual memory is decided.
//!
//! ## Virtual Memory Architecture
//!
//! Every address space is split at [`memory::KERNBASE`]:
//!
//! ```text
//! 0x0000_0000 ─ KERNBASE                      user text+data, stack, heap
//! KERNBASE    ─ KERNBASE+EXTMEM               low physical memory (I/O space)
//! KERNLINK    ─ data                          kernel text and read-only data
//! data        ─ KERNBASE+PHYSTOP              kernel data and free memory
//! DEVSPACE    ─ 0xFFFF_FFFF                   memory-mapped devices
//! ```
//!
//! The kernel half is identical in every address space and is built once
//! from [`memory::MemoryLayout::kernel_regions`].

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
