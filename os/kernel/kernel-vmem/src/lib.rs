//! # Virtual Memory Support
//!
//! Two-level 32-bit x86 paging for a small multiprocessor kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] (page directory plus its second-level tables) with
//!   the single-page and range operations every process needs.
//! - A process-wide [`FrameRefTable`] wrapped together with the frame
//!   allocator in [`PhysicalMemory`], so that clearing the last entry that
//!   refers to a frame returns it to the allocator.
//! - The per-process region model ([`MmArea`]) with heap growth and shrink.
//! - The copy-on-write fork engine ([`copy_address_space`]).
//! - A [`TranslationCache`] seam for local TLB maintenance.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//!
//!  CR3 → Page Directory ──PDE──► Page Table ──PTE──► 4 KiB frame
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by CR3. Each entry names a page table. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps one 4 KiB frame. |
//!
//! ## Arena of tables
//!
//! Every address space owns its directory and a map from table frame to
//! table. The walk never dereferences raw physical addresses: a directory
//! entry's frame number is the key into that map. User address spaces share
//! the tables of the kernel half with a kernel template built once at boot;
//! the template's tables are never freed while a user space refers to them.
//!
//! ## Reference counting
//!
//! Frames mapped into user space are counted. [`AddressSpace::map`]
//! increments, [`AddressSpace::unmap`] decrements and the count reaching
//! zero frees the frame. The fixed kernel mapping created with
//! [`AddressSpace::map_region`] is never counted. Frames holding the tables
//! themselves belong to their address space and are freed by
//! [`AddressSpace::destroy`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod address_space;
mod cow;
mod frame_refs;
mod page_entry_bits;
pub mod page_table;
pub mod region;
mod tlb;

pub use crate::address_space::AddressSpace;
pub use crate::cow::copy_address_space;
pub use crate::frame_refs::{FrameRefTable, JUNK_BYTE, PhysicalMemory};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageDirectory, PageTable};
pub use crate::region::MmArea;
pub use crate::tlb::{TranslationCache, invalidate_if_active};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Errors raised by page table and region operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address {0} is outside the permitted range")]
    InvalidAddress(VirtualAddress),
    #[error("no page table covers {0}")]
    Unmapped(VirtualAddress),
    #[error("page at {0} is not writable from user mode")]
    ReadOnly(VirtualAddress),
    #[error("region size change by {0} rejected")]
    InvalidDelta(i32),
    #[error("stack would exceed its maximum size")]
    StackLimit,
}

/// Source of physical 4 KiB frames.
///
/// The implementation decides where frames come from (free list, bitmap,
/// a host buffer). Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one frame. Its contents are unspecified.
    fn alloc_frame(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalFrame);

    /// Exclusive upper bound of frame numbers this allocator hands out.
    fn frame_limit(&self) -> u32;

    /// Number of frames currently available.
    fn free_frames(&self) -> usize;
}

/// Gives the kernel access to the bytes of a physical frame.
///
/// On hardware this is the direct map at `KERNBASE`; hosted implementations
/// keep frames in ordinary memory.
pub trait PhysMapper {
    fn frame(&self, frame: PhysicalFrame) -> &[u8; PAGE_SIZE as usize];
    fn frame_mut(&mut self, frame: PhysicalFrame) -> &mut [u8; PAGE_SIZE as usize];
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use kernel_info::memory::MemoryLayout;

    /// A trivial in-memory "RAM": `n` boxed frames plus a free stack that
    /// hands out the lowest frame number first.
    pub(crate) struct TestPhys {
        frames: Vec<Box<[u8; PAGE_SIZE as usize]>>,
        free: Vec<PhysicalFrame>,
    }

    impl TestPhys {
        pub(crate) fn with_frames(n: u32) -> Self {
            let frames = (0..n).map(|_| Box::new([0u8; PAGE_SIZE as usize])).collect();
            let free = (0..n).rev().map(PhysicalFrame::from_number).collect();
            Self { frames, free }
        }
    }

    impl FrameAlloc for TestPhys {
        fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
            self.free.pop()
        }

        fn free_frame(&mut self, frame: PhysicalFrame) {
            assert!(!self.free.contains(&frame), "double free of {frame}");
            self.free.push(frame);
        }

        fn frame_limit(&self) -> u32 {
            self.frames.len() as u32
        }

        fn free_frames(&self) -> usize {
            self.free.len()
        }
    }

    impl PhysMapper for TestPhys {
        fn frame(&self, frame: PhysicalFrame) -> &[u8; PAGE_SIZE as usize] {
            &self.frames[frame.as_index()]
        }

        fn frame_mut(&mut self, frame: PhysicalFrame) -> &mut [u8; PAGE_SIZE as usize] {
            &mut self.frames[frame.as_index()]
        }
    }

    /// A small machine: 1 GiB user half, 4 MiB of physical memory and a
    /// single page of device space.
    pub(crate) const SMALL: MemoryLayout = MemoryLayout {
        kernel_base: 0x4000_0000,
        ext_mem: 0x0010_0000,
        kernel_data: 0x4020_0000,
        phys_top: 0x0040_0000,
        dev_space: 0xFFFF_F000,
        max_stack_size: 4 * PAGE_SIZE,
        max_args: 8,
    };

    /// Count present user entries per frame across `spaces`.
    pub(crate) fn pte_counts(spaces: &[&AddressSpace]) -> alloc::collections::BTreeMap<PhysicalFrame, u32> {
        let mut counts = alloc::collections::BTreeMap::new();
        for s in spaces {
            for (_, e) in s.user_pages() {
                *counts.entry(e.frame()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Reference counts equal present entry counts for every frame.
    pub(crate) fn assert_refcounts_match(mem: &PhysicalMemory<TestPhys>, spaces: &[&AddressSpace]) {
        let counts = pte_counts(spaces);
        let refs: alloc::collections::BTreeMap<_, _> = mem.refs().referenced().collect();
        assert_eq!(refs, counts);
    }
}
