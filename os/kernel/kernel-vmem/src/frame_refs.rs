//! # Physical Frame Reference Table
//!
//! One counter per physical frame number, shared by every address space.
//!
//! | Count | Meaning |
//! |-------|---------|
//! | 0     | unowned, must not appear in any present entry |
//! | 1     | referenced by exactly one page table entry |
//! | ≥ 2   | shared copy-on-write between address spaces |
//!
//! [`PhysicalMemory`] couples the table with the external frame allocator so
//! that the count reaching zero and the frame going back to the allocator
//! are a single step.

use crate::{FrameAlloc, PhysMapper, VmError};
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame};

/// Byte pattern written over freed frames to catch dangling references.
pub const JUNK_BYTE: u8 = 0x01;

/// Per-frame reference counts, indexed by [`PhysicalFrame`].
#[derive(Debug, Clone)]
pub struct FrameRefTable {
    counts: Vec<u32>,
}

impl FrameRefTable {
    /// A table covering frame numbers `[0, frame_limit)`, all zero.
    #[must_use]
    pub fn new(frame_limit: u32) -> Self {
        Self {
            counts: vec![0; frame_limit as usize],
        }
    }

    #[inline]
    #[must_use]
    pub fn count(&self, frame: PhysicalFrame) -> u32 {
        self.counts.get(frame.as_index()).copied().unwrap_or(0)
    }

    /// Increment and return the new count.
    ///
    /// # Panics
    /// Panics if `frame` is outside the managed range.
    pub fn incref(&mut self, frame: PhysicalFrame) -> u32 {
        let Some(c) = self.counts.get_mut(frame.as_index()) else {
            panic!("incref: {frame} outside physical memory");
        };
        *c += 1;
        *c
    }

    /// Decrement and return the new count.
    ///
    /// # Panics
    /// Panics when the frame is not referenced at all; an entry pointed at
    /// a frame nobody accounted for.
    pub fn decref(&mut self, frame: PhysicalFrame) -> u32 {
        match self.counts.get_mut(frame.as_index()) {
            Some(c) if *c > 0 => {
                *c -= 1;
                *c
            }
            _ => panic!("kdecref: {frame} not referenced"),
        }
    }

    /// Frames with a nonzero count, ascending.
    pub fn referenced(&self) -> impl Iterator<Item = (PhysicalFrame, u32)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(|(i, &c)| (PhysicalFrame::from_number(i as u32), c))
    }
}

/// Physical memory context: the frame allocator, its mapper and the
/// reference table.
///
/// Table frames (the directory and second-level tables) come from the same
/// allocator but are owned by their address space and never counted.
pub struct PhysicalMemory<M> {
    frames: M,
    refs: FrameRefTable,
}

impl<M: FrameAlloc + PhysMapper> PhysicalMemory<M> {
    pub fn new(frames: M) -> Self {
        let refs = FrameRefTable::new(frames.frame_limit());
        Self { frames, refs }
    }

    #[inline]
    #[must_use]
    pub const fn refs(&self) -> &FrameRefTable {
        &self.refs
    }

    #[inline]
    #[must_use]
    pub fn refcount(&self, frame: PhysicalFrame) -> u32 {
        self.refs.count(frame)
    }

    /// Frames currently available from the allocator.
    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &M {
        &self.frames
    }

    /// Direct access to the allocator, bypassing the reference table. Frames
    /// taken this way must not be mapped.
    #[inline]
    pub const fn allocator_mut(&mut self) -> &mut M {
        &mut self.frames
    }

    /// Allocate a zero-filled frame. Its count stays zero until mapped.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the allocator is exhausted.
    pub fn alloc_zeroed(&mut self) -> Result<PhysicalFrame, VmError> {
        let frame = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        self.frames.frame_mut(frame).fill(0);
        Ok(frame)
    }

    /// Allocate a frame holding a copy of `src`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the allocator is exhausted.
    pub fn alloc_copy_of(&mut self, src: PhysicalFrame) -> Result<PhysicalFrame, VmError> {
        let frame = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        let bytes = *self.frames.frame(src);
        self.frames.frame_mut(frame).copy_from_slice(&bytes);
        Ok(frame)
    }

    /// Count one more entry pointing at `frame`.
    pub fn incref(&mut self, frame: PhysicalFrame) {
        self.refs.incref(frame);
    }

    /// Drop one entry pointing at `frame`; the last one frees it.
    pub fn decref(&mut self, frame: PhysicalFrame) {
        if self.refs.decref(frame) == 0 {
            self.release(frame);
        }
    }

    /// Hand an unreferenced frame back to the allocator.
    ///
    /// # Panics
    /// Panics if some entry still refers to `frame`.
    pub fn free_unreferenced(&mut self, frame: PhysicalFrame) {
        assert_eq!(self.refs.count(frame), 0, "kfree: {frame} still referenced");
        self.release(frame);
    }

    fn release(&mut self, frame: PhysicalFrame) {
        self.frames.frame_mut(frame).fill(JUNK_BYTE);
        self.frames.free_frame(frame);
    }

    /// Allocate a frame for a page directory or page table.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the allocator is exhausted.
    pub fn alloc_table_frame(&mut self) -> Result<PhysicalFrame, VmError> {
        self.alloc_zeroed()
    }

    /// Return a page directory or page table frame.
    pub fn free_table_frame(&mut self, frame: PhysicalFrame) {
        self.free_unreferenced(frame);
    }

    #[inline]
    #[must_use]
    pub fn frame(&self, frame: PhysicalFrame) -> &[u8; PAGE_SIZE as usize] {
        self.frames.frame(frame)
    }

    #[inline]
    pub fn frame_mut(&mut self, frame: PhysicalFrame) -> &mut [u8; PAGE_SIZE as usize] {
        self.frames.frame_mut(frame)
    }
}
