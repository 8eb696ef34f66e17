//! Free-list frame allocator over a block of frames held in ordinary memory.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, trace};

type Frame = [u8; PAGE_SIZE as usize];

/// Physical frames `[first, first + count)` with a LIFO free list.
///
/// The lowest frame number is handed out first after construction, which
/// keeps allocation order predictable.
///
/// # Invariants
/// - A frame is either on the free list or owned by the caller, never both.
pub struct RamFrames {
    first: u32,
    frames: Vec<Box<Frame>>,
    free: Vec<PhysicalFrame>,
}

impl RamFrames {
    /// # Panics
    /// Panics if the range exceeds the 32-bit physical address space.
    #[must_use]
    pub fn new(first: u32, count: u32) -> Self {
        assert!(
            u64::from(first) + u64::from(count) <= 1 << 20,
            "frame range beyond 4 GiB"
        );
        let frames = (0..count).map(|_| Box::new([0u8; PAGE_SIZE as usize])).collect();
        let free = (first..first + count).rev().map(PhysicalFrame::from_number).collect();
        debug!("ram frames {first:#x}..{:#x}", first + count);
        Self { first, frames, free }
    }

    /// Whether `frame` belongs to this allocator's range.
    #[must_use]
    pub fn owns(&self, frame: PhysicalFrame) -> bool {
        frame.number() >= self.first && ((frame.number() - self.first) as usize) < self.frames.len()
    }

    /// Take frames until only `keep` remain free, simulating memory pressure.
    pub fn reserve_all_but(&mut self, keep: usize) -> Vec<PhysicalFrame> {
        let n = self.free.len().saturating_sub(keep);
        let at = self.free.len() - n;
        self.free.split_off(at)
    }

    /// Give back frames taken with [`reserve_all_but`](Self::reserve_all_but).
    pub fn release(&mut self, frames: Vec<PhysicalFrame>) {
        for f in frames {
            self.free_frame(f);
        }
    }

    fn slot(&self, frame: PhysicalFrame) -> usize {
        assert!(self.owns(frame), "{frame} not managed by this allocator");
        (frame.number() - self.first) as usize
    }
}

impl FrameAlloc for RamFrames {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        let f = self.free.pop();
        trace!("kalloc -> {f:?}");
        f
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        let _ = self.slot(frame);
        assert!(!self.free.contains(&frame), "kfree: {frame} freed twice");
        self.free.push(frame);
    }

    fn frame_limit(&self) -> u32 {
        self.first + self.frames.len() as u32
    }

    fn free_frames(&self) -> usize {
        self.free.len()
    }
}

impl PhysMapper for RamFrames {
    fn frame(&self, frame: PhysicalFrame) -> &Frame {
        &self.frames[self.slot(frame)]
    }

    fn frame_mut(&mut self, frame: PhysicalFrame) -> &mut Frame {
        let i = self.slot(frame);
        &mut self.frames[i]
    }
}
