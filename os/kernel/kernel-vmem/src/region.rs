//! # Process memory regions
//!
//! Every process has three [`MmArea`]s: text+data, stack and heap.
//!
//! ```text
//! 0 ─ text+data ─┐ gap ┌ guard ┐ stack ┌ heap ──► ... KERNBASE
//!                     stack.start     stack.end = heap.start
//! ```
//!
//! - The heap grows lazily: [`MmArea::grow_heap`] only moves the break and
//!   the page fault path maps pages on first touch. [`MmArea::shrink_heap`]
//!   reclaims eagerly.
//! - The stack has a fixed top and grows downward one page per guard-page
//!   touch, up to a maximum size.

use crate::{AddressSpace, FrameAlloc, PhysMapper, PhysicalMemory, VmError};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage, align_up};
use log::trace;

/// `{start, size, end}` of one region.
///
/// ### Invariants
/// - `end` is page aligned and `end >= start + size`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MmArea {
    /// First address of the region.
    pub start: VirtualAddress,
    /// Logical size in bytes.
    pub size: u32,
    /// Page-aligned end of the mapped (or mappable) range.
    pub end: VirtualAddress,
}

impl MmArea {
    /// A region of `size` bytes at `start`, with `end` rounded up.
    #[must_use]
    pub fn new(start: VirtualAddress, size: u32) -> Self {
        let top = start.as_u32().saturating_add(size);
        Self {
            start,
            size,
            end: VirtualAddress::new(align_up(top, PAGE_SIZE).unwrap_or(u32::MAX & !(PAGE_SIZE - 1))),
        }
    }

    /// `start + size`: the program break for the heap, the top for the stack.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u32().wrapping_add(self.size))
    }

    /// Whether `va` lies in `[start, start + size)`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.start.as_u32() && va.as_u32() < self.limit().as_u32()
    }

    /// Whether `va` lies in `[start, end)`.
    #[inline]
    #[must_use]
    pub const fn spans(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.start.as_u32() && va.as_u32() < self.end.as_u32()
    }

    /// Raise the heap size by `delta` bytes without allocating anything.
    ///
    /// # Errors
    /// [`VmError::InvalidDelta`] for a negative `delta` or when the new
    /// break would pass `limit`.
    pub fn grow_heap(&mut self, delta: i32, limit: VirtualAddress) -> Result<(), VmError> {
        let Ok(delta) = u32::try_from(delta) else {
            return Err(VmError::InvalidDelta(delta));
        };
        let new_top = u64::from(self.limit().as_u32()) + u64::from(delta);
        if new_top > u64::from(limit.as_u32()) {
            return Err(VmError::InvalidDelta(delta.cast_signed()));
        }
        self.size += delta;
        let rounded = align_up(self.limit().as_u32(), PAGE_SIZE).unwrap_or(limit.as_u32());
        if rounded > self.end.as_u32() {
            self.end = VirtualAddress::new(rounded);
        }
        trace!("heap grown by {delta} to {} (end {})", self.limit(), self.end);
        Ok(())
    }

    /// Lower the heap size by `-delta` bytes and unmap pages that fall
    /// entirely above the new break.
    ///
    /// # Errors
    /// [`VmError::InvalidDelta`] for a positive `delta` or when the size
    /// would drop below zero.
    pub fn shrink_heap<M: FrameAlloc + PhysMapper>(
        &mut self,
        delta: i32,
        space: &mut AddressSpace,
        mem: &mut PhysicalMemory<M>,
    ) -> Result<(), VmError> {
        if delta > 0 || delta.unsigned_abs() > self.size {
            return Err(VmError::InvalidDelta(delta));
        }
        self.size -= delta.unsigned_abs();
        let rounded = VirtualAddress::new(align_up(self.limit().as_u32(), PAGE_SIZE).unwrap_or(self.end.as_u32()));
        if rounded < self.end {
            let old_end = self.end;
            self.end = rounded;
            space.shrink(mem, rounded, old_end);
        }
        trace!("heap shrunk by {} to {} (end {})", delta.unsigned_abs(), self.limit(), self.end);
        Ok(())
    }

    /// The unmapped page directly below the stack.
    #[inline]
    #[must_use]
    pub const fn guard_page(&self) -> Option<VirtualPage> {
        VirtualPage::containing_address(self.start).previous()
    }

    /// Move the stack bottom one page down and return the page to map.
    ///
    /// # Errors
    /// [`VmError::StackLimit`] if the stack would exceed `max_size`.
    pub fn extend_down(&mut self, max_size: u32) -> Result<VirtualPage, VmError> {
        if u64::from(self.size) + u64::from(PAGE_SIZE) > u64::from(max_size) {
            return Err(VmError::StackLimit);
        }
        let page = self.guard_page().ok_or(VmError::StackLimit)?;
        self.start = page.base();
        self.size += PAGE_SIZE;
        Ok(page)
    }

    /// Undo [`extend_down`](Self::extend_down) when mapping the page failed.
    pub const fn retract_up(&mut self) {
        self.start = VirtualAddress::new(self.start.as_u32() + PAGE_SIZE);
        self.size -= PAGE_SIZE;
    }
}
