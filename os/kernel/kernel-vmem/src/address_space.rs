//! # Address Space (32-bit x86, two-level)
//!
//! One page directory plus the arena of second-level tables it names.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new_kernel`] builds the kernel template from the fixed
//!   [`KernelRegion`] list; [`AddressSpace::new_user`] creates a user space
//!   whose kernel half refers to the template's tables.
//! - [`AddressSpace::resolve`] walks to the leaf entry of an address,
//!   optionally creating the missing table.
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] install and clear single
//!   counted mappings; [`AddressSpace::map_region`] installs the uncounted
//!   kernel mapping.
//! - [`AddressSpace::grow`] / [`AddressSpace::shrink`] work on whole ranges
//!   and [`AddressSpace::destroy`] tears everything down.
//! - [`AddressSpace::copy_out`] / [`AddressSpace::copy_in`] move bytes to and
//!   from user pages of a space that need not be the active one.
//!
//! ## Design
//!
//! - Tables live in a `BTreeMap` keyed by the frame allocated for them; the
//!   directory entry stores that frame number exactly as the hardware would.
//! - Directory entries for user tables are created `Present | Writable |
//!   User`; the leaf entries restrict access.
//! - Mutating the active space requires TLB maintenance by the caller (see
//!   [`TranslationCache`](crate::TranslationCache)).

use crate::{FrameAlloc, PageDirectory, PageEntryBits, PageTable, PhysMapper, PhysicalMemory, VmError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_info::memory::{KernelRegion, MemoryLayout};
use kernel_memory_addresses::{
    DirIndex, PAGE_SIZE, PhysicalAddress, PhysicalFrame, TABLE_SPAN, TableIndex, VirtualAddress,
    VirtualPage, align_down,
};
use log::{debug, trace};

/// Handle to a single, concrete address space.
pub struct AddressSpace {
    /// Frame backing the page directory (the value loaded into CR3).
    root: PhysicalFrame,
    directory: Box<PageDirectory>,
    /// Tables owned by this space, keyed by their frame.
    tables: BTreeMap<PhysicalFrame, Box<PageTable>>,
    /// Template whose tables back the kernel half; `None` for the template itself.
    kernel: Option<Arc<AddressSpace>>,
    /// First kernel address.
    user_end: u32,
}

/// What a single-page unmap found.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Unmapped {
    /// No second-level table covers the address.
    NoTable,
    /// The entry was not present.
    Absent,
    /// A mapping was cleared.
    Cleared,
}

impl AddressSpace {
    /// Build the kernel template: a directory holding the fixed kernel
    /// mapping of `layout` and nothing else.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a table frame cannot be allocated. No
    /// frames are leaked in that case.
    pub fn new_kernel<M: FrameAlloc + PhysMapper>(
        mem: &mut PhysicalMemory<M>,
        layout: &MemoryLayout,
    ) -> Result<Self, VmError> {
        let mut space = Self {
            root: mem.alloc_table_frame()?,
            directory: Box::new(PageDirectory::zeroed()),
            tables: BTreeMap::new(),
            kernel: None,
            user_end: layout.kernel_base,
        };

        for KernelRegion {
            virt,
            phys_start,
            length,
            writable,
        } in layout.kernel_regions()
        {
            let perm = PageEntryBits::new().with_writable(writable);
            if let Err(e) = space.map_region(mem, virt, length, phys_start, perm) {
                space.destroy(mem);
                return Err(e);
            }
        }

        debug!(
            "kernel template at {} with {} tables",
            space.root,
            space.tables.len()
        );
        Ok(space)
    }

    /// A fresh user address space sharing the kernel half of `kernel`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the directory frame cannot be allocated.
    pub fn new_user<M: FrameAlloc + PhysMapper>(
        mem: &mut PhysicalMemory<M>,
        kernel: &Arc<Self>,
    ) -> Result<Self, VmError> {
        let root = mem.alloc_table_frame()?;
        let mut directory = Box::new(PageDirectory::zeroed());
        let first_kernel_dir = VirtualAddress::new(kernel.user_end).dir_index();
        for d in DirIndex::all().filter(|&d| d >= first_kernel_dir) {
            directory.set(d, kernel.directory.get(d));
        }
        Ok(Self {
            root,
            directory,
            tables: BTreeMap::new(),
            kernel: Some(Arc::clone(kernel)),
            user_end: kernel.user_end,
        })
    }

    /// Frame of the page directory.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// The kernel template this space shares its kernel half with.
    #[inline]
    #[must_use]
    pub const fn kernel_template(&self) -> Option<&Arc<Self>> {
        self.kernel.as_ref()
    }

    /// First address of the kernel half.
    #[inline]
    #[must_use]
    pub const fn user_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.user_end)
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// Number of second-level tables owned by this space.
    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Whether directory slot `d` belongs to the shared kernel half.
    #[inline]
    fn is_shared(&self, d: DirIndex) -> bool {
        self.kernel.is_some() && d >= VirtualAddress::new(self.user_end).dir_index()
    }

    fn table(&self, d: DirIndex) -> Option<&PageTable> {
        let pde = self.directory.get(d);
        if !pde.present() {
            return None;
        }
        let arena = match &self.kernel {
            Some(k) if self.is_shared(d) => &k.tables,
            _ => &self.tables,
        };
        let Some(t) = arena.get(&pde.frame()) else {
            panic!("walkpgdir: directory slot {} names unknown table {}", d.as_usize(), pde.frame());
        };
        Some(t)
    }

    /// Read-only lookup of the leaf entry for `va`.
    ///
    /// Returns `None` if no table covers `va`. The entry itself may be
    /// non-present.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.table(va.dir_index()).map(|t| t.get(va.table_index()))
    }

    /// Translate `va` to the physical address it is mapped to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let e = self.entry(va)?;
        e.present()
            .then(|| e.frame().base().wrapping_add(va.page_offset()))
    }

    /// Locate the leaf entry for `va`, creating its table if
    /// `allocate_missing` is set.
    ///
    /// # Errors
    /// - [`VmError::InvalidAddress`] for addresses in the shared kernel half.
    /// - [`VmError::Unmapped`] if the table is absent and `allocate_missing`
    ///   is false.
    /// - [`VmError::OutOfMemory`] if the table frame cannot be allocated.
    pub fn resolve<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
        allocate_missing: bool,
    ) -> Result<&mut PageEntryBits, VmError> {
        let d = va.dir_index();
        if self.is_shared(d) {
            return Err(VmError::InvalidAddress(va));
        }

        let pde = self.directory.get(d);
        let frame = if pde.present() {
            pde.frame()
        } else {
            if !allocate_missing {
                return Err(VmError::Unmapped(va));
            }
            let frame = mem.alloc_table_frame()?;
            self.tables.insert(frame, Box::new(PageTable::zeroed()));
            self.directory.set(d, PageEntryBits::table_link(frame));
            trace!("new page table {frame} for {}", VirtualAddress::from_indices(d, TableIndex::new(0)));
            frame
        };

        let Some(table) = self.tables.get_mut(&frame) else {
            panic!("walkpgdir: directory slot {} names unknown table {frame}", d.as_usize());
        };
        Ok(table.entry_mut(va.table_index()))
    }

    /// Map the page containing `va` to `frame` with permission bits `perm`.
    ///
    /// The frame's count is raised before any previous mapping at `va` is
    /// dropped, so remapping a page to its own frame is safe.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn map<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
        frame: PhysicalFrame,
        perm: PageEntryBits,
    ) -> Result<(), VmError> {
        debug_assert!(!(perm.writable() && perm.copy_on_write()));
        let pte = self.resolve(mem, va, true)?;
        let old = *pte;
        *pte = perm.flags().with_present(true).with_frame(frame);
        mem.incref(frame);
        if old.present() {
            mem.decref(old.frame());
        }
        Ok(())
    }

    /// Clear the mapping of the page containing `va`. Absent mappings are
    /// not an error.
    pub fn unmap<M: FrameAlloc + PhysMapper>(&mut self, mem: &mut PhysicalMemory<M>, va: VirtualAddress) {
        let _ = self.unmap_page(mem, va);
    }

    fn unmap_page<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
    ) -> Unmapped {
        let pte = match self.resolve(mem, va, false) {
            Ok(pte) => pte,
            Err(_) => return Unmapped::NoTable,
        };
        if !pte.present() {
            return Unmapped::Absent;
        }
        let frame = pte.frame();
        *pte = PageEntryBits::new();
        mem.decref(frame);
        Unmapped::Cleared
    }

    /// Rewrite the leaf entry of an existing mapping without touching
    /// reference counts. Returns the previous entry.
    ///
    /// # Errors
    /// - [`VmError::Unmapped`] if `va` has no present mapping.
    /// - [`VmError::InvalidAddress`] for the shared kernel half.
    pub fn update<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
        f: impl FnOnce(PageEntryBits) -> PageEntryBits,
    ) -> Result<PageEntryBits, VmError> {
        let pte = self.resolve(mem, va, false)?;
        let old = *pte;
        if !old.present() {
            return Err(VmError::Unmapped(va));
        }
        let new = f(old);
        debug_assert_eq!(new.frame(), old.frame(), "update must not change the frame");
        *pte = new;
        Ok(old)
    }

    /// Bulk mapping of `[va, va + length)` onto `[phys, phys + length)`.
    ///
    /// Used only for the fixed kernel mapping: reference counts are not
    /// touched and the frames are never freed through this space.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn map_region<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
        length: u32,
        phys: PhysicalAddress,
        perm: PageEntryBits,
    ) -> Result<(), VmError> {
        let pages = length / PAGE_SIZE;
        let mut va = va;
        let mut pa = phys;
        for _ in 0..pages {
            let pte = self.resolve(mem, va, true)?;
            *pte = perm.flags().with_present(true).with_frame(pa.frame());
            va = VirtualAddress::new(va.as_u32().wrapping_add(PAGE_SIZE));
            pa = pa.wrapping_add(PAGE_SIZE);
        }
        Ok(())
    }

    /// Back every page of `[start, end)` with a fresh zero-filled frame,
    /// mapped writable and user-accessible.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] (or an address error) after unmapping every
    /// page this call mapped.
    pub fn grow<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmError> {
        for page in VirtualPage::range(start, end) {
            if let Err(e) = self.grow_one(mem, page.base()) {
                debug!("allocuvm failed at {page}: {e}");
                self.shrink(mem, start, page.base());
                return Err(e);
            }
        }
        Ok(())
    }

    fn grow_one<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
    ) -> Result<(), VmError> {
        let frame = mem.alloc_zeroed()?;
        if let Err(e) = self.map(mem, va, frame, PageEntryBits::user_rw()) {
            mem.free_unreferenced(frame);
            return Err(e);
        }
        Ok(())
    }

    /// Unmap every page of `[start, end)`, skipping a whole table's span at
    /// a time where no table exists. The shared kernel half is never touched.
    pub fn shrink<M: FrameAlloc + PhysMapper>(
        &mut self,
        mem: &mut PhysicalMemory<M>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        let end = if self.kernel.is_some() {
            end.as_u32().min(self.user_end)
        } else {
            end.as_u32()
        };
        let mut a = align_down(start.as_u32(), PAGE_SIZE);
        while a < end {
            let next = match self.unmap_page(mem, VirtualAddress::new(a)) {
                Unmapped::NoTable => align_down(a, TABLE_SPAN).checked_add(TABLE_SPAN),
                Unmapped::Absent | Unmapped::Cleared => a.checked_add(PAGE_SIZE),
            };
            match next {
                Some(n) => a = n,
                None => break,
            }
        }
    }

    /// Unmap the whole user range, free every owned table and the
    /// directory.
    pub fn destroy<M: FrameAlloc + PhysMapper>(mut self, mem: &mut PhysicalMemory<M>) {
        if self.kernel.is_some() {
            self.shrink(mem, VirtualAddress::zero(), VirtualAddress::new(self.user_end));
        }
        let tables = core::mem::take(&mut self.tables);
        debug!("freevm {}: {} tables", self.root, tables.len());
        for frame in tables.into_keys() {
            mem.free_table_frame(frame);
        }
        mem.free_table_frame(self.root);
    }

    /// Present, user-accessible mappings of the user half, ascending.
    pub fn user_pages(&self) -> impl Iterator<Item = (VirtualAddress, PageEntryBits)> + '_ {
        let first_kernel_dir = VirtualAddress::new(self.user_end).dir_index();
        DirIndex::all()
            .filter(move |&d| d < first_kernel_dir || self.kernel.is_none())
            .filter_map(move |d| self.table(d).map(|t| (d, t)))
            .flat_map(|(d, t)| t.present().map(move |(i, e)| (VirtualAddress::from_indices(d, i), e)))
            .filter(|(_, e)| e.user_access())
    }

    /// Present user mappings inside `[start, end)`.
    pub fn user_pages_in(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> impl Iterator<Item = (VirtualAddress, PageEntryBits)> + '_ {
        let start = VirtualAddress::new(align_down(start.as_u32(), PAGE_SIZE));
        self.user_pages()
            .skip_while(move |&(va, _)| va < start)
            .take_while(move |&(va, _)| va < end)
    }

    /// Frame backing the present, user-accessible page containing `va`.
    ///
    /// # Errors
    /// [`VmError::Unmapped`] if `va` is not a present user page.
    pub fn user_frame(&self, va: VirtualAddress) -> Result<PhysicalFrame, VmError> {
        match self.entry(va) {
            Some(e) if e.present() && e.user_access() => Ok(e.frame()),
            _ => Err(VmError::Unmapped(va)),
        }
    }

    /// Copy `bytes` to user address `va` in this space.
    ///
    /// Only present, user-accessible and writable pages are written; a
    /// copy-on-write page is read-only here and must be resolved first.
    ///
    /// # Errors
    /// - [`VmError::Unmapped`] for an absent or kernel-only page.
    /// - [`VmError::ReadOnly`] for a read-only or copy-on-write page.
    /// - [`VmError::InvalidAddress`] if the range wraps around.
    pub fn copy_out<M: FrameAlloc + PhysMapper>(
        &self,
        mem: &mut PhysicalMemory<M>,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        let mut va = va;
        let mut rest = bytes;
        while !rest.is_empty() {
            let e = match self.entry(va) {
                Some(e) if e.present() && e.user_access() => e,
                _ => return Err(VmError::Unmapped(va)),
            };
            if !e.writable() {
                return Err(VmError::ReadOnly(va));
            }
            let off = va.page_offset() as usize;
            let n = rest.len().min(PAGE_SIZE as usize - off);
            mem.frame_mut(e.frame())[off..off + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
            va = va
                .page()
                .next()
                .ok_or(VmError::InvalidAddress(va))?
                .base();
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes from user address `va` into `buf`.
    ///
    /// # Errors
    /// - [`VmError::Unmapped`] for an absent or kernel-only page.
    /// - [`VmError::InvalidAddress`] if the range wraps around.
    pub fn copy_in<M: FrameAlloc + PhysMapper>(
        &self,
        mem: &PhysicalMemory<M>,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut va = va;
        let mut done = 0;
        while done < buf.len() {
            let frame = self.user_frame(va)?;
            let off = va.page_offset() as usize;
            let n = (buf.len() - done).min(PAGE_SIZE as usize - off);
            buf[done..done + n].copy_from_slice(&mem.frame(frame)[off..off + n]);
            done += n;
            if done == buf.len() {
                break;
            }
            va = va
                .page()
                .next()
                .ok_or(VmError::InvalidAddress(va))?
                .base();
        }
        Ok(())
    }

    /// Read a little-endian word from user memory.
    ///
    /// # Errors
    /// See [`copy_in`](Self::copy_in).
    pub fn read_u32<M: FrameAlloc + PhysMapper>(
        &self,
        mem: &PhysicalMemory<M>,
        va: VirtualAddress,
    ) -> Result<u32, VmError> {
        let mut word = [0u8; 4];
        self.copy_in(mem, va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("tables", &self.tables.len())
            .field("shares_kernel", &self.kernel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{SMALL, TestPhys, assert_refcounts_match};

    fn setup(frames: u32) -> (PhysicalMemory<TestPhys>, Arc<AddressSpace>) {
        let mut mem = PhysicalMemory::new(TestPhys::with_frames(frames));
        let kernel = Arc::new(AddressSpace::new_kernel(&mut mem, &SMALL).unwrap());
        (mem, kernel)
    }

    fn va(a: u32) -> VirtualAddress {
        VirtualAddress::new(a)
    }

    #[test]
    fn kernel_template_maps_fixed_regions_without_counting() {
        let (mem, kernel) = setup(16);
        // One table for the low 4 MiB of the kernel half, one for devices.
        assert_eq!(kernel.table_count(), 2);
        assert_eq!(kernel.translate(va(0x4000_0123)), Some(PhysicalAddress::new(0x123)));
        assert_eq!(kernel.translate(va(0x4020_0000)), Some(PhysicalAddress::new(0x20_0000)));
        assert_eq!(kernel.translate(va(0xFFFF_F004)), Some(PhysicalAddress::new(0xFFFF_F004)));
        let text = kernel.entry(va(0x4010_0000)).unwrap();
        assert!(text.present() && !text.writable() && !text.user_access());
        assert_eq!(mem.refs().referenced().count(), 0);
    }

    #[test]
    fn user_space_shares_kernel_half() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        assert_eq!(user.translate(va(0x4000_1000)), kernel.translate(va(0x4000_1000)));
        assert_eq!(user.table_count(), 0);
        assert_eq!(
            user.resolve(&mut mem, va(0x4000_0000), true).err(),
            Some(VmError::InvalidAddress(va(0x4000_0000)))
        );
        user.destroy(&mut mem);
    }

    #[test]
    fn resolve_without_allocation_reports_missing_table() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        assert_eq!(
            user.resolve(&mut mem, va(0x1000), false).err(),
            Some(VmError::Unmapped(va(0x1000)))
        );
        assert!(!user.resolve(&mut mem, va(0x1000), true).unwrap().present());
        assert_eq!(user.table_count(), 1);
        user.destroy(&mut mem);
    }

    #[test]
    fn map_replaces_previous_mapping() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        let a = mem.alloc_zeroed().unwrap();
        let b = mem.alloc_zeroed().unwrap();
        let free_before = mem.free_frames();

        user.map(&mut mem, va(0x5000), a, PageEntryBits::user_rw()).unwrap();
        assert_eq!(mem.refcount(a), 1);
        // Remap onto itself keeps the frame alive.
        user.map(&mut mem, va(0x5000), a, PageEntryBits::user_rw()).unwrap();
        assert_eq!(mem.refcount(a), 1);

        user.map(&mut mem, va(0x5000), b, PageEntryBits::user_rw()).unwrap();
        assert_eq!(mem.refcount(a), 0);
        assert_eq!(mem.refcount(b), 1);
        // `a` went back to the allocator; one table frame was taken.
        assert_eq!(mem.free_frames(), free_before);
        assert_refcounts_match(&mem, &[&user]);
        user.destroy(&mut mem);
    }

    #[test]
    fn unmap_of_absent_page_is_a_no_op() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        let free = mem.free_frames();
        user.unmap(&mut mem, va(0x9000));
        assert_eq!(mem.free_frames(), free);
        user.destroy(&mut mem);
    }

    #[test]
    fn grow_rolls_back_on_exhaustion() {
        // 3 frames for the kernel template, 1 for the user directory,
        // 1 for the user table and 2 data pages.
        let (mut mem, kernel) = setup(7);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        let err = user.grow(&mut mem, va(0), va(4 * PAGE_SIZE)).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
        assert!(user.user_pages().next().is_none());
        assert_eq!(mem.refs().referenced().count(), 0);
        user.destroy(&mut mem);
        assert_eq!(mem.free_frames(), 4);
    }

    #[test]
    fn shrink_skips_missing_tables_and_keeps_counts_exact() {
        let (mut mem, kernel) = setup(32);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        user.grow(&mut mem, va(0), va(3 * PAGE_SIZE)).unwrap();
        user.grow(&mut mem, va(0x0080_0000), va(0x0080_2000)).unwrap();
        assert_eq!(user.user_pages().count(), 5);
        assert_refcounts_match(&mem, &[&user]);

        user.shrink(&mut mem, va(PAGE_SIZE), va(0x0080_1000));
        let left: alloc::vec::Vec<_> = user.user_pages().map(|(a, _)| a.as_u32()).collect();
        assert_eq!(left, [0, 0x0080_1000]);
        assert_refcounts_match(&mem, &[&user]);
        user.destroy(&mut mem);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let (mut mem, kernel) = setup(32);
        let free = mem.free_frames();
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        user.grow(&mut mem, va(0x003F_F000), va(0x0040_2000)).unwrap();
        assert_eq!(user.table_count(), 2);
        user.destroy(&mut mem);
        assert_eq!(mem.free_frames(), free);
        assert_eq!(mem.refs().referenced().count(), 0);
    }

    #[test]
    fn copy_out_and_in_span_pages() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        user.grow(&mut mem, va(0), va(2 * PAGE_SIZE)).unwrap();
        let data: alloc::vec::Vec<u8> = (0..32).collect();
        user.copy_out(&mut mem, va(PAGE_SIZE - 16), &data).unwrap();
        let mut back = [0u8; 32];
        user.copy_in(&mem, va(PAGE_SIZE - 16), &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        assert_eq!(user.read_u32(&mem, va(PAGE_SIZE)).unwrap(), u32::from_le_bytes([16, 17, 18, 19]));
        assert_eq!(
            user.copy_out(&mut mem, va(2 * PAGE_SIZE - 2), &data[..4]),
            Err(VmError::Unmapped(va(2 * PAGE_SIZE)))
        );
        user.destroy(&mut mem);
    }

    #[test]
    fn copy_out_refuses_read_only_pages() {
        let (mut mem, kernel) = setup(16);
        let mut user = AddressSpace::new_user(&mut mem, &kernel).unwrap();
        user.grow(&mut mem, va(0), va(PAGE_SIZE)).unwrap();
        user.update(&mut mem, va(0), PageEntryBits::downgraded_to_cow).unwrap();
        assert_eq!(user.copy_out(&mut mem, va(8), &[1]), Err(VmError::ReadOnly(va(8))));
        assert_eq!(
            user.copy_out(&mut mem, va(0x4000_0000), &[1]),
            Err(VmError::Unmapped(va(0x4000_0000)))
        );
        user.destroy(&mut mem);
    }
}
