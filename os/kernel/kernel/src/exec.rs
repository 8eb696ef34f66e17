//! # Loading a program image
//!
//! [`Kernel::exec`] builds the new image in a fresh address space and only
//! swaps it in once nothing can fail any more. The resulting user layout:
//!
//! ```text
//!  0 ─ text+data ─ roundup ┌ guard (unmapped) ┐┌ stack page ┐ heap ──►
//!                          │◄─ max_stack_size ──────────────►│
//!                                                  stack top = heap start
//! ```
//!
//! The initial stack, from the top down: the argument strings (each
//! 4-byte aligned), then `argv[argc] = 0`, `argv[0..argc]`, the `argv`
//! pointer, `argc` and a fake return address.

use crate::elf::{EHDR_SIZE, ElfError, PHDR_SIZE, Ph32, elf32_header};
use crate::platform::{FileSystem, Inode};
use crate::proc::Process;
use crate::trap::TrapFrame;
use crate::{Cpu, Kernel};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use kernel_vmem::{AddressSpace, FrameAlloc, MmArea, PhysMapper, PhysicalMemory, TranslationCache, VmError};
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("file not found")]
    NotFound,
    #[error("short read from program file")]
    ShortRead,
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("too many arguments")]
    TooManyArgs,
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Fake return address at the bottom of the initial stack.
const FAKE_RETURN: u32 = 0xffff_ffff;

/// Regions and registers of an image built but not yet committed.
struct Image {
    text_data: MmArea,
    stack: MmArea,
    heap: MmArea,
    entry: VirtualAddress,
    sp: VirtualAddress,
}

impl<M: FrameAlloc + PhysMapper> Kernel<M> {
    /// Replace the image of `proc` with the program at `path`.
    ///
    /// On success `tf` enters the new program at its entry point with the
    /// argument stack described in the module docs, the new space is active
    /// on `cpu` and the old space has been destroyed. The alarm is cleared,
    /// since its handler belonged to the old image.
    ///
    /// # Errors
    /// Any [`ExecError`]. The process is untouched in that case.
    pub fn exec<F: FileSystem + ?Sized>(
        &self,
        cpu: &mut Cpu,
        tf: &mut TrapFrame,
        proc: &mut Process,
        fs: &mut F,
        path: &str,
        argv: &[&str],
    ) -> Result<(), ExecError> {
        let node = fs.find_file(path).ok_or(ExecError::NotFound)?;
        if argv.len() > self.layout.max_args {
            return Err(ExecError::TooManyArgs);
        }

        let mut space =
            self.with_memory(cpu, |mem| AddressSpace::new_user(mem, self.kernel_space()))?;
        let image = match self.build_image(cpu, &mut space, fs, node, argv) {
            Ok(built) => built,
            Err(e) => {
                debug!("exec {path}: {e}");
                self.with_memory(cpu, |mem| space.destroy(mem));
                return Err(e);
            }
        };
        let Image {
            text_data,
            stack,
            heap,
            entry,
            sp,
        } = image;

        // Commit.
        let old = proc.space.replace(space);
        proc.text_data = text_data;
        proc.stack = stack;
        proc.heap = heap;
        proc.alarm.clear();
        proc.set_name(path);
        tf.eip = entry.as_u32();
        tf.esp = sp.as_u32();
        if let Some(space) = &proc.space {
            cpu.activate(space.root());
        }
        if let Some(old) = old {
            self.with_memory(cpu, |mem| old.destroy(mem));
        }

        info!(
            "pid {} exec {path}: entry {entry}, {} bytes of text+data, sp {sp}",
            proc.pid(),
            text_data.size
        );
        Ok(())
    }

    /// Fill `space` with the program in `node`. The `kmem` lock is taken
    /// for each memory step and never held across a file read.
    fn build_image<F: FileSystem + ?Sized>(
        &self,
        cpu: &Cpu,
        space: &mut AddressSpace,
        fs: &mut F,
        node: Inode,
        argv: &[&str],
    ) -> Result<Image, ExecError> {
        let mut eh = [0u8; EHDR_SIZE];
        if fs.read_file(node, &mut eh, 0) != EHDR_SIZE {
            return Err(ExecError::ShortRead);
        }
        let eh = elf32_header(&eh)?;

        // Only the first program header is loaded.
        let mut ph = [0u8; PHDR_SIZE];
        if fs.read_file(node, &mut ph, eh.e_phoff) != PHDR_SIZE {
            return Err(ExecError::ShortRead);
        }
        let ph = Ph32::parse(&ph)?;
        let text_end = ph.loadable_end()?;
        if text_end.as_u32() > self.layout.kernel_base {
            return Err(VmError::InvalidAddress(text_end).into());
        }

        self.with_memory(cpu, |mem| space.grow(mem, VirtualAddress::zero(), text_end))?;
        self.load_segment(cpu, space, fs, node, &ph)?;
        let text_data = MmArea::new(VirtualAddress::zero(), text_end.as_u32());

        // The stack window starts right after the image and holds the guard
        // page plus up to max_stack_size bytes; one page is mapped up front.
        let stack_top = align_up(text_end.as_u32(), PAGE_SIZE)
            .and_then(|a| a.checked_add(self.layout.max_stack_size))
            .and_then(|a| a.checked_add(PAGE_SIZE))
            .filter(|&top| top <= self.layout.kernel_base)
            .ok_or(VmError::InvalidAddress(text_end))?;
        let stack_start = VirtualAddress::new(stack_top - PAGE_SIZE);
        let sp = self.with_memory(cpu, |mem| {
            space.grow(mem, stack_start, VirtualAddress::new(stack_top))?;
            push_arguments(mem, space, VirtualAddress::new(stack_top), argv)
        })?;
        let stack = MmArea::new(stack_start, PAGE_SIZE);
        let heap = MmArea::new(VirtualAddress::new(stack_top), 0);

        Ok(Image {
            text_data,
            stack,
            heap,
            entry: eh.e_entry,
            sp,
        })
    }

    /// Read the file bytes of `ph` into the pages already mapped for it,
    /// one page at a time through a bounce buffer. The rest of the segment
    /// stays zero.
    fn load_segment<F: FileSystem + ?Sized>(
        &self,
        cpu: &Cpu,
        space: &AddressSpace,
        fs: &mut F,
        node: Inode,
        ph: &Ph32,
    ) -> Result<(), ExecError> {
        let mut page = Box::new([0u8; PAGE_SIZE as usize]);
        let mut done = 0;
        while done < ph.p_filesz {
            let va = VirtualAddress::new(ph.p_vaddr.as_u32() + done);
            let frame = space.user_frame(va)?;
            let n = (ph.p_filesz - done).min(PAGE_SIZE) as usize;
            let offset = ph.p_offset.checked_add(done).ok_or(ExecError::ShortRead)?;
            let buf = &mut page[..n];
            if fs.read_file(node, buf, offset) != n {
                return Err(ExecError::ShortRead);
            }
            self.with_memory(cpu, |mem| mem.frame_mut(frame)[..n].copy_from_slice(buf));
            done += PAGE_SIZE;
        }
        Ok(())
    }
}

/// Lay out `argv` below `top` and return the initial stack pointer.
fn push_arguments<M: FrameAlloc + PhysMapper>(
    mem: &mut PhysicalMemory<M>,
    space: &AddressSpace,
    top: VirtualAddress,
    argv: &[&str],
) -> Result<VirtualAddress, ExecError> {
    let overflow = || ExecError::Vm(VmError::InvalidAddress(top));
    let mut sp = top.as_u32();
    let mut pointers: Vec<u32> = Vec::with_capacity(argv.len() + 4);
    pointers.push(FAKE_RETURN);
    pointers.push(argv.len() as u32);
    pointers.push(0); // argv, patched below

    let mut bytes = Vec::new();
    for arg in argv {
        let len = u32::try_from(arg.len()).map_err(|_| overflow())?;
        sp = sp.checked_sub(len + 1).ok_or_else(overflow)? & !3;
        bytes.clear();
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);
        space.copy_out(mem, VirtualAddress::new(sp), &bytes)?;
        pointers.push(sp);
    }
    pointers.push(0);

    let words = pointers.len() as u32;
    sp = sp.checked_sub(words * 4).ok_or_else(overflow)?;
    pointers[2] = sp + 3 * 4;

    let frame: Vec<u8> = pointers.iter().flat_map(|w| w.to_le_bytes()).collect();
    space.copy_out(mem, VirtualAddress::new(sp), &frame)?;
    Ok(VirtualAddress::new(sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualPage;

    #[test]
    fn error_conversions() {
        assert_eq!(ExecError::from(ElfError::BadMagic), ExecError::Elf(ElfError::BadMagic));
        assert_eq!(
            ExecError::from(VmError::OutOfMemory),
            ExecError::Vm(VmError::OutOfMemory)
        );
    }

    #[test]
    fn guard_page_stays_below_the_stack_page() {
        let stack = MmArea::new(VirtualAddress::new(0x1_1000), PAGE_SIZE);
        assert_eq!(
            stack.guard_page().map(VirtualPage::base),
            Some(VirtualAddress::new(0x1_0000))
        );
    }
}
