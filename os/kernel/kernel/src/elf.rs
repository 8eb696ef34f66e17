//! # ELF32 headers
//!
//! Just enough of the format to load a statically linked i386 executable:
//! the file header and program headers, decoded from little-endian bytes
//! without allocation.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ElfError {
    #[error("file too short for an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 32-bit ELF file")]
    BadClass,
    #[error("not a little-endian ELF file")]
    BadEncoding,
    #[error("not an i386 executable")]
    BadMachine,
    #[error("malformed ELF header")]
    BadHeader,
    #[error("program header is not loadable")]
    NotLoadable,
    #[error("malformed loadable segment")]
    BadSegment,
}

/// Size of the ELF32 file header.
pub const EHDR_SIZE: usize = 52;
/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

pub const ELF_MAGIC: [u8; 4] = *b"\x7FELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Eh32 {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: VirtualAddress,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

#[derive(Copy, Clone, Debug)]
pub struct Ph32 {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_paddr: PhysicalAddress,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: PFlags,
    pub p_align: u32,
}

/// `Elf32_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool, // PF_X = 1
    #[bits(1)]
    pub write: bool, // PF_W = 2
    #[bits(1)]
    pub read: bool, // PF_R = 4
    #[bits(29)]
    __: u32,
}

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

/// Decode and validate the file header.
///
/// # Errors
/// The first check that fails, in file order.
pub fn elf32_header(bytes: &[u8]) -> Result<Eh32, ElfError> {
    use ElfError::{BadClass, BadEncoding, BadHeader, BadMachine, BadMagic, TooShort};
    if bytes.len() < EHDR_SIZE {
        return Err(TooShort);
    }

    // e_ident
    if bytes[0..4] != ELF_MAGIC {
        return Err(BadMagic);
    }

    if bytes[4] != ELFCLASS32 {
        return Err(BadClass);
    }

    if bytes[5] != ELFDATA2LSB {
        return Err(BadEncoding);
    }

    let eh = Eh32 {
        e_type: le16(&bytes[16..18]),
        e_machine: le16(&bytes[18..20]),
        e_version: le32(&bytes[20..24]),
        e_entry: VirtualAddress::new(le32(&bytes[24..28])),
        e_phoff: le32(&bytes[28..32]),
        e_shoff: le32(&bytes[32..36]),
        e_flags: le32(&bytes[36..40]),
        e_ehsize: le16(&bytes[40..42]),
        e_phentsize: le16(&bytes[42..44]),
        e_phnum: le16(&bytes[44..46]),
    };

    if eh.e_machine != EM_386 {
        return Err(BadMachine);
    }

    if usize::from(eh.e_phentsize) != PHDR_SIZE || eh.e_phnum == 0 {
        return Err(BadHeader);
    }

    Ok(eh)
}

impl Ph32 {
    /// Decode one program header.
    ///
    /// # Errors
    /// [`ElfError::TooShort`] if `bytes` holds less than one header.
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        let s = bytes.get(..PHDR_SIZE).ok_or(ElfError::TooShort)?;
        Ok(Self {
            p_type: le32(&s[0..4]),
            p_offset: le32(&s[4..8]),
            p_vaddr: VirtualAddress::new(le32(&s[8..12])),
            p_paddr: PhysicalAddress::new(le32(&s[12..16])),
            p_filesz: le32(&s[16..20]),
            p_memsz: le32(&s[20..24]),
            p_flags: PFlags::from_bits(le32(&s[24..28])),
            p_align: le32(&s[28..32]),
        })
    }

    /// Check that this header describes a segment the loader can place:
    /// `PT_LOAD`, `memsz >= filesz`, no wrap-around, page aligned `vaddr`.
    ///
    /// Returns the end of the segment in memory.
    ///
    /// # Errors
    /// [`ElfError::NotLoadable`] or [`ElfError::BadSegment`].
    pub fn loadable_end(&self) -> Result<VirtualAddress, ElfError> {
        if self.p_type != PT_LOAD {
            return Err(ElfError::NotLoadable);
        }
        if self.p_memsz < self.p_filesz || !self.p_vaddr.is_page_aligned() {
            return Err(ElfError::BadSegment);
        }
        self.p_vaddr.checked_add(self.p_memsz).ok_or(ElfError::BadSegment)
    }
}
