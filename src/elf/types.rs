#![allow(non_camel_case_types)]

use std::mem::transmute;

use static_assertions::assert_eq_size;

type Elf32_Half = u16;
type Elf32_Word = u32;
type Elf32_Addr = u32;
type Elf32_Off = u32;

type Elf64_Half = u16;
type Elf64_Word = u32;
type Elf64_Xword = u64;
type Elf64_Addr = u64;
type Elf64_Off = u64;

pub const ELFMAG: [u8; 4] = *b"\x7fELF";
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFOSABI_LINUX: u8 = 3;
pub const ELFOSABI_ARM_AEABI: u8 = 64;
pub const EV_CURRENT: u32 = 1;

pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u32 = 1;
pub const SHF_ALLOC: u32 = 1 << 1;
pub const SHF_EXECINSTR: u32 = 1 << 2;

pub const EHDR32_SIZE: usize = 52;
pub const PHDR32_SIZE: usize = 32;
pub const SHDR32_SIZE: usize = 40;

pub const EHDR64_SIZE: usize = 64;
pub const PHDR64_SIZE: usize = 56;
pub const SHDR64_SIZE: usize = 64;

assert_eq_size!(Elf_Ident, [u8; 16]);
assert_eq_size!(Elf32_Ehdr, [u8; EHDR32_SIZE]);
assert_eq_size!(Elf32_Phdr, [u8; PHDR32_SIZE]);
assert_eq_size!(Elf32_Shdr, [u8; SHDR32_SIZE]);
assert_eq_size!(Elf64_Ehdr, [u8; EHDR64_SIZE]);
assert_eq_size!(Elf64_Phdr, [u8; PHDR64_SIZE]);
assert_eq_size!(Elf64_Shdr, [u8; SHDR64_SIZE]);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf_Ident {
    pub ei_mag: [u8; 4],
    pub ei_class: u8,
    pub ei_data: u8,
    pub ei_version: u8,
    pub ei_osabi: u8,
    pub ei_abiversion: u8,
    pub ei_pad: [u8; 7],
}

impl Elf_Ident {
    pub fn new(class: u8, osabi: u8) -> Elf_Ident {
        Elf_Ident {
            ei_mag: ELFMAG,
            ei_class: class,
            ei_data: ELFDATA2LSB,
            ei_version: EV_CURRENT as u8,
            ei_osabi: osabi,
            ei_abiversion: 0,
            ei_pad: [0; 7],
        }
    }
}

// ELF header
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf32_Ehdr {
    pub e_ident: Elf_Ident,
    pub e_type: Elf32_Half,
    pub e_machine: Elf32_Half,
    pub e_version: Elf32_Word,
    pub e_entry: Elf32_Addr,
    pub e_phoff: Elf32_Off,
    pub e_shoff: Elf32_Off,
    pub e_flags: Elf32_Word,
    pub e_ehsize: Elf32_Half,
    pub e_phentsize: Elf32_Half,
    pub e_phnum: Elf32_Half,
    pub e_shentsize: Elf32_Half,
    pub e_shnum: Elf32_Half,
    pub e_shstrndx: Elf32_Half,
}

// Program header
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf32_Phdr {
    pub p_type: Elf32_Word,
    pub p_offset: Elf32_Off,
    pub p_vaddr: Elf32_Addr,
    pub p_paddr: Elf32_Addr,
    pub p_filesz: Elf32_Word,
    pub p_memsz: Elf32_Word,
    pub p_flags: Elf32_Word,
    pub p_align: Elf32_Word,
}

// Section header
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf32_Shdr {
    pub sh_name: Elf32_Word,
    pub sh_type: Elf32_Word,
    pub sh_flags: Elf32_Word,
    pub sh_addr: Elf32_Addr,
    pub sh_offset: Elf32_Off,
    pub sh_size: Elf32_Word,
    pub sh_link: Elf32_Word,
    pub sh_info: Elf32_Word,
    pub sh_addralign: Elf32_Word,
    pub sh_entsize: Elf32_Word,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf64_Ehdr {
    pub e_ident: Elf_Ident,
    pub e_type: Elf64_Half,
    pub e_machine: Elf64_Half,
    pub e_version: Elf64_Word,
    pub e_entry: Elf64_Addr,
    pub e_phoff: Elf64_Off,
    pub e_shoff: Elf64_Off,
    pub e_flags: Elf64_Word,
    pub e_ehsize: Elf64_Half,
    pub e_phentsize: Elf64_Half,
    pub e_phnum: Elf64_Half,
    pub e_shentsize: Elf64_Half,
    pub e_shnum: Elf64_Half,
    pub e_shstrndx: Elf64_Half,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf64_Phdr {
    pub p_type: Elf64_Word,
    pub p_flags: Elf64_Word,
    pub p_offset: Elf64_Off,
    pub p_vaddr: Elf64_Addr,
    pub p_paddr: Elf64_Addr,
    pub p_filesz: Elf64_Xword,
    pub p_memsz: Elf64_Xword,
    pub p_align: Elf64_Xword,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Elf64_Shdr {
    pub sh_name: Elf64_Word,
    pub sh_type: Elf64_Word,
    pub sh_flags: Elf64_Xword,
    pub sh_addr: Elf64_Addr,
    pub sh_offset: Elf64_Off,
    pub sh_size: Elf64_Xword,
    pub sh_link: Elf64_Word,
    pub sh_info: Elf64_Word,
    pub sh_addralign: Elf64_Xword,
    pub sh_entsize: Elf64_Xword,
}

// All of these are plain little-endian integer records with no padding, so
// their in-memory layout is exactly the on-disk layout.
impl Elf32_Ehdr {
    pub fn to_bytes(self) -> [u8; EHDR32_SIZE] {
        unsafe { transmute(self) }
    }
}

impl Elf32_Phdr {
    pub fn to_bytes(self) -> [u8; PHDR32_SIZE] {
        unsafe { transmute(self) }
    }
}

impl Elf32_Shdr {
    pub fn to_bytes(self) -> [u8; SHDR32_SIZE] {
        unsafe { transmute(self) }
    }
}

impl Elf64_Ehdr {
    pub fn to_bytes(self) -> [u8; EHDR64_SIZE] {
        unsafe { transmute(self) }
    }
}

impl Elf64_Phdr {
    pub fn to_bytes(self) -> [u8; PHDR64_SIZE] {
        unsafe { transmute(self) }
    }
}

impl Elf64_Shdr {
    pub fn to_bytes(self) -> [u8; SHDR64_SIZE] {
        unsafe { transmute(self) }
    }
}
