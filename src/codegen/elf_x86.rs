//! x86 (32-bit) ELF binary backend.
//!
//! Same file layout as the x86-64 backend with 32-bit header types. The
//! tape pointer lives in `ecx` and system calls go through `int 0x80`
//! (write=4, read=3, exit=1).

use super::{CodeBuffer, CodeGen};
use crate::elf::*;

const BASE_ADDR: u32 = 0x0404_8000;
const BSS_ADDR: u32 = 0x0424_8000;
const N_PROGRAM_HEADERS: u16 = 2;
const N_SECTION_HEADERS: u16 = 4;
const HEADER_SIZE: usize = EHDR32_SIZE + PHDR32_SIZE * N_PROGRAM_HEADERS as usize;
const FOOTER_SIZE: usize = SHDR32_SIZE * N_SECTION_HEADERS as usize;
const SHSTRTAB: [u8; 22] = *b"\0.text\0.shstrtbl\0.bss\0";

pub struct ElfX86Gen {
    buf: CodeBuffer,
    heap_size: usize,
}

impl ElfX86Gen {
    pub fn new(heap_size: usize) -> ElfX86Gen {
        ElfX86Gen {
            buf: CodeBuffer::new(),
            heap_size,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.into_bytes()
    }
}

impl CodeGen for ElfX86Gen {
    fn emit_header(&mut self) {
        self.buf.fill(HEADER_SIZE, 0);

        // mov ecx, {bss origin}
        self.buf.write(&[0xb9]);
        self.buf.write_u32(BSS_ADDR + (self.heap_size / 2) as u32);
    }

    fn emit_footer(&mut self) {
        self.emit_assign(i32::from(b'\n'));
        self.emit_putchar();

        // mov eax, 0x01; mov ebx, 0x00; int 0x80
        self.buf.write(&[0xb8]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0xbb]);
        self.buf.write_u32(0x00);
        self.buf.write(&[0xcd, 0x80]);

        let code_size = self.buf.tell() - HEADER_SIZE;

        self.buf.write(&SHSTRTAB);

        let shdr_null = Elf32_Shdr {
            sh_name: 0,
            sh_type: SHT_NULL,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_null.to_bytes());

        let shdr_shstrtbl = Elf32_Shdr {
            sh_name: 7,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: (HEADER_SIZE + code_size) as u32,
            sh_size: SHSTRTAB.len() as u32,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_shstrtbl.to_bytes());

        let shdr_text = Elf32_Shdr {
            sh_name: 1,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_EXECINSTR | SHF_ALLOC,
            sh_addr: BASE_ADDR + HEADER_SIZE as u32,
            sh_offset: HEADER_SIZE as u32,
            sh_size: code_size as u32,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 4,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_text.to_bytes());

        let shdr_bss = Elf32_Shdr {
            sh_name: 17,
            sh_type: SHT_NOBITS,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: BSS_ADDR,
            sh_offset: 0x1000,
            sh_size: self.heap_size as u32,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0x10,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_bss.to_bytes());

        self.buf.seek(0);

        let ehdr = Elf32_Ehdr {
            e_ident: Elf_Ident::new(ELFCLASS32, ELFOSABI_LINUX),
            e_type: ET_EXEC,
            e_machine: EM_386,
            e_version: EV_CURRENT,
            e_entry: BASE_ADDR + HEADER_SIZE as u32,
            e_phoff: EHDR32_SIZE as u32,
            e_shoff: (HEADER_SIZE + SHSTRTAB.len() + code_size) as u32,
            e_flags: 0,
            e_ehsize: EHDR32_SIZE as u16,
            e_phentsize: PHDR32_SIZE as u16,
            e_phnum: N_PROGRAM_HEADERS,
            e_shentsize: SHDR32_SIZE as u16,
            e_shnum: N_SECTION_HEADERS,
            e_shstrndx: 1,
        };
        self.buf.write(&ehdr.to_bytes());

        let file_size = (HEADER_SIZE + SHSTRTAB.len() + FOOTER_SIZE + code_size) as u32;
        let phdr_text = Elf32_Phdr {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: BASE_ADDR,
            p_paddr: BASE_ADDR,
            p_filesz: file_size,
            p_memsz: file_size,
            p_flags: PF_R | PF_X,
            p_align: 0x100,
        };
        self.buf.write(&phdr_text.to_bytes());

        let phdr_bss = Elf32_Phdr {
            p_type: PT_LOAD,
            p_offset: 0x1000,
            p_vaddr: BSS_ADDR,
            p_paddr: BSS_ADDR,
            p_filesz: 0,
            p_memsz: self.heap_size as u32,
            p_flags: PF_R | PF_W,
            p_align: 0x0020_0000,
        };
        self.buf.write(&phdr_bss.to_bytes());

        self.buf.seek_end();
    }

    fn emit_move_pointer(&mut self, offset: i32) {
        if offset > 0 {
            if offset == 1 {
                // inc ecx
                self.buf.write(&[0x41]);
            } else {
                // add ecx, {offset}
                self.buf.write(&[0x81, 0xc1]);
                self.buf.write_u32(offset as u32);
            }
        } else if offset == -1 {
            // dec ecx
            self.buf.write(&[0x49]);
        } else {
            // sub ecx, {-offset}
            self.buf.write(&[0x81, 0xe9]);
            self.buf.write_u32((-offset) as u32);
        }
    }

    fn emit_add(&mut self, value: i32) {
        if value > 0 {
            if value == 1 {
                // inc byte ptr [ecx]
                self.buf.write(&[0xfe, 0x01]);
            } else {
                // add byte ptr [ecx], {value}
                self.buf.write(&[0x80, 0x01, value as u8]);
            }
        } else if value == -1 {
            // dec byte ptr [ecx]
            self.buf.write(&[0xfe, 0x09]);
        } else {
            // sub byte ptr [ecx], {-value}
            self.buf.write(&[0x80, 0x29, (-value) as u8]);
        }
    }

    fn emit_putchar(&mut self) {
        // mov eax, 0x04; mov edx, 0x01; mov ebx, 0x01; int 0x80
        self.buf.write(&[0xb8]);
        self.buf.write_u32(0x04);
        self.buf.write(&[0xba]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0xbb]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0xcd, 0x80]);
    }

    fn emit_getchar(&mut self) {
        // mov eax, 0x03; mov edx, 0x01; mov ebx, 0x00; int 0x80
        self.buf.write(&[0xb8]);
        self.buf.write_u32(0x03);
        self.buf.write(&[0xba]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0xbb]);
        self.buf.write_u32(0x00);
        self.buf.write(&[0xcd, 0x80]);
    }

    fn emit_loop_start(&mut self) {
        self.buf.push_loop(self.buf.tell());
        // cmp byte ptr [ecx], 0x00
        self.buf.write(&[0x80, 0x39, 0x00]);
        // je {placeholder}
        self.buf.write(&[0x0f, 0x84]);
        self.buf.write_u32(0);
    }

    fn emit_loop_end(&mut self) {
        let pos = match self.buf.pop_loop() {
            Some(pos) => pos,
            None => return,
        };
        let offset = pos as i64 - self.buf.tell() as i64 - 1;
        if offset - 1 < -128 {
            // jmp {offset} (near jump)
            self.buf.write(&[0xe9]);
            self.buf.write_u32((offset - 4) as u32);
        } else {
            // jmp {offset} (short jump)
            self.buf.write(&[0xeb, (offset - 1) as u8]);
        }
        let cur = self.buf.tell();
        self.buf.seek(pos + 5);
        self.buf.write_u32((cur - (pos + 5) - 4) as u32);
        self.buf.seek_end();
    }

    fn emit_end_if(&mut self) {
        let pos = match self.buf.pop_loop() {
            Some(pos) => pos,
            None => return,
        };
        let cur = self.buf.tell();
        self.buf.seek(pos + 5);
        self.buf.write_u32((cur - (pos + 5) - 4) as u32);
        self.buf.seek_end();
    }

    fn emit_assign(&mut self, value: i32) {
        // mov byte ptr [ecx], {value}
        self.buf.write(&[0xc6, 0x01, value as u8]);
    }

    fn emit_add_var(&mut self, offset: i32) {
        // mov al, byte ptr [ecx]
        self.buf.write(&[0x8a, 0x01]);
        // add byte ptr [ecx + {offset}], al
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[0x00, 0x81]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[0x00, 0x41, offset as u8]);
        }
    }

    fn emit_sub_var(&mut self, offset: i32) {
        self.buf.write(&[0x8a, 0x01]);
        // sub byte ptr [ecx + {offset}], al
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[0x28, 0x81]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[0x28, 0x41, offset as u8]);
        }
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        // mov al, {|mul|}; mul byte ptr [ecx]
        self.buf.write(&[0xb0, mul.unsigned_abs() as u8]);
        self.buf.write(&[0xf6, 0x21]);
        let opcode = if mul > 0 { 0x00 } else { 0x28 };
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[opcode, 0x81]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[opcode, 0x41, offset as u8]);
        }
    }

    fn emit_inf_loop(&mut self) {
        self.emit_if();
        self.buf.write(&[0xeb, 0xfe]);
        self.emit_end_if();
    }

    fn emit_break_point(&mut self) {
        self.buf.write(&[0xcc]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emit;
    use crate::parser::parse;

    fn emit_bytes(src: &[u8]) -> Vec<u8> {
        let ir = parse(src).unwrap();
        let mut gen = ElfX86Gen::new(65536);
        emit(&mut gen, &ir);
        gen.finish()
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn header_fields_are_consistent_with_the_body() {
        let bytes = emit_bytes(b"+[>.]");
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], ELFCLASS32);
        assert_eq!(u16_at(&bytes, 18), EM_386);
        assert_eq!(u16_at(&bytes, 44), 2); // e_phnum
        assert_eq!(u16_at(&bytes, 48), 4); // e_shnum
        assert_eq!(u16_at(&bytes, 50), 1); // e_shstrndx
        assert_eq!(u32_at(&bytes, 24), BASE_ADDR + HEADER_SIZE as u32); // e_entry
    }

    #[test]
    fn bss_addresses_are_disjoint_from_text() {
        let bytes = emit_bytes(b"+");
        let phdr_bss = EHDR32_SIZE + PHDR32_SIZE;
        assert_eq!(u32_at(&bytes, phdr_bss + 8), BSS_ADDR); // p_vaddr
        assert_eq!(u32_at(&bytes, phdr_bss + 16), 0); // p_filesz
        assert_eq!(u32_at(&bytes, phdr_bss + 20), 65536); // p_memsz
        assert_eq!(u32_at(&bytes, phdr_bss + 28), 0x0020_0000); // p_align
    }

    #[test]
    fn no_forward_jump_placeholder_survives() {
        let bytes = emit_bytes(b"+[>[-]<-]");
        assert!(!bytes
            .windows(6)
            .any(|window| window == [0x0f, 0x84, 0, 0, 0, 0]));
    }

    #[test]
    fn syscall_thunks_use_int_0x80() {
        let bytes = emit_bytes(b".");
        assert!(bytes.windows(2).any(|w| w == [0xcd, 0x80]));
    }
}
