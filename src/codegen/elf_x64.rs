//! x86-64 ELF binary backend.
//!
//! Produces a complete static Linux executable with no linker: ELF header,
//! two program headers (.text and .bss), the code, the section string table
//! and four section headers. Headers are rewritten in place once the final
//! code size is known. The tape pointer lives in `rsi`; `rdx` is preset to 1
//! as the byte count for every read/write syscall.

use super::{CodeBuffer, CodeGen};
use crate::elf::*;

const BASE_ADDR: u64 = 0x0404_8000;
const BSS_ADDR: u64 = 0x0424_8000;
const N_PROGRAM_HEADERS: u16 = 2;
const N_SECTION_HEADERS: u16 = 4;
const HEADER_SIZE: usize = EHDR64_SIZE + PHDR64_SIZE * N_PROGRAM_HEADERS as usize;
const FOOTER_SIZE: usize = SHDR64_SIZE * N_SECTION_HEADERS as usize;
const SHSTRTAB: [u8; 22] = *b"\0.text\0.shstrtbl\0.bss\0";

pub struct ElfX64Gen {
    buf: CodeBuffer,
    heap_size: usize,
}

impl ElfX64Gen {
    pub fn new(heap_size: usize) -> ElfX64Gen {
        ElfX64Gen {
            buf: CodeBuffer::new(),
            heap_size,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.into_bytes()
    }
}

impl CodeGen for ElfX64Gen {
    fn emit_header(&mut self) {
        // headers are rewritten from the footer once sizes are known
        self.buf.fill(HEADER_SIZE, 0);

        // movabs rsi, {bss origin}
        self.buf.write(&[0x48, 0xbe]);
        self.buf
            .write_u64(BSS_ADDR + (self.heap_size / 2) as u64);
        // mov edx, 0x01
        self.buf.write(&[0xba]);
        self.buf.write_u32(0x01);
    }

    fn emit_footer(&mut self) {
        self.emit_assign(i32::from(b'\n'));
        self.emit_putchar();

        // mov eax, 0x3c; xor edi, edi; syscall
        self.buf.write(&[0xb8]);
        self.buf.write_u32(0x3c);
        self.buf.write(&[0x31, 0xff]);
        self.buf.write(&[0x0f, 0x05]);

        let code_size = self.buf.tell() - HEADER_SIZE;

        self.buf.write(&SHSTRTAB);

        let shdr_null = Elf64_Shdr {
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

        let shdr_shstrtbl = Elf64_Shdr {
            sh_name: 7,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: (HEADER_SIZE + code_size) as u64,
            sh_size: SHSTRTAB.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_shstrtbl.to_bytes());

        let shdr_text = Elf64_Shdr {
            sh_name: 1,
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_EXECINSTR | SHF_ALLOC) as u64,
            sh_addr: BASE_ADDR + HEADER_SIZE as u64,
            sh_offset: HEADER_SIZE as u64,
            sh_size: code_size as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 4,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_text.to_bytes());

        let shdr_bss = Elf64_Shdr {
            sh_name: 17,
            sh_type: SHT_NOBITS,
            sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
            sh_addr: BSS_ADDR,
            sh_offset: 0x1000,
            sh_size: self.heap_size as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0x10,
            sh_entsize: 0,
        };
        self.buf.write(&shdr_bss.to_bytes());

        self.buf.seek(0);

        let ehdr = Elf64_Ehdr {
            e_ident: Elf_Ident::new(ELFCLASS64, ELFOSABI_LINUX),
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: EV_CURRENT,
            e_entry: BASE_ADDR + HEADER_SIZE as u64,
            e_phoff: EHDR64_SIZE as u64,
            e_shoff: (HEADER_SIZE + SHSTRTAB.len() + code_size) as u64,
            e_flags: 0,
            e_ehsize: EHDR64_SIZE as u16,
            e_phentsize: PHDR64_SIZE as u16,
            e_phnum: N_PROGRAM_HEADERS,
            e_shentsize: SHDR64_SIZE as u16,
            e_shnum: N_SECTION_HEADERS,
            e_shstrndx: 1,
        };
        self.buf.write(&ehdr.to_bytes());

        let file_size = (HEADER_SIZE + SHSTRTAB.len() + FOOTER_SIZE + code_size) as u64;
        let phdr_text = Elf64_Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0,
            p_vaddr: BASE_ADDR,
            p_paddr: BASE_ADDR,
            p_filesz: file_size,
            p_memsz: file_size,
            p_align: 0x100,
        };
        self.buf.write(&phdr_text.to_bytes());

        let phdr_bss = Elf64_Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: 0x1000,
            p_vaddr: BSS_ADDR,
            p_paddr: BSS_ADDR,
            p_filesz: 0,
            p_memsz: self.heap_size as u64,
            p_align: 0x0020_0000,
        };
        self.buf.write(&phdr_bss.to_bytes());

        self.buf.seek_end();
    }

    fn emit_move_pointer(&mut self, offset: i32) {
        if offset > 0 {
            if offset > 127 {
                // add rsi, {offset}
                self.buf.write(&[0x48, 0x81, 0xc6]);
                self.buf.write_u32(offset as u32);
            } else if offset > 1 {
                self.buf.write(&[0x48, 0x83, 0xc6, offset as u8]);
            } else {
                // inc rsi
                self.buf.write(&[0x48, 0xff, 0xc6]);
            }
        } else if offset < -127 {
            // sub rsi, {-offset}
            self.buf.write(&[0x48, 0x81, 0xee]);
            self.buf.write_u32((-offset) as u32);
        } else if offset < -1 {
            self.buf.write(&[0x48, 0x83, 0xee, (-offset) as u8]);
        } else {
            // dec rsi
            self.buf.write(&[0x48, 0xff, 0xce]);
        }
    }

    fn emit_add(&mut self, value: i32) {
        if value > 0 {
            if value > 1 {
                // add byte ptr [rsi], {value}
                self.buf.write(&[0x80, 0x06, value as u8]);
            } else {
                // inc byte ptr [rsi]
                self.buf.write(&[0xfe, 0x06]);
            }
        } else if value < -1 {
            // sub byte ptr [rsi], {-value}
            self.buf.write(&[0x80, 0x2e, (-value) as u8]);
        } else {
            // dec byte ptr [rsi]
            self.buf.write(&[0xfe, 0x0e]);
        }
    }

    fn emit_putchar(&mut self) {
        // mov rax, 0x01; mov edi, 0x01; syscall
        self.buf.write(&[0x48, 0xc7, 0xc0]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0xbf]);
        self.buf.write_u32(0x01);
        self.buf.write(&[0x0f, 0x05]);
    }

    fn emit_getchar(&mut self) {
        // mov rax, 0x00; xor edi, edi; syscall
        self.buf.write(&[0x48, 0xc7, 0xc0]);
        self.buf.write_u32(0x00);
        self.buf.write(&[0x31, 0xff]);
        self.buf.write(&[0x0f, 0x05]);
    }

    fn emit_loop_start(&mut self) {
        self.buf.push_loop(self.buf.tell());
        // cmp byte ptr [rsi], 0x00
        self.buf.write(&[0x80, 0x3e, 0x00]);
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
        // fill the forward je now that the end is known
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
        // mov byte ptr [rsi], {value}
        self.buf.write(&[0xc6, 0x06, value as u8]);
    }

    fn emit_add_var(&mut self, offset: i32) {
        // mov al, byte ptr [rsi]
        self.buf.write(&[0x8a, 0x06]);
        // add byte ptr [rsi + {offset}], al
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[0x00, 0x86]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[0x00, 0x46, offset as u8]);
        }
    }

    fn emit_sub_var(&mut self, offset: i32) {
        self.buf.write(&[0x8a, 0x06]);
        // sub byte ptr [rsi + {offset}], al
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[0x28, 0x86]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[0x28, 0x46, offset as u8]);
        }
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        // mov al, {|mul|}; mul byte ptr [rsi]
        self.buf.write(&[0xb0, mul.unsigned_abs() as u8]);
        self.buf.write(&[0xf6, 0x26]);
        let opcode = if mul > 0 { 0x00 } else { 0x28 };
        if !(-128..=127).contains(&offset) {
            self.buf.write(&[opcode, 0x86]);
            self.buf.write_u32(offset as u32);
        } else {
            self.buf.write(&[opcode, 0x46, offset as u8]);
        }
    }

    fn emit_inf_loop(&mut self) {
        self.emit_if();
        // jmp to itself
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
        let mut gen = ElfX64Gen::new(65536);
        emit(&mut gen, &ir);
        gen.finish()
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn header_fields_are_consistent_with_the_body() {
        let bytes = emit_bytes(b"+[>.]");
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(bytes[5], ELFDATA2LSB);
        assert_eq!(u16_at(&bytes, 18), EM_X86_64);
        assert_eq!(u16_at(&bytes, 56), 2); // e_phnum
        assert_eq!(u16_at(&bytes, 60), 4); // e_shnum
        assert_eq!(u16_at(&bytes, 62), 1); // e_shstrndx
        assert_eq!(u64_at(&bytes, 24), BASE_ADDR + HEADER_SIZE as u64); // e_entry

        let code_size = bytes.len() - HEADER_SIZE - SHSTRTAB.len() - FOOTER_SIZE;
        assert_eq!(u64_at(&bytes, 40), (HEADER_SIZE + SHSTRTAB.len() + code_size) as u64); // e_shoff
    }

    #[test]
    fn bss_program_header_has_zero_file_footprint() {
        let bytes = emit_bytes(b"+");
        let phdr_bss = EHDR64_SIZE + PHDR64_SIZE;
        assert_eq!(u64_at(&bytes, phdr_bss + 32), 0); // p_filesz
        assert_eq!(u64_at(&bytes, phdr_bss + 40), 65536); // p_memsz
        assert_eq!(u64_at(&bytes, phdr_bss + 48), 0x0020_0000); // p_align
    }

    #[test]
    fn section_string_table_sits_after_the_code() {
        let bytes = emit_bytes(b"");
        let strtab_at = bytes.len() - FOOTER_SIZE - SHSTRTAB.len();
        assert_eq!(&bytes[strtab_at..strtab_at + SHSTRTAB.len()], &SHSTRTAB);
    }

    #[test]
    fn no_forward_jump_placeholder_survives() {
        let bytes = emit_bytes(b"+[>[-]<-]");
        assert!(!bytes
            .windows(6)
            .any(|window| window == [0x0f, 0x84, 0, 0, 0, 0]));
    }

    #[test]
    fn tape_register_starts_at_the_bss_midpoint() {
        let bytes = emit_bytes(b"");
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 2], &[0x48, 0xbe]);
        assert_eq!(u64_at(&bytes, HEADER_SIZE + 2), BSS_ADDR + 32768);
    }

    #[test]
    fn short_loops_use_the_short_backward_jump() {
        let bytes = emit_bytes(b"[-]+[-.]");
        assert!(bytes.windows(1).any(|w| w == [0xeb]));
    }
}
