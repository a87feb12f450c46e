//! ARM EABI (32-bit) ELF binary backend.
//!
//! Same file layout as the x86 backend with ARM instruction encodings and
//! `svc #0` system calls (r7=number, r0=fd, r1=buffer, r2=count). The tape
//! pointer lives in `r1`, `r2` is preset to 1, `r8` is the scratch byte and
//! `r9` caches the loop cell between `If` and the `*Var` ops.

use log::warn;

use super::{CodeBuffer, CodeGen};
use crate::elf::*;

const BASE_ADDR: u32 = 0x0001_0000;
const BSS_ADDR: u32 = 0x0021_0000;
const N_PROGRAM_HEADERS: u16 = 2;
const N_SECTION_HEADERS: u16 = 4;
const HEADER_SIZE: usize = EHDR32_SIZE + PHDR32_SIZE * N_PROGRAM_HEADERS as usize;
const FOOTER_SIZE: usize = SHDR32_SIZE * N_SECTION_HEADERS as usize;
const SHSTRTAB: [u8; 22] = *b"\0.text\0.shstrtbl\0.bss\0";

pub struct ElfArmeabiGen {
    buf: CodeBuffer,
    heap_size: usize,
}

impl ElfArmeabiGen {
    pub fn new(heap_size: usize) -> ElfArmeabiGen {
        ElfArmeabiGen {
            buf: CodeBuffer::new(),
            heap_size,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.into_bytes()
    }

    fn word(&mut self, opcode: u32) {
        self.buf.write_u32(opcode);
    }

    /// `ldrb`/`strb` with the signed cell offset folded into the u/imm12
    /// fields. Offsets past ±4095 cannot be encoded in one instruction.
    fn byte_access(&mut self, positive: u32, negative: u32, offset: i32) {
        if offset.unsigned_abs() > 4095 {
            warn!("cell offset {} exceeds the arm immediate range", offset);
        }
        if offset >= 0 {
            self.word(positive | (offset as u32 & 0xfff));
        } else {
            self.word(negative | ((-offset) as u32 & 0xfff));
        }
    }
}

impl CodeGen for ElfArmeabiGen {
    fn emit_header(&mut self) {
        self.buf.fill(HEADER_SIZE, 0);

        // ldr r1, [pc]; b #0; {bss origin}
        self.word(0xe59f_1000);
        self.word(0xea00_0000);
        self.buf.write_u32(BSS_ADDR + (self.heap_size / 2) as u32);
        // mov r2, #1
        self.word(0xe3a0_2001);
    }

    fn emit_footer(&mut self) {
        self.emit_assign(i32::from(b'\n'));
        self.emit_putchar();

        // mov r7, #1; mov r0, #0; svc #0
        self.word(0xe3a0_7001);
        self.word(0xe3a0_0000);
        self.word(0xef00_0000);

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
            e_ident: Elf_Ident::new(ELFCLASS32, ELFOSABI_ARM_AEABI),
            e_type: ET_EXEC,
            e_machine: EM_ARM,
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
        if offset.unsigned_abs() <= 255 {
            if offset > 0 {
                // add r1, r1, #{offset}
                self.word(0xe281_1000 | offset as u32);
            } else {
                // sub r1, r1, #{-offset}
                self.word(0xe241_1000 | (-offset) as u32);
            }
        } else {
            // ldr r8, [pc]; b #0; {|offset|}; add/sub r1, r1, r8
            self.word(0xe59f_8000);
            self.word(0xea00_0000);
            self.buf.write_u32(offset.unsigned_abs());
            if offset > 0 {
                self.word(0xe081_1008);
            } else {
                self.word(0xe041_1008);
            }
        }
    }

    fn emit_add(&mut self, value: i32) {
        // ldrb r8, [r1]
        self.word(0xe5d1_8000);
        if value > 0 {
            // add r8, r8, #{value}
            self.word(0xe288_8000 | (value as u32 & 0xff));
        } else {
            // sub r8, r8, #{-value}
            self.word(0xe248_8000 | ((-value) as u32 & 0xff));
        }
        // strb r8, [r1]
        self.word(0xe5c1_8000);
    }

    fn emit_putchar(&mut self) {
        // mov r7, #4; mov r0, #1; svc #0
        self.word(0xe3a0_7004);
        self.word(0xe3a0_0001);
        self.word(0xef00_0000);
    }

    fn emit_getchar(&mut self) {
        // mov r7, #3; mov r0, #0; svc #0
        self.word(0xe3a0_7003);
        self.word(0xe3a0_0000);
        self.word(0xef00_0000);
    }

    fn emit_loop_start(&mut self) {
        self.buf.push_loop(self.buf.tell());
        // ldrb r8, [r1]; cmp r8, #0; beq {placeholder}
        self.word(0xe5d1_8000);
        self.word(0xe358_0000);
        self.word(0x0a00_0000);
    }

    fn emit_loop_end(&mut self) {
        let pos = match self.buf.pop_loop() {
            Some(pos) => pos,
            None => return,
        };
        let offset = ((self.buf.tell() - pos) / 4) as i32;
        // b back to the load at loop start
        self.word(0xea00_0000 | (0x00ff_ffff & (-(offset + 2)) as u32));
        // beq past the branch just written
        let beq = 0x0a00_0000 | (0x00ff_ffff & (offset - 3) as u32);
        self.buf.seek(pos + 8);
        self.buf.write_u32(beq);
        self.buf.seek_end();
    }

    fn emit_if(&mut self) {
        self.emit_loop_start();
        // ldrb r9, [r1]  (the cell value the *Var ops consume)
        self.word(0xe5d1_9000);
    }

    fn emit_end_if(&mut self) {
        let pos = match self.buf.pop_loop() {
            Some(pos) => pos,
            None => return,
        };
        let offset = ((self.buf.tell() - pos) / 4) as i32;
        let beq = 0x0a00_0000 | (0x00ff_ffff & (offset - 4) as u32);
        self.buf.seek(pos + 8);
        self.buf.write_u32(beq);
        self.buf.seek_end();
    }

    fn emit_assign(&mut self, value: i32) {
        // mov r8, #{value}; strb r8, [r1]
        self.word(0xe3a0_8000 | (value as u32 & 0xff));
        self.word(0xe5c1_8000);
    }

    fn emit_add_var(&mut self, offset: i32) {
        // ldrb r8, [r1, #{offset}]; add r8, r8, r9; strb r8, [r1, #{offset}]
        self.byte_access(0xe5d1_8000, 0xe551_8000, offset);
        self.word(0xe088_8009);
        self.byte_access(0xe5c1_8000, 0xe541_8000, offset);
    }

    fn emit_sub_var(&mut self, offset: i32) {
        // ldrb r8, [r1, #{offset}]; sub r8, r8, r9; strb r8, [r1, #{offset}]
        self.byte_access(0xe5d1_8000, 0xe551_8000, offset);
        self.word(0xe048_8009);
        self.byte_access(0xe5c1_8000, 0xe541_8000, offset);
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        // ldrb r8, [r1, #{offset}]; mov r6, #{|mul|}; mul r6, r9, r6
        self.byte_access(0xe5d1_8000, 0xe551_8000, offset);
        self.word(0xe3a0_6000 | (mul.unsigned_abs() & 0xff));
        self.word(0xe006_0699);
        if mul > 0 {
            // add r8, r8, r6
            self.word(0xe088_8006);
        } else {
            // sub r8, r8, r6
            self.word(0xe048_8006);
        }
        self.byte_access(0xe5c1_8000, 0xe541_8000, offset);
    }

    fn emit_inf_loop(&mut self) {
        self.emit_if();
        // b to itself
        self.word(0xeaff_fffe);
        self.emit_end_if();
    }

    fn emit_break_point(&mut self) {
        // the canonical linux-arm undefined instruction trap
        self.word(0xe7f0_01f0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emit;
    use crate::parser::parse;

    fn emit_bytes(src: &[u8]) -> Vec<u8> {
        let ir = parse(src).unwrap();
        let mut gen = ElfArmeabiGen::new(65536);
        emit(&mut gen, &ir);
        gen.finish()
    }

    fn word_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn header_identifies_an_arm_executable() {
        let bytes = emit_bytes(b"+");
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], ELFCLASS32);
        assert_eq!(bytes[7], ELFOSABI_ARM_AEABI);
        assert_eq!(
            u16::from_le_bytes(bytes[18..20].try_into().unwrap()),
            EM_ARM
        );
        assert_eq!(word_at(&bytes, 24), BASE_ADDR + HEADER_SIZE as u32);
    }

    #[test]
    fn entry_code_loads_the_bss_origin_into_r1() {
        let bytes = emit_bytes(b"");
        assert_eq!(word_at(&bytes, HEADER_SIZE), 0xe59f_1000);
        assert_eq!(word_at(&bytes, HEADER_SIZE + 4), 0xea00_0000);
        assert_eq!(word_at(&bytes, HEADER_SIZE + 8), BSS_ADDR + 32768);
        assert_eq!(word_at(&bytes, HEADER_SIZE + 12), 0xe3a0_2001);
    }

    #[test]
    fn loop_branches_resolve_to_each_other() {
        let bytes = emit_bytes(b"[-]+[-.]");
        // every beq placeholder must have been patched
        let mut pos = HEADER_SIZE;
        while pos + 4 <= bytes.len() - FOOTER_SIZE - SHSTRTAB.len() {
            assert_ne!(word_at(&bytes, pos), 0x0a00_0000, "unpatched beq at {:#x}", pos);
            pos += 4;
        }
    }

    #[test]
    fn backward_branch_points_at_the_loop_head() {
        let bytes = emit_bytes(b"[.]");
        // layout: entry (4 words), then ldrb/cmp/beq, putchar (3 words), b
        let start = HEADER_SIZE + 16;
        let b_at = start + 24;
        let imm = word_at(&bytes, b_at) & 0x00ff_ffff;
        // b target = b_at + 8 + 4 * sext(imm) == start
        let disp = ((imm | 0xff00_0000) as i32) * 4;
        assert_eq!(b_at as i32 + 8 + disp, start as i32);

        let beq = word_at(&bytes, start + 8);
        assert_eq!(beq >> 24, 0x0a);
        let beq_imm = (beq & 0x00ff_ffff) as i32;
        assert_eq!(start as i32 + 8 + 8 + beq_imm * 4, (b_at + 4) as i32);
    }

    #[test]
    fn if_block_caches_the_cell_in_r9() {
        let bytes = emit_bytes(b"[->+<]");
        let start = HEADER_SIZE + 16;
        // ldrb r8; cmp; beq; ldrb r9
        assert_eq!(word_at(&bytes, start), 0xe5d1_8000);
        assert_eq!(word_at(&bytes, start + 12), 0xe5d1_9000);
        // add uses the cached r9
        assert_eq!(word_at(&bytes, start + 20), 0xe088_8009);
        // and the endif beq lands exactly past the assign
        let beq_imm = (word_at(&bytes, start + 8) & 0x00ff_ffff) as i32;
        let target = start as i32 + 8 + 8 + beq_imm * 4;
        // ldrb,cmp,beq,ldrb9 + ldrb8,add,strb + mov,strb = 9 words
        assert_eq!(target, start as i32 + 36);
    }

    #[test]
    fn breakpoint_emits_the_undefined_instruction() {
        let bytes = emit_bytes(b"#");
        assert_eq!(word_at(&bytes, HEADER_SIZE + 16), 0xe7f0_01f0);
    }
}
