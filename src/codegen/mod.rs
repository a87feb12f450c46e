//! Code generators for every compile target, sharing one dispatch contract.
//!
//! [`emit`] walks the IR once and calls one trait method per instruction;
//! each backend implements the methods it can do better than the default
//! decomposition. Binary backends write into a [`CodeBuffer`] and rely on
//! its seek/patch support for loop displacements and header rewriting.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::inst::Inst;

mod buffer;
pub mod c_codegen;
pub mod elf_armeabi;
pub mod elf_x64;
pub mod elf_x86;
pub mod win_x64;
pub mod win_x86;

pub use buffer::CodeBuffer;

/// Everything `-t, --target` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    C,
    XbyakC,
    WinX86,
    WinX64,
    ElfX86,
    ElfX64,
    ElfArmeabi,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Target, Error> {
        match s {
            "c" => Ok(Target::C),
            "xbyakc" => Ok(Target::XbyakC),
            "winx86" => Ok(Target::WinX86),
            "winx64" => Ok(Target::WinX64),
            "elfx86" => Ok(Target::ElfX86),
            "elfx64" => Ok(Target::ElfX64),
            "elfarmeabi" => Ok(Target::ElfArmeabi),
            _ => Err(Error::InvalidTarget(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Target::C => "c",
            Target::XbyakC => "xbyakc",
            Target::WinX86 => "winx86",
            Target::WinX64 => "winx64",
            Target::ElfX86 => "elfx86",
            Target::ElfX64 => "elfx64",
            Target::ElfArmeabi => "elfarmeabi",
        };
        f.write_str(name)
    }
}

impl Target {
    /// Suffix of the default output file name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Target::C | Target::XbyakC => ".c",
            Target::WinX86 | Target::WinX64 => ".exe",
            Target::ElfX86 | Target::ElfX64 | Target::ElfArmeabi => ".out",
        }
    }

    /// Emitted files are executable for the binary targets.
    pub fn is_executable(&self) -> bool {
        matches!(self, Target::ElfX86 | Target::ElfX64 | Target::ElfArmeabi)
    }
}

/// Per-instruction emission contract shared by every backend.
///
/// The defaults decompose the derived instructions into the primitive ones,
/// so a minimal backend only has to provide the eight brainfuck primitives
/// plus its header and footer.
pub trait CodeGen {
    fn emit_header(&mut self);
    fn emit_footer(&mut self);
    fn emit_move_pointer(&mut self, offset: i32);
    fn emit_add(&mut self, value: i32);
    fn emit_putchar(&mut self);
    fn emit_getchar(&mut self);
    fn emit_loop_start(&mut self);
    fn emit_loop_end(&mut self);

    fn emit_if(&mut self) {
        self.emit_loop_start();
    }

    fn emit_end_if(&mut self) {
        self.emit_loop_end();
    }

    fn emit_assign(&mut self, value: i32) {
        self.emit_loop_start();
        self.emit_add(-1);
        self.emit_loop_end();
        self.emit_add(value);
    }

    fn emit_search_zero(&mut self, step: i32) {
        self.emit_loop_start();
        self.emit_move_pointer(step);
        self.emit_loop_end();
    }

    fn emit_add_var(&mut self, offset: i32) {
        self.emit_move_pointer(offset);
        self.emit_add(1);
        self.emit_move_pointer(-offset);
    }

    fn emit_sub_var(&mut self, offset: i32) {
        self.emit_move_pointer(offset);
        self.emit_add(-1);
        self.emit_move_pointer(-offset);
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        self.emit_move_pointer(offset);
        self.emit_add(mul);
        self.emit_move_pointer(-offset);
    }

    fn emit_inf_loop(&mut self) {
        self.emit_loop_start();
        self.emit_loop_end();
    }

    fn emit_break_point(&mut self) {}
}

/// Drives a backend over the whole program.
pub fn emit<G: CodeGen>(gen: &mut G, ir: &[Inst]) {
    gen.emit_header();
    for inst in ir {
        match *inst {
            Inst::MovePointer(offset) => gen.emit_move_pointer(offset),
            Inst::Add(value) => gen.emit_add(value),
            Inst::Assign(value) => gen.emit_assign(value),
            Inst::Putchar => gen.emit_putchar(),
            Inst::Getchar => gen.emit_getchar(),
            Inst::LoopStart(_) => gen.emit_loop_start(),
            Inst::LoopEnd(_) => gen.emit_loop_end(),
            Inst::If(_) => gen.emit_if(),
            Inst::EndIf(_) => gen.emit_end_if(),
            Inst::SearchZero(step) => gen.emit_search_zero(step),
            Inst::AddVar(offset) => gen.emit_add_var(offset),
            Inst::SubVar(offset) => gen.emit_sub_var(offset),
            Inst::AddCMulVar(offset, mul) => gen.emit_add_cmul_var(offset, mul),
            Inst::InfLoop => gen.emit_inf_loop(),
            Inst::BreakPoint => gen.emit_break_point(),
        }
    }
    gen.emit_footer();
}

/// Compiles IR for `target` into the bytes of the output file.
pub fn emit_to_vec(target: Target, ir: &[Inst], heap_size: usize) -> Vec<u8> {
    match target {
        Target::C => c_codegen::c_source(ir, heap_size).into_bytes(),
        Target::XbyakC => c_codegen::jit_dump_source(ir, heap_size).into_bytes(),
        Target::ElfX86 => {
            let mut gen = elf_x86::ElfX86Gen::new(heap_size);
            emit(&mut gen, ir);
            gen.finish()
        }
        Target::ElfX64 => {
            let mut gen = elf_x64::ElfX64Gen::new(heap_size);
            emit(&mut gen, ir);
            gen.finish()
        }
        Target::ElfArmeabi => {
            let mut gen = elf_armeabi::ElfArmeabiGen::new(heap_size);
            emit(&mut gen, ir);
            gen.finish()
        }
        Target::WinX86 => {
            let mut gen = win_x86::WinX86Gen::new(heap_size);
            emit(&mut gen, ir);
            gen.finish()
        }
        Target::WinX64 => {
            let mut gen = win_x64::WinX64Gen::new(heap_size);
            emit(&mut gen, ir);
            gen.finish()
        }
    }
}

pub(crate) fn align_up(size: usize, alignment: usize) -> usize {
    alignment * ((size + alignment - 1) / alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names_round_trip() {
        for name in ["c", "xbyakc", "winx86", "winx64", "elfx86", "elfx64", "elfarmeabi"] {
            let target: Target = name.parse().unwrap();
            assert_eq!(target.to_string(), name);
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = "elfmips".parse::<Target>().unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(ref s) if s == "elfmips"));
    }

    #[test]
    fn suffixes_match_the_target_family() {
        assert_eq!(Target::C.suffix(), ".c");
        assert_eq!(Target::XbyakC.suffix(), ".c");
        assert_eq!(Target::WinX64.suffix(), ".exe");
        assert_eq!(Target::ElfArmeabi.suffix(), ".out");
    }
}
