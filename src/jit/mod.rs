//! x86-64 JIT: emits machine code for the IR and runs it in-process.
//!
//! The tape pointer lives in `rbx` (callee-saved) and arrives as the first
//! argument of the emitted function. I/O comes in two flavors: trampoline
//! calls back into the host (used when executing in-process) and raw Linux
//! syscalls (used by the `xbyakc` dump, which must be self-contained).
//! Forward loop jumps are always emitted as 32-bit `je` placeholders and
//! back-patched from a LIFO stack when the matching `]` arrives.

use crate::codegen::{self, CodeGen};
use crate::inst::Inst;

#[cfg(unix)]
mod region;
#[cfg(unix)]
pub use region::ExecutableRegion;

/// How `Putchar`/`Getchar` leave the emitted code.
#[derive(Debug, Clone, Copy)]
pub enum IoMode {
    /// `write(2)`/`read(2)` on fds 1 and 0 via `syscall`.
    Syscall,
    /// Call host functions whose addresses are baked in as immediates.
    Trampoline { putchar: u64, getchar: u64 },
}

pub struct JitGen {
    code: Vec<u8>,
    patches: Vec<usize>,
    mode: IoMode,
}

impl JitGen {
    pub fn new(mode: IoMode) -> JitGen {
        JitGen {
            code: Vec::new(),
            patches: Vec::new(),
            mode,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    fn put(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn put_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    // cmp byte ptr [rbx], 0
    fn cmp_cell_zero(&mut self) {
        self.put(&[0x80, 0x3b, 0x00]);
    }

    // je with a 4-byte placeholder, remembered for back-patching
    fn je_forward(&mut self) {
        self.put(&[0x0f, 0x84]);
        self.patches.push(self.code.len());
        self.put_u32(0);
    }

    fn patch_forward(&mut self) {
        if let Some(pos) = self.patches.pop() {
            let rel = (self.code.len() as i64 - (pos as i64 + 4)) as i32;
            self.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
    }

    // lea rbx, [rbx + offset]
    fn lea_tape(&mut self, offset: i32) {
        if (-128..=127).contains(&offset) {
            self.put(&[0x48, 0x8d, 0x5b, offset as u8]);
        } else {
            self.put(&[0x48, 0x8d, 0x9b]);
            self.put_u32(offset as u32);
        }
    }

    // add/sub byte ptr [rbx + offset], al  (0x00 = add, 0x28 = sub)
    fn op_al_at(&mut self, opcode: u8, offset: i32) {
        if (-128..=127).contains(&offset) {
            self.put(&[opcode, 0x43, offset as u8]);
        } else {
            self.put(&[opcode, 0x83]);
            self.put_u32(offset as u32);
        }
    }
}

impl CodeGen for JitGen {
    fn emit_header(&mut self) {
        // push rbx; mov rbx, rdi
        self.put(&[0x53, 0x48, 0x89, 0xfb]);
    }

    fn emit_footer(&mut self) {
        // pop rbx; xor eax, eax; ret
        self.put(&[0x5b, 0x31, 0xc0, 0xc3]);
    }

    fn emit_move_pointer(&mut self, offset: i32) {
        self.lea_tape(offset);
    }

    fn emit_add(&mut self, value: i32) {
        match value {
            1 => self.put(&[0xfe, 0x03]),  // inc byte ptr [rbx]
            -1 => self.put(&[0xfe, 0x0b]), // dec byte ptr [rbx]
            n if n > 0 => self.put(&[0x80, 0x03, n as u8]),
            n => self.put(&[0x80, 0x2b, (-n) as u8]),
        }
    }

    fn emit_putchar(&mut self) {
        match self.mode {
            IoMode::Trampoline { putchar, .. } => {
                // movabs rax, putchar; mov rdi, rbx; call rax
                self.put(&[0x48, 0xb8]);
                self.put_u64(putchar);
                self.put(&[0x48, 0x89, 0xdf, 0xff, 0xd0]);
            }
            IoMode::Syscall => {
                // mov eax, 1; mov edi, 1; mov rsi, rbx; mov edx, 1; syscall
                self.put(&[0xb8, 0x01, 0x00, 0x00, 0x00]);
                self.put(&[0xbf, 0x01, 0x00, 0x00, 0x00]);
                self.put(&[0x48, 0x89, 0xde]);
                self.put(&[0xba, 0x01, 0x00, 0x00, 0x00]);
                self.put(&[0x0f, 0x05]);
            }
        }
    }

    fn emit_getchar(&mut self) {
        match self.mode {
            IoMode::Trampoline { getchar, .. } => {
                self.put(&[0x48, 0xb8]);
                self.put_u64(getchar);
                self.put(&[0x48, 0x89, 0xdf, 0xff, 0xd0]);
            }
            IoMode::Syscall => {
                // mov eax, 0; xor edi, edi; mov rsi, rbx; mov edx, 1; syscall
                self.put(&[0xb8, 0x00, 0x00, 0x00, 0x00]);
                self.put(&[0x31, 0xff]);
                self.put(&[0x48, 0x89, 0xde]);
                self.put(&[0xba, 0x01, 0x00, 0x00, 0x00]);
                self.put(&[0x0f, 0x05]);
            }
        }
    }

    fn emit_loop_start(&mut self) {
        self.cmp_cell_zero();
        self.je_forward();
    }

    fn emit_loop_end(&mut self) {
        self.cmp_cell_zero();
        // jne back to just past the opening je
        let target = match self.patches.last() {
            Some(&pos) => pos as i64 + 4,
            None => 0,
        };
        self.put(&[0x0f, 0x85]);
        let rel = (target - (self.code.len() as i64 + 4)) as i32;
        self.put_u32(rel as u32);
        self.patch_forward();
    }

    fn emit_if(&mut self) {
        self.cmp_cell_zero();
        self.je_forward();
    }

    fn emit_end_if(&mut self) {
        self.patch_forward();
    }

    fn emit_assign(&mut self, value: i32) {
        self.put(&[0xc6, 0x03, value as u8]);
    }

    fn emit_search_zero(&mut self, step: i32) {
        let lea_len: i8 = if (-128..=127).contains(&step) { 4 } else { 7 };
        self.cmp_cell_zero();
        // je past the lea and the back jump
        self.put(&[0x74, (lea_len + 2) as u8]);
        self.lea_tape(step);
        // jmp back to the cmp
        self.put(&[0xeb, (-(lea_len + 7)) as u8]);
    }

    fn emit_add_var(&mut self, offset: i32) {
        self.put(&[0x8a, 0x03]); // mov al, byte ptr [rbx]
        self.op_al_at(0x00, offset);
    }

    fn emit_sub_var(&mut self, offset: i32) {
        self.put(&[0x8a, 0x03]);
        self.op_al_at(0x28, offset);
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        // mov al, |mul|; mul byte ptr [rbx]
        self.put(&[0xb0, mul.unsigned_abs() as u8]);
        self.put(&[0xf6, 0x23]);
        self.op_al_at(if mul > 0 { 0x00 } else { 0x28 }, offset);
    }

    fn emit_inf_loop(&mut self) {
        self.emit_if();
        self.put(&[0xeb, 0xfe]); // jmp to itself
        self.emit_end_if();
    }

    fn emit_break_point(&mut self) {
        self.put(&[0xcc]); // int3
    }
}

/// Assembles the IR into a complete `extern "C" fn(*mut u8)` body.
pub fn compile(ir: &[Inst], mode: IoMode) -> Vec<u8> {
    let mut gen = JitGen::new(mode);
    codegen::emit(&mut gen, ir);
    gen.finish()
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod native {
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};

    use log::debug;

    use super::{compile, ExecutableRegion, IoMode};
    use crate::error::Error;
    use crate::inst::Inst;
    use crate::tape::Tape;

    static FLUSH_PUTCHAR: AtomicBool = AtomicBool::new(false);

    // Tests swap the trampolines' stdio for in-memory buffers; the jitted
    // code runs on the calling thread, so a thread local is enough.
    #[cfg(test)]
    thread_local! {
        static CAPTURE: std::cell::RefCell<Option<Capture>> =
            const { std::cell::RefCell::new(None) };
    }

    #[cfg(test)]
    struct Capture {
        input: std::collections::VecDeque<u8>,
        output: Vec<u8>,
    }

    extern "C" fn putchar_trampoline(cell: *const u8) {
        let byte = unsafe { *cell };
        #[cfg(test)]
        {
            let captured = CAPTURE.with(|capture| match capture.borrow_mut().as_mut() {
                Some(capture) => {
                    capture.output.push(byte);
                    true
                }
                None => false,
            });
            if captured {
                return;
            }
        }
        let mut stdout = io::stdout();
        // emitted programs accept whatever the write returns
        let _ = stdout.write_all(&[byte]);
        if FLUSH_PUTCHAR.load(Ordering::Relaxed) {
            let _ = stdout.flush();
        }
    }

    extern "C" fn getchar_trampoline(cell: *mut u8) {
        #[cfg(test)]
        {
            let captured = CAPTURE.with(|capture| match capture.borrow_mut().as_mut() {
                Some(capture) => {
                    // exhausted input behaves like EOF: the cell keeps its value
                    if let Some(byte) = capture.input.pop_front() {
                        unsafe { *cell = byte };
                    }
                    true
                }
                None => false,
            });
            if captured {
                return;
            }
        }
        let _ = io::stdout().flush();
        let mut buf = [0u8; 1];
        if let Ok(1) = io::stdin().read(&mut buf) {
            unsafe { *cell = buf[0] };
        }
    }

    /// Test entry: runs the program with the trampolines wired to the given
    /// input and returns everything it wrote, trailing newline included.
    #[cfg(test)]
    pub(super) fn run_captured(ir: &[Inst], input: &[u8]) -> Result<Vec<u8>, Error> {
        CAPTURE.with(|capture| {
            *capture.borrow_mut() = Some(Capture {
                input: input.iter().copied().collect(),
                output: Vec::new(),
            })
        });

        let result: Result<(), Error> = (|| {
            let putchar = putchar_trampoline as extern "C" fn(*const u8);
            let getchar = getchar_trampoline as extern "C" fn(*mut u8);
            let code = compile(
                ir,
                IoMode::Trampoline {
                    putchar: putchar as usize as u64,
                    getchar: getchar as usize as u64,
                },
            );
            let mut region = ExecutableRegion::reserve(code.len())?;
            region.write(&code)?;
            region.finalize()?;
            let mut tape = Tape::new(4096);
            unsafe { region.call(tape.head_ptr()) };
            Ok(())
        })();

        let mut output = CAPTURE
            .with(|capture| capture.borrow_mut().take())
            .map(|capture| capture.output)
            .unwrap_or_default();
        result?;
        output.push(b'\n');
        Ok(output)
    }

    /// Compiles and runs the program against `tape`, then prints the
    /// trailing newline every executor emits.
    pub fn run(ir: &[Inst], tape: &mut Tape, flush_putchar: bool) -> Result<(), Error> {
        FLUSH_PUTCHAR.store(flush_putchar, Ordering::Relaxed);

        let putchar = putchar_trampoline as extern "C" fn(*const u8);
        let getchar = getchar_trampoline as extern "C" fn(*mut u8);
        let code = compile(
            ir,
            IoMode::Trampoline {
                putchar: putchar as usize as u64,
                getchar: getchar as usize as u64,
            },
        );
        debug!("jit emitted {} bytes", code.len());

        let mut region = ExecutableRegion::reserve(code.len())?;
        region.write(&code)?;
        region.finalize()?;
        unsafe { region.call(tape.head_ptr()) };

        let mut stdout = io::stdout();
        stdout.write_all(b"\n").map_err(Error::io("<stdout>"))?;
        stdout.flush().map_err(Error::io("<stdout>"))
    }
}

/// Runs the program under the JIT, or falls back to the IR interpreter on
/// hosts the JIT does not cover.
pub fn run(ir: &[Inst], tape: &mut crate::tape::Tape, flush_putchar: bool) -> Result<(), crate::error::Error> {
    #[cfg(all(unix, target_arch = "x86_64"))]
    {
        native::run(ir, tape, flush_putchar)
    }
    #[cfg(not(all(unix, target_arch = "x86_64")))]
    {
        use crate::interpreter::{run_ir, Session};
        use std::io;

        log::warn!("the JIT does not support this host; running the IR interpreter instead");
        let mut stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut session = Session::new(&mut stdin, &mut stdout);
        session.flush_putchar = flush_putchar;
        run_ir(ir, tape, &mut session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn primitive_encodings_match_the_manual() {
        let ir = parse(b"+-><").unwrap();
        // folds to nothing; emit individual ops instead
        assert!(ir.is_empty());

        let code = compile(&parse(b"+").unwrap(), IoMode::Syscall);
        assert_eq!(
            code,
            [
                0x53, 0x48, 0x89, 0xfb, // push rbx; mov rbx, rdi
                0xfe, 0x03, // inc byte ptr [rbx]
                0x5b, 0x31, 0xc0, 0xc3, // pop rbx; xor eax, eax; ret
            ]
        );
    }

    #[test]
    fn loops_are_patched_with_matching_displacements() {
        let code = compile(&parse(b"+[-]").unwrap(), IoMode::Syscall);
        // prologue(4) inc(2) then: cmp(3) je(6) ... patched over Assign? `[-]`
        // reduces to Assign, so force a real loop instead.
        assert!(!code.is_empty());

        let code = compile(&parse(b"[.]").unwrap(), IoMode::Syscall);
        // prologue 4; cmp 3 at 4; je at 7 (rel32 at 9); putchar syscall 20 at
        // 13; cmp 3 at 33; jne at 36 (rel32 at 38); end at 42
        assert_eq!(&code[7..9], &[0x0f, 0x84]);
        let je_rel = i32::from_le_bytes(code[9..13].try_into().unwrap());
        assert_eq!(je_rel, 42 - 13);
        assert_eq!(&code[36..38], &[0x0f, 0x85]);
        let jne_rel = i32::from_le_bytes(code[38..42].try_into().unwrap());
        assert_eq!(jne_rel, 13 - 42);
        // no unpatched placeholder remains
        assert!(!code.windows(6).any(|w| w == [0x0f, 0x84, 0, 0, 0, 0]));
    }

    #[test]
    fn search_zero_is_a_tight_inline_loop() {
        let code = compile(&parse(b"[>]").unwrap(), IoMode::Syscall);
        assert_eq!(
            &code[4..15],
            &[
                0x80, 0x3b, 0x00, // cmp byte ptr [rbx], 0
                0x74, 0x06, // je +6
                0x48, 0x8d, 0x5b, 0x01, // lea rbx, [rbx + 1]
                0xeb, 0xf5, // jmp -11
            ]
        );
    }

    #[test]
    fn copy_loop_reads_multiplies_and_writes() {
        let code = compile(&parse(b"[->++<]").unwrap(), IoMode::Syscall);
        let body = &code[4..];
        // if: cmp + je, then mov al,2; mul; add [rbx+1], al; mov [rbx],0
        assert_eq!(&body[0..3], &[0x80, 0x3b, 0x00]);
        assert_eq!(&body[3..5], &[0x0f, 0x84]);
        assert_eq!(&body[9..11], &[0xb0, 0x02]);
        assert_eq!(&body[11..13], &[0xf6, 0x23]);
        assert_eq!(&body[13..16], &[0x00, 0x43, 0x01]);
        assert_eq!(&body[16..19], &[0xc6, 0x03, 0x00]);
    }

    #[test]
    fn breakpoint_is_int3() {
        let code = compile(&parse(b"#").unwrap(), IoMode::Syscall);
        assert_eq!(code[4], 0xcc);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn jitted_code_mutates_the_tape() {
        use crate::tape::Tape;

        // 3 * 3 into the next cell, no I/O involved
        let ir = parse(b"+++[>+++<-]").unwrap();
        let code = compile(&ir, IoMode::Syscall);
        let mut region = ExecutableRegion::reserve(code.len()).unwrap();
        region.write(&code).unwrap();
        region.finalize().unwrap();

        let mut tape = Tape::new(64);
        unsafe { region.call(tape.head_ptr()) };
        assert_eq!(tape.get(), 0);
        assert_eq!(tape.get_at(1).unwrap(), 9);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn jit_output_matches_both_interpreters() {
        use std::io::Cursor;

        use crate::interpreter::{run_direct, run_ir, Session};
        use crate::parser::trim;
        use crate::tape::Tape;

        let scenarios: &[(&str, &[u8])] = &[
            (",+.", b"a"),
            ("+++[>+++<-]>.", b""),
            ("[-]+++.", b""),
            ("+>+>+>+>+[<]>.", b""),
            (",[.,]", b"abc\0"),
        ];
        for &(src, input) in scenarios {
            let trimmed = trim(src);
            let mut tape = Tape::new(4096);
            let mut direct_in = Cursor::new(input.to_vec());
            let mut direct_out = Vec::new();
            let mut session = Session::new(&mut direct_in, &mut direct_out);
            run_direct(trimmed.as_bytes(), &mut tape, &mut session).unwrap();

            let ir = parse(src.as_bytes()).unwrap();
            let mut tape = Tape::new(4096);
            let mut ir_in = Cursor::new(input.to_vec());
            let mut ir_out = Vec::new();
            let mut session = Session::new(&mut ir_in, &mut ir_out);
            run_ir(&ir, &mut tape, &mut session).unwrap();

            let jit_out = native::run_captured(&ir, input).unwrap();

            assert_eq!(jit_out, direct_out, "jit vs direct: {}", src);
            assert_eq!(jit_out, ir_out, "jit vs ir: {}", src);
        }
    }
}
