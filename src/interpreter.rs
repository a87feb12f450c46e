use std::collections::HashMap;
use std::io::{self, Read, Write};

use log::debug;

use crate::error::Error;
use crate::inst::Inst;
use crate::parser::{ParseError, ParseErrorKind};
use crate::tape::Tape;

/// The I/O channels of one program run.
///
/// Output is buffered by whatever `output` is; it is flushed before every
/// read (so prompts appear) and when the run finishes. With `flush_putchar`
/// set, every written byte is flushed immediately instead.
pub struct Session<'a> {
    pub input: &'a mut dyn Read,
    pub output: &'a mut dyn Write,
    pub flush_putchar: bool,
}

impl<'a> Session<'a> {
    pub fn new(input: &'a mut dyn Read, output: &'a mut dyn Write) -> Session<'a> {
        Session {
            input,
            output,
            flush_putchar: false,
        }
    }

    fn putchar(&mut self, byte: u8) -> Result<(), Error> {
        self.output
            .write_all(&[byte])
            .map_err(Error::io("<stdout>"))?;
        if self.flush_putchar {
            self.output.flush().map_err(Error::io("<stdout>"))?;
        }
        Ok(())
    }

    /// Reads one byte; `None` on end of input.
    fn getchar(&mut self) -> Result<Option<u8>, Error> {
        self.output.flush().map_err(Error::io("<stdout>"))?;
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("<stdin>")(e)),
            }
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.putchar(b'\n')?;
        self.output.flush().map_err(Error::io("<stdout>"))
    }
}

/// Executes trimmed source directly, without building IR.
///
/// Matching bracket pairs are found by scanning on first use and memoized in
/// both directions, so loop bodies pay the scan once.
pub fn run_direct(source: &[u8], tape: &mut Tape, session: &mut Session) -> Result<(), Error> {
    let mut jumps: HashMap<usize, usize> = HashMap::new();
    let mut pc = 0;

    while let Some(&c) = source.get(pc) {
        match c {
            b'+' => tape.add(1),
            b'-' => tape.add(-1),
            b'>' => tape.shift(1)?,
            b'<' => tape.shift(-1)?,
            b'.' => session.putchar(tape.get())?,
            b',' => {
                if let Some(byte) = session.getchar()? {
                    tape.set(byte as i32);
                }
            }
            b'[' => {
                if !jumps.contains_key(&pc) {
                    let close = find_close(source, pc)?;
                    jumps.insert(pc, close);
                    jumps.insert(close, pc);
                }
                if tape.get() == 0 {
                    pc = jumps[&pc];
                }
            }
            b']' => {
                let open = match jumps.get(&pc) {
                    Some(&open) => open,
                    None => {
                        let err = ParseError::new(ParseErrorKind::ExtraCloseLoop, source, pc);
                        return Err(err.into());
                    }
                };
                if tape.get() != 0 {
                    pc = open;
                }
            }
            _ => (),
        }
        pc += 1;
    }

    session.finish()
}

fn find_close(source: &[u8], open: usize) -> Result<usize, Error> {
    let mut depth = 1;
    let mut pc = open + 1;
    while let Some(&c) = source.get(pc) {
        match c {
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(pc);
                }
            }
            _ => (),
        }
        pc += 1;
    }
    Err(ParseError::new(ParseErrorKind::UnclosedLoop, source, open).into())
}

/// Executes optimized IR. Jump operands are absolute indices assigned by the
/// parser, so no matching happens at run time.
pub fn run_ir(ir: &[Inst], tape: &mut Tape, session: &mut Session) -> Result<(), Error> {
    let mut pc = 0;

    while let Some(&inst) = ir.get(pc) {
        match inst {
            Inst::MovePointer(offset) => tape.shift(offset)?,
            Inst::Add(value) => tape.add(value),
            Inst::Assign(value) => tape.set(value),
            Inst::Putchar => session.putchar(tape.get())?,
            Inst::Getchar => {
                if let Some(byte) = session.getchar()? {
                    tape.set(byte as i32);
                }
            }
            Inst::LoopStart(target) | Inst::If(target) => {
                if tape.get() == 0 {
                    pc = target;
                    continue;
                }
            }
            Inst::LoopEnd(target) => {
                if tape.get() != 0 {
                    pc = target;
                    continue;
                }
            }
            Inst::EndIf(_) => (),
            Inst::SearchZero(step) => {
                while tape.get() != 0 {
                    tape.shift(step)?;
                }
            }
            Inst::AddVar(offset) => tape.add_at(offset, tape.get() as i32)?,
            Inst::SubVar(offset) => tape.add_at(offset, -(tape.get() as i32))?,
            Inst::AddCMulVar(offset, mul) => {
                tape.add_at(offset, (tape.get() as i32).wrapping_mul(mul))?
            }
            Inst::InfLoop => {
                if tape.get() != 0 {
                    loop {
                        std::hint::spin_loop();
                    }
                }
            }
            Inst::BreakPoint => debug!("breakpoint reached at ir index {}", pc),
        }
        pc += 1;
    }

    session.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, trim};
    use crate::tape::Tape;
    use std::io::Cursor;

    fn direct(source: &str, input: &[u8]) -> String {
        let trimmed = trim(source);
        let mut tape = Tape::new(4096);
        let mut input = Cursor::new(input.to_vec());
        let mut output = Vec::new();
        let mut session = Session::new(&mut input, &mut output);
        run_direct(trimmed.as_bytes(), &mut tape, &mut session).unwrap();
        String::from_utf8(output).unwrap()
    }

    fn optimized(source: &str, input: &[u8]) -> String {
        let ir = parse(source.as_bytes()).unwrap();
        let mut tape = Tape::new(4096);
        let mut input = Cursor::new(input.to_vec());
        let mut output = Vec::new();
        let mut session = Session::new(&mut input, &mut output);
        run_ir(&ir, &mut tape, &mut session).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn echo_increments_input() {
        assert_eq!(direct(",+.", b"a"), "b\n");
        assert_eq!(optimized(",+.", b"a"), "b\n");
    }

    #[test]
    fn multiply_loop_prints_tab() {
        assert_eq!(direct("+++[>+++<-]>.", b""), "\t\n");
        assert_eq!(optimized("+++[>+++<-]>.", b""), "\t\n");
    }

    #[test]
    fn clear_then_add_prints_three() {
        assert_eq!(direct("[-]+++.", b""), "\x03\n");
        assert_eq!(optimized("[-]+++.", b""), "\x03\n");
    }

    #[test]
    fn search_zero_left_stops_below_the_origin() {
        assert_eq!(direct("+>+>+>+>+[<]>.", b""), "\x01\n");
        assert_eq!(optimized("+>+>+>+>+[<]>.", b""), "\x01\n");
    }

    #[test]
    fn eof_leaves_cell_unchanged() {
        assert_eq!(direct("+++,.", b""), "\x03\n");
        assert_eq!(optimized("+++,.", b""), "\x03\n");
    }

    #[test]
    fn comments_are_a_no_op() {
        assert_eq!(direct("Hello world!", b""), "\n");
        assert_eq!(optimized("Hello world!", b""), "\n");
    }

    #[test]
    fn breakpoints_are_ignored_by_the_host() {
        assert_eq!(direct("#+.#", b""), "\x01\n");
        assert_eq!(optimized("#+.#", b""), "\x01\n");
    }

    #[test]
    fn direct_and_ir_agree_on_nested_programs() {
        let cases: &[(&str, &[u8])] = &[
            ("++[>++[->+<]<-]>>.", b""),
            (",[.,]", b"abc\0"),
            ("++++[>++++[>++++<-]<-]>>.", b""),
            ("+++>[-]<[->>+<<]>>.", b""),
        ];
        for (src, input) in cases {
            assert_eq!(direct(src, input), optimized(src, input), "src: {}", src);
        }
    }

    #[test]
    fn runaway_head_aborts() {
        let trimmed = trim(">");
        let mut tape = Tape::new(2);
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let mut session = Session::new(&mut input, &mut output);
        let err = run_direct(trimmed.as_bytes(), &mut tape, &mut session).unwrap_err();
        assert!(matches!(err, Error::TapeOverflow { .. }));
    }

    #[test]
    fn stray_close_bracket_is_reported() {
        let mut tape = Tape::new(64);
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let mut session = Session::new(&mut input, &mut output);
        let err = run_direct(b"+]", &mut tape, &mut session).unwrap_err();
        assert!(matches!(err, Error::MalformedSource(_)));
    }
}
