use std::error::Error;
use std::fmt;

use unicode_width::UnicodeWidthStr;

use crate::inst::Inst;

/// The brainfuck alphabet plus the breakpoint marker `#`.
pub const INSTRUCTION_CHARS: &[u8] = b"+-<>.,[]#";

/// Strips everything that is not an instruction character, preserving order.
pub fn trim(source: &str) -> String {
    source
        .chars()
        .filter(|c| c.is_ascii() && INSTRUCTION_CHARS.contains(&(*c as u8)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnclosedLoop,
    ExtraCloseLoop,
}
use ParseErrorKind::*;

/// A bracket mismatch, remembering enough of the source to point at the
/// offending character.
#[derive(Debug)]
pub struct ParseError {
    kind: ParseErrorKind,
    line: Vec<u8>,
    linenum: usize,
    column: usize,
    pos: usize,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind, code: &[u8], pos: usize) -> Self {
        let (line, linenum, column) = find_line(code, pos);
        Self {
            kind,
            line: line.into(),
            linenum,
            column,
            pos,
        }
    }

    pub fn kind(&self) -> ParseErrorKind {
        self.kind
    }

    /// Byte offset of the offending bracket in the source.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let line = String::from_utf8_lossy(&self.line);
        let width = UnicodeWidthStr::width(&line[0..self.column.min(line.len())]);

        match self.kind {
            UnclosedLoop => {
                writeln!(f, "reached EOF with unterminated loop")?;
                writeln!(
                    f,
                    "loop started at {}:{} (offset {})",
                    self.linenum, self.column, self.pos
                )?;
            }
            ExtraCloseLoop => {
                writeln!(
                    f,
                    "`]` at {}:{} (offset {}) when not in a loop",
                    self.linenum, self.column, self.pos
                )?;
            }
        };

        writeln!(f, "{}", line)?;
        write!(f, "{}^", " ".repeat(width))?;

        Ok(())
    }
}

impl Error for ParseError {}

fn find_line(code: &[u8], i: usize) -> (&[u8], usize, usize) {
    let column = code[0..i].iter().rev().take_while(|x| **x != b'\n').count();
    let end = i + code[i..].iter().take_while(|x| **x != b'\n').count();
    let linenum = code[0..(i - column)]
        .iter()
        .filter(|x| **x == b'\n')
        .count();
    (&code[(i - column)..end], linenum + 1, column)
}

/// Parses raw brainfuck source straight to peephole-optimized IR.
///
/// Non-instruction bytes are skipped. Runs of `+`/`-` and `<`/`>` fold as
/// they are pushed, and every loop is reduced the moment its `]` is seen:
/// `[-]`/`[+]` become [`Inst::Assign`], pointer-only bodies become
/// [`Inst::SearchZero`], copy/multiply bodies become an
/// `If … AddVar/SubVar/AddCMulVar … Assign(0) … EndIf` block, and `[]`
/// becomes [`Inst::InfLoop`]. Jump targets are linked before returning.
pub fn parse(code: &[u8]) -> Result<Vec<Inst>, ParseError> {
    let mut i = 0;
    let mut ir = parse_block(code, &mut i, 0)?;
    link_jumps(&mut ir);
    Ok(ir)
}

fn parse_block(code: &[u8], i: &mut usize, level: u32) -> Result<Vec<Inst>, ParseError> {
    // Position of the `[` that opened this block
    let start = i.saturating_sub(1);

    let mut ir = Vec::new();
    while let Some(&c) = code.get(*i) {
        *i += 1;

        match c {
            b'+' => push_add(&mut ir, 1),
            b'-' => push_add(&mut ir, -1),
            b'>' => push_move(&mut ir, 1),
            b'<' => push_move(&mut ir, -1),
            b'.' => ir.push(Inst::Putchar),
            b',' => ir.push(Inst::Getchar),
            b'#' => ir.push(Inst::BreakPoint),
            b'[' => {
                let body = parse_block(code, i, level + 1)?;
                reduce_loop(&mut ir, body);
            }
            b']' => {
                return if level == 0 {
                    Err(ParseError::new(ExtraCloseLoop, code, *i - 1))
                } else {
                    Ok(ir)
                };
            }
            _ => (),
        }
    }

    if level != 0 {
        Err(ParseError::new(UnclosedLoop, code, start))
    } else {
        Ok(ir)
    }
}

fn push_add(ir: &mut Vec<Inst>, n: i32) {
    match ir.last_mut() {
        Some(Inst::Add(m)) => {
            *m += n;
            if *m == 0 {
                ir.pop();
            }
        }
        Some(Inst::Assign(v)) => *v += n,
        _ => ir.push(Inst::Add(n)),
    }
}

fn push_move(ir: &mut Vec<Inst>, n: i32) {
    match ir.last_mut() {
        Some(Inst::MovePointer(m)) => {
            *m += n;
            if *m == 0 {
                ir.pop();
            }
        }
        _ => ir.push(Inst::MovePointer(n)),
    }
}

fn reduce_loop(ir: &mut Vec<Inst>, body: Vec<Inst>) {
    match body.as_slice() {
        // `[]` after folding; kept so emitted programs do not lose the hang
        [] => ir.push(Inst::InfLoop),
        // `[-]` / `[+]`: both drain the cell to zero
        [Inst::Add(1)] | [Inst::Add(-1)] => ir.push(Inst::Assign(0)),
        // `[>ⁿ]` / `[<ⁿ]`
        [Inst::MovePointer(n)] => ir.push(Inst::SearchZero(*n)),
        _ => {
            if let Some(deltas) = copy_loop_deltas(&body) {
                // The `If` guard doubles as the point where backends may
                // cache the source cell before the `*Var` ops consume it.
                ir.push(Inst::If(0));
                for &(offset, mul) in &deltas {
                    match mul {
                        1 => ir.push(Inst::AddVar(offset)),
                        -1 => ir.push(Inst::SubVar(offset)),
                        _ => ir.push(Inst::AddCMulVar(offset, mul)),
                    }
                }
                ir.push(Inst::Assign(0));
                ir.push(Inst::EndIf(0));
            } else {
                ir.push(Inst::LoopStart(0));
                ir.extend(body);
                ir.push(Inst::LoopEnd(0));
            }
        }
    }
}

/// Recognizes a loop body that only moves the pointer and adds to cells,
/// returns it to where it started, and decrements the loop cell by exactly
/// one per iteration. Returns the per-offset deltas in first-touched order,
/// excluding the loop cell itself.
fn copy_loop_deltas(body: &[Inst]) -> Option<Vec<(i32, i32)>> {
    let mut q = 0i32;
    let mut deltas: Vec<(i32, i32)> = Vec::new();
    for inst in body {
        match *inst {
            Inst::MovePointer(n) => q += n,
            Inst::Add(n) => match deltas.iter_mut().find(|(offset, _)| *offset == q) {
                Some((_, mul)) => *mul += n,
                None => deltas.push((q, n)),
            },
            _ => return None,
        }
    }
    if q != 0 {
        return None;
    }

    let counter = deltas.iter().find(|(offset, _)| *offset == 0)?;
    if counter.1 != -1 {
        return None;
    }

    deltas.retain(|&(offset, mul)| offset != 0 && mul != 0);
    Some(deltas)
}

/// Rewrites the jump operands of `LoopStart`/`LoopEnd` and `If`/`EndIf` to
/// absolute IR indices one past the matching partner.
pub fn link_jumps(ir: &mut [Inst]) {
    let mut stack = Vec::new();
    for i in 0..ir.len() {
        match ir[i] {
            Inst::LoopStart(_) | Inst::If(_) => stack.push(i),
            Inst::LoopEnd(_) => {
                if let Some(j) = stack.pop() {
                    ir[j] = Inst::LoopStart(i + 1);
                    ir[i] = Inst::LoopEnd(j + 1);
                }
            }
            Inst::EndIf(_) => {
                if let Some(j) = stack.pop() {
                    ir[j] = Inst::If(i + 1);
                    ir[i] = Inst::EndIf(j + 1);
                }
            }
            _ => (),
        }
    }
}

/// Prepends a [`Inst::BreakPoint`], shifting every jump target by one.
pub fn insert_top_break_point(ir: &mut Vec<Inst>) {
    for inst in ir.iter_mut() {
        match inst {
            Inst::LoopStart(target)
            | Inst::LoopEnd(target)
            | Inst::If(target)
            | Inst::EndIf(target) => *target += 1,
            _ => (),
        }
    }
    ir.insert(0, Inst::BreakPoint);
}
