use std::fmt;

/// One instruction in bfkit's intermediate representation.
///
/// Jump operands on `LoopStart`/`LoopEnd`/`If`/`EndIf` are absolute IR
/// indices pointing one past the matching partner, assigned by
/// [`link_jumps`](crate::parser::link_jumps) once the whole program is built.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    /// `MovePointer(offset)` Moves the tape head by *offset* cells
    MovePointer(i32),
    /// `Add(value)` Adds *value* to the current cell, wrapping mod 256
    Add(i32),
    /// `Assign(value)` Sets the current cell to *value* mod 256
    Assign(i32),
    /// `Putchar` Writes the current cell to stdout
    Putchar,
    /// `Getchar` Reads one byte into the current cell; EOF leaves it unchanged
    Getchar,
    /// `LoopStart(target)` Jumps past the matching `LoopEnd` if the cell is zero
    LoopStart(usize),
    /// `LoopEnd(target)` Jumps back past the matching `LoopStart` if the cell is nonzero
    LoopEnd(usize),
    /// `If(target)` Skips to the matching `EndIf` if the cell is zero
    If(usize),
    /// `EndIf(target)` Closes an `If`; no action at runtime
    EndIf(usize),
    /// `SearchZero(step)` Moves the head by *step* until it rests on a zero cell
    SearchZero(i32),
    /// `AddVar(offset)` Adds the current cell to the cell at *offset*
    AddVar(i32),
    /// `SubVar(offset)` Subtracts the current cell from the cell at *offset*
    SubVar(i32),
    /// `AddCMulVar(offset, mul)` Adds the current cell times *mul* to the cell at *offset*
    AddCMulVar(i32, i32),
    /// `InfLoop` Spins forever if the current cell is nonzero
    InfLoop,
    /// `BreakPoint` Traps on backends that support it, otherwise ignored
    BreakPoint,
}

impl fmt::Debug for Inst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Inst::MovePointer(offset) => write!(f, "MovePointer(offset={})", offset),
            Inst::Add(value) => write!(f, "Add(value={})", value),
            Inst::Assign(value) => write!(f, "Assign(value={})", value),
            Inst::Putchar => write!(f, "Putchar"),
            Inst::Getchar => write!(f, "Getchar"),
            Inst::LoopStart(target) => write!(f, "LoopStart(target={})", target),
            Inst::LoopEnd(target) => write!(f, "LoopEnd(target={})", target),
            Inst::If(target) => write!(f, "If(target={})", target),
            Inst::EndIf(target) => write!(f, "EndIf(target={})", target),
            Inst::SearchZero(step) => write!(f, "SearchZero(step={})", step),
            Inst::AddVar(offset) => write!(f, "AddVar(offset={})", offset),
            Inst::SubVar(offset) => write!(f, "SubVar(offset={})", offset),
            Inst::AddCMulVar(offset, mul) => {
                write!(f, "AddCMulVar(offset={}, mul={})", offset, mul)
            }
            Inst::InfLoop => write!(f, "InfLoop"),
            Inst::BreakPoint => write!(f, "BreakPoint"),
        }
    }
}
