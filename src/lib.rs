//! Bfkit is an optimizing brainfuck compiler and execution engine.
//!
//! Source code is trimmed and compiled to a peephole-optimized IR, which can
//! be interpreted, JIT-compiled and run in-process, transpiled to C, or
//! emitted as a standalone ELF (x86/x86-64/ARM EABI) or PE (x86/x64)
//! executable without a linker.
//!
//! # Examples
//! ```
//! // 2048 is the tape length to use
//! let ir = bfkit::parse(b",[.,]").unwrap();
//! let c = bfkit::codegen::c_codegen::c_source(&ir, 2048);
//! print!("{}", c);
//! ```

pub mod codegen;
pub mod elf;
mod error;
pub mod inst;
pub mod interpreter;
pub mod jit;
pub mod parser;
pub mod pe;
pub mod tape;

pub use error::Error;
pub use inst::Inst;
pub use parser::{parse, trim};
pub use tape::{Tape, DEFAULT_HEAP_SIZE};
