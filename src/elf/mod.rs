//! Just enough ELF to write small static executables by hand.
//!
//! Sources:
//! * /usr/include/elf.h
//! * https://wiki.osdev.org/ELF_Tutorial
//! * http://www.sco.com/developers/gabi/latest/ch4.eheader.html

mod types;
pub use types::*;
