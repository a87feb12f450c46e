//! Just enough PE/COFF to write small Windows executables by hand.
//!
//! Sources:
//! * winnt.h
//! * https://learn.microsoft.com/en-us/windows/win32/debug/pe-format

mod types;
pub use types::*;
