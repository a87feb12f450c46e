use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::parser::ParseError;

/// Everything that can go wrong between loading source code and finishing a
/// run or an emitted artifact. The pipeline recovers from none of these; the
/// caller prints the message and exits nonzero.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    MalformedSource(#[from] ParseError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("option -t, --target: invalid value: {0:?} is specified")]
    InvalidTarget(String),

    #[error("no brainfuck source code specified")]
    MissingInput,

    #[error("tape head moved to {head}, outside of 0..{len}")]
    TapeOverflow { head: i64, len: usize },

    #[error("emitted code needs {need} bytes but the executable region holds {capacity}")]
    AssemblerCapacity { need: usize, capacity: usize },
}

impl Error {
    /// Tags an `io::Error` with the path (or pseudo-path) it came from.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
