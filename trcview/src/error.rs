//! Errors raised by trace ingestion and the analyses built on top of it.

use thiserror::Error;

/// Crate-wide error type.
///
/// `MemoryNotMapped` and `DecodeFailure` are expected while exploring a trace and callers usually
/// recover from them locally. `IllegalState` and `SealedMemoryTrace` indicate a misuse of the API.
#[derive(Error, Debug)]
pub enum Error {
    /// No mapped segment covers `address` at `step`
    #[error("memory at {address:#x} is not mapped at step {step}")]
    MemoryNotMapped { address: u64, step: u64 },

    /// An operation was performed in a state that does not allow it
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The decoder could not make sense of the instruction at `pc`
    #[error("cannot decode instruction at {pc:#x}")]
    DecodeFailure { pc: u64 },

    /// A device event referenced a device that was never defined
    #[error("unknown device {id}")]
    UnknownDevice { id: u32 },

    /// The trace listing could not be parsed
    #[error("malformed trace at line {line}: {reason}")]
    MalformedTrace { line: usize, reason: String },

    /// The memory trace was already trimmed and no longer accepts events
    #[error("memory trace is sealed")]
    SealedMemoryTrace,

    /// A memory access with a size that cannot be recorded
    #[error("invalid memory access size {size}")]
    InvalidAccessSize { size: usize },

    /// Type resolution was requested for an architecture with an unsupported pointer size
    #[error("unsupported pointer size {size}")]
    UnsupportedPointerSize { size: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! malformed {
    ($line:expr, $($arg:tt)*) => {
        crate::error::Error::MalformedTrace {
            line: $line,
            reason: format!($($arg)*),
        }
    };
}
pub(crate) use malformed;
