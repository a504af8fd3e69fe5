//! Error taxonomy and per-environment error state
//!
//! Errors inside the runtime propagate as `false` returns up the helper
//! chain; the failing helper records the message, source file, and line on
//! the environment. `enter_vm` and the other host entry points convert
//! that state into a [`VmError`] for the embedder.

use std::fmt;

/// Capacity of the per-environment error message buffer.
pub(crate) const ERROR_MSG_MAX: usize = 1024;

/// Capacity of the per-environment file-name buffer.
pub(crate) const FILE_NAME_MAX: usize = 256;

/// The kinds of faults the core surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operand of the wrong variant
    Type,
    /// Integer or float zero divisor
    DivisionByZero,
    /// Array index out of range
    Index,
    /// Missing dictionary key
    Key,
    /// Unknown global symbol
    Name,
    /// Malformed byte image (truncated, bad tmpvar, bad jump)
    BrokenBytecode,
    /// Allocation failed
    OutOfMemory,
    /// JIT code region exhausted
    CodeTooBig,
    /// Branch displacement exceeds the architecture's immediate range
    BranchTooFar,
    /// Mapping the JIT code region failed
    MemoryMapFailed,
    /// Nested call depth exceeded the frame-stack capacity
    StackOverflow,
    /// `register_source` without an installed compiler, or compile failure
    Compile,
    /// Pin list full, unpin of an unpinned value, and similar misuse
    Api,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Type => "type error",
            ErrorKind::DivisionByZero => "division by zero",
            ErrorKind::Index => "index error",
            ErrorKind::Key => "key error",
            ErrorKind::Name => "name error",
            ErrorKind::BrokenBytecode => "broken bytecode",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::CodeTooBig => "code too big",
            ErrorKind::BranchTooFar => "branch too far",
            ErrorKind::MemoryMapFailed => "memory map failed",
            ErrorKind::StackOverflow => "stack overflow",
            ErrorKind::Compile => "compile error",
            ErrorKind::Api => "api misuse",
        };
        f.write_str(name)
    }
}

/// A fault captured at the `enter_vm` boundary: the error kind plus the
/// message, file, and line recorded by the failing helper.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct VmError {
    /// What went wrong
    pub kind: ErrorKind,
    /// The formatted message (capped at 1 KB)
    pub message: String,
    /// File name of the function that was executing
    pub file: String,
    /// Line recorded by the most recent LINEINFO instruction
    pub line: i32,
}

impl VmError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        VmError {
            kind,
            message: message.into(),
            file: String::new(),
            line: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location() {
        let err = VmError {
            kind: ErrorKind::Key,
            message: "Key \"x\" not found.".to_string(),
            file: "main.nc".to_string(),
            line: 7,
        };
        assert_eq!(err.to_string(), "main.nc:7: Key \"x\" not found.");
    }
}
