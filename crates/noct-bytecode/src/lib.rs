//! Bytecode definitions for the Noct VM
//!
//! This crate defines the instruction set, the operand encoding, and the
//! on-disk image container shared by the compiler and the runtime:
//! - **Opcodes**: the single-byte instruction set (`opcode` module)
//! - **Reader**: a bounds-checked operand cursor over a function body
//!   (`reader` module)
//! - **Image**: the `"Noct Bytecode"` container with per-function records
//!   (`image` module)
//! - **Verify**: structural verification of a function body before it is
//!   installed into a VM (`verify` module)
//!
//! All multi-byte operands are big-endian. String operands are inline in
//! the instruction stream as `{len: u32, hash: u32, bytes}`; the hash is
//! the canonical FNV-1a-32 of the bytes and is trusted by the runtime for
//! symbol and key lookups.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod image;
pub mod opcode;
pub mod reader;
pub mod verify;

pub use image::{BytecodeEncoder, FunctionImage, FunctionRecord, ImageReader, IMAGE_MAGIC};
pub use opcode::Opcode;
pub use reader::{BytecodeReader, StringOperand};
pub use verify::verify_function;

/// Maximum number of call arguments an instruction may carry.
pub const ARG_MAX: usize = 32;

/// Maximum number of temporary slots a function may declare.
pub const TMPVAR_MAX: usize = 128;

/// Canonical 32-bit FNV-1a hash used for every string operand and symbol
/// name in an image. The compiler and the runtime must agree on this
/// function byte for byte.
pub fn string_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Bytecode decoding and image errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    /// The byte stream ended in the middle of an instruction or record
    #[error("truncated bytecode at offset {0}")]
    Truncated(usize),

    /// An unknown opcode byte was encountered
    #[error("unknown opcode 0x{0:02x} at offset {1}")]
    UnknownOpcode(u8, usize),

    /// A temporary-slot operand is outside the declared slot count
    #[error("tmpvar index {index} out of range (function declares {limit} slots)")]
    TmpvarOutOfRange {
        /// The offending slot index
        index: u16,
        /// The function's declared slot count
        limit: u16,
    },

    /// A jump target is past one-beyond-the-end of the body
    #[error("jump target {target} out of range (body is {size} bytes)")]
    JumpOutOfRange {
        /// The encoded logical-PC target
        target: u32,
        /// The body size in bytes
        size: u32,
    },

    /// A jump target does not land on an instruction boundary
    #[error("jump target {0} is not an instruction boundary")]
    JumpIntoOperand(u32),

    /// A call carries more arguments than the instruction set allows
    #[error("call with {0} arguments exceeds the maximum of {max}", max = crate::ARG_MAX)]
    TooManyArgs(usize),

    /// The image container is malformed
    #[error("bad image: {0}")]
    BadImage(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash_matches_known_vectors() {
        // The compiler emits 0x83d03615 for the "length" field selector.
        assert_eq!(string_hash(b"length"), 0x83d0_3615);
        assert_eq!(string_hash(b""), 0x811c_9dc5);
    }

    #[test]
    fn test_string_hash_differs_for_near_strings() {
        assert_ne!(string_hash(b"main"), string_hash(b"mains"));
        assert_ne!(string_hash(b"ab"), string_hash(b"ba"));
    }
}
