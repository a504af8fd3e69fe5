//! Structural verification of a function body
//!
//! `verify_function` walks the whole body with the shared reader before a
//! function is installed: every operand must decode, every tmpvar index
//! must be inside the declared slot count, and every jump target must land
//! on an instruction boundary or exactly one past the end (which returns
//! from the function). The runtime re-checks operands during execution,
//! but verification makes image installation all-or-nothing.

use crate::{BytecodeError, BytecodeReader, Opcode};

/// Verify one function body against its declared slot count.
pub fn verify_function(body: &[u8], tmpvar_count: u16) -> Result<(), BytecodeError> {
    let mut reader = BytecodeReader::new(body, tmpvar_count);
    let mut starts = Vec::new();
    let mut targets: Vec<u32> = Vec::new();

    while !reader.at_end() {
        starts.push(reader.pc() as u32);
        let op = reader.opcode()?;
        match op {
            Opcode::LineInfo => {
                reader.imm32()?;
            }
            Opcode::AConst | Opcode::DConst | Opcode::Inc => {
                reader.tmpvar()?;
            }
            Opcode::Assign | Opcode::Neg | Opcode::Not | Opcode::Len => {
                reader.tmpvar()?;
                reader.tmpvar()?;
            }
            Opcode::IConst | Opcode::FConst => {
                reader.tmpvar()?;
                reader.imm32()?;
            }
            Opcode::SConst => {
                reader.tmpvar()?;
                reader.string()?;
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::Gte
            | Opcode::Gt
            | Opcode::EqI
            | Opcode::LoadArray
            | Opcode::StoreArray
            | Opcode::GetDictKeyByIndex
            | Opcode::GetDictValByIndex => {
                reader.tmpvar()?;
                reader.tmpvar()?;
                reader.tmpvar()?;
            }
            Opcode::LoadSymbol => {
                reader.tmpvar()?;
                reader.string()?;
            }
            Opcode::StoreSymbol => {
                reader.string()?;
                reader.tmpvar()?;
            }
            Opcode::LoadDot => {
                reader.tmpvar()?;
                reader.tmpvar()?;
                reader.string()?;
            }
            Opcode::StoreDot => {
                reader.tmpvar()?;
                reader.string()?;
                reader.tmpvar()?;
            }
            Opcode::Call => {
                reader.tmpvar()?;
                reader.tmpvar()?;
                let n = reader.arg_count()?;
                for _ in 0..n {
                    reader.tmpvar()?;
                }
            }
            Opcode::ThisCall => {
                reader.tmpvar()?;
                reader.tmpvar()?;
                reader.string()?;
                let n = reader.arg_count()?;
                for _ in 0..n {
                    reader.tmpvar()?;
                }
            }
            Opcode::Jmp | Opcode::JmpIfEq => {
                targets.push(reader.imm32()?);
            }
            Opcode::JmpIfTrue | Opcode::JmpIfFalse => {
                reader.tmpvar()?;
                targets.push(reader.imm32()?);
            }
        }
    }

    let size = body.len() as u32;
    for target in targets {
        if target > size {
            return Err(BytecodeError::JumpOutOfRange { target, size });
        }
        if target != size && starts.binary_search(&target).is_err() {
            return Err(BytecodeError::JumpIntoOperand(target));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BytecodeEncoder;

    #[test]
    fn test_verify_straight_line() {
        let mut enc = BytecodeEncoder::new();
        enc.line_info(1)
            .iconst(1, 40)
            .iconst(2, 2)
            .binary(Opcode::Add, 0, 1, 2);
        assert!(verify_function(&enc.finish(), 4).is_ok());
    }

    #[test]
    fn test_verify_jump_to_end_returns() {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(0, 1);
        let end = enc.pc() + 5;
        enc.jmp(end);
        assert!(verify_function(&enc.finish(), 4).is_ok());
    }

    #[test]
    fn test_verify_rejects_jump_past_end() {
        let mut enc = BytecodeEncoder::new();
        enc.jmp(6);
        assert!(matches!(
            verify_function(&enc.finish(), 4),
            Err(BytecodeError::JumpOutOfRange { target: 6, size: 5 })
        ));
    }

    #[test]
    fn test_verify_rejects_jump_into_operand() {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(0, 1);
        enc.jmp(2);
        assert!(matches!(
            verify_function(&enc.finish(), 4),
            Err(BytecodeError::JumpIntoOperand(2))
        ));
    }

    #[test]
    fn test_verify_rejects_tmpvar_overflow() {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(3, 1);
        assert!(verify_function(&enc.finish(), 3).is_err());
    }

    #[test]
    fn test_verify_rejects_truncated_tail() {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(0, 1);
        let mut body = enc.finish();
        body.push(Opcode::IConst as u8);
        body.push(0);
        assert!(matches!(
            verify_function(&body, 4),
            Err(BytecodeError::Truncated(_))
        ));
    }

    #[test]
    fn test_verify_rejects_unknown_opcode() {
        assert!(matches!(
            verify_function(&[0xEE], 4),
            Err(BytecodeError::UnknownOpcode(0xEE, 0))
        ));
    }
}
