//! Bytecode interpreter
//!
//! A single fetch-decode-dispatch loop over the shared operand reader.
//! Trivial opcodes (ASSIGN, the constants, INC, the jumps) are handled
//! inline; everything else goes through the same helpers the JIT calls.
//! Any decode failure faults with `BrokenBytecode` before the instruction
//! takes effect. The EQI/JMPIFEQ pair is fused through an interpreter
//! flag in place of processor flags.

use crate::vm::error::ErrorKind;
use crate::vm::exec;
use crate::vm::frame::Env;
use crate::vm::object::FuncObj;
use crate::vm::value::Value;
use crate::vm_error;
use noct_bytecode::{BytecodeReader, Opcode, ARG_MAX};

/// Execute `func`'s byte image on `env`'s current frame. On success the
/// return value is left in slot 0.
pub(crate) fn run(env: *mut Env, func: *mut FuncObj) -> bool {
    unsafe {
        let code: &[u8] = &(*func).bytecode;
        let tmpvar_count = (*func).tmpvar_count.max(1);
        let mut reader = BytecodeReader::new(code, tmpvar_count);
        let mut eq_flag = false;

        macro_rules! broken {
            () => {{
                vm_error!(env, ErrorKind::BrokenBytecode, "Broken bytecode.");
                return false;
            }};
        }
        macro_rules! decode {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(_) => broken!(),
                }
            };
        }
        macro_rules! slot {
            ($i:expr) => {
                (*(*env).frame).slot($i as usize)
            };
        }
        macro_rules! helper {
            ($f:path, $($arg:expr),*) => {
                if !$f(env, $($arg as i32),*) {
                    return false;
                }
            };
        }

        while !reader.at_end() {
            let op = decode!(reader.opcode());
            match op {
                Opcode::LineInfo => {
                    let line = decode!(reader.imm32());
                    (*env).line = line as i32;
                }
                Opcode::Assign => {
                    let dst = decode!(reader.tmpvar());
                    let src = decode!(reader.tmpvar());
                    *slot!(dst) = *slot!(src);
                }
                Opcode::IConst => {
                    let dst = decode!(reader.tmpvar());
                    let value = decode!(reader.imm32());
                    *slot!(dst) = Value::int(value as i32);
                }
                Opcode::FConst => {
                    let dst = decode!(reader.tmpvar());
                    let bits = decode!(reader.imm32());
                    *slot!(dst) = Value::float(f32::from_bits(bits));
                }
                Opcode::SConst => {
                    let dst = decode!(reader.tmpvar());
                    let s = decode!(reader.string());
                    if !exec::make_string_with_hash(
                        env,
                        slot!(dst),
                        s.bytes.as_ptr(),
                        s.bytes.len() as u32,
                        s.hash,
                    ) {
                        return false;
                    }
                }
                Opcode::AConst => {
                    let dst = decode!(reader.tmpvar());
                    if !exec::make_empty_array(env, slot!(dst)) {
                        return false;
                    }
                }
                Opcode::DConst => {
                    let dst = decode!(reader.tmpvar());
                    if !exec::make_empty_dict(env, slot!(dst)) {
                        return false;
                    }
                }
                Opcode::Inc => {
                    // Integer-only by contract; the payload wraps and the
                    // tag is left untouched.
                    let dst = decode!(reader.tmpvar());
                    let value = slot!(dst);
                    (*value).payload.i = (*value).payload.i.wrapping_add(1);
                }
                Opcode::Add => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::add_helper, d, a, b);
                }
                Opcode::Sub => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::sub_helper, d, a, b);
                }
                Opcode::Mul => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::mul_helper, d, a, b);
                }
                Opcode::Div => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::div_helper, d, a, b);
                }
                Opcode::Mod => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::mod_helper, d, a, b);
                }
                Opcode::And => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::and_helper, d, a, b);
                }
                Opcode::Or => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::or_helper, d, a, b);
                }
                Opcode::Xor => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::xor_helper, d, a, b);
                }
                Opcode::Shl => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::shl_helper, d, a, b);
                }
                Opcode::Shr => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::shr_helper, d, a, b);
                }
                Opcode::Neg => {
                    let (d, s) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::neg_helper, d, s);
                }
                Opcode::Not => {
                    let (d, s) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::not_helper, d, s);
                }
                Opcode::Lt => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::lt_helper, d, a, b);
                }
                Opcode::Lte => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::lte_helper, d, a, b);
                }
                Opcode::Eq => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::eq_helper, d, a, b);
                }
                Opcode::Neq => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::neq_helper, d, a, b);
                }
                Opcode::Gte => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::gte_helper, d, a, b);
                }
                Opcode::Gt => {
                    let (d, a, b) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::gt_helper, d, a, b);
                }
                Opcode::EqI => {
                    let _dst = decode!(reader.tmpvar());
                    let src1 = decode!(reader.tmpvar());
                    let src2 = decode!(reader.tmpvar());
                    eq_flag = (*slot!(src1)).raw_int() == (*slot!(src2)).raw_int();
                }
                Opcode::LoadArray => {
                    let (d, c, i) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::load_array_helper, d, c, i);
                }
                Opcode::StoreArray => {
                    let (c, i, v) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::store_array_helper, c, i, v);
                }
                Opcode::Len => {
                    let (d, s) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::len_helper, d, s);
                }
                Opcode::GetDictKeyByIndex => {
                    let (d, c, i) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::get_dict_key_by_index_helper, d, c, i);
                }
                Opcode::GetDictValByIndex => {
                    let (d, c, i) = (decode!(reader.tmpvar()), decode!(reader.tmpvar()), decode!(reader.tmpvar()));
                    helper!(exec::get_dict_val_by_index_helper, d, c, i);
                }
                Opcode::LoadSymbol => {
                    let dst = decode!(reader.tmpvar());
                    let name = decode!(reader.string());
                    if !exec::load_symbol_helper(
                        env,
                        dst as i32,
                        name.bytes.as_ptr(),
                        name.bytes.len() as u32,
                        name.hash,
                    ) {
                        return false;
                    }
                }
                Opcode::StoreSymbol => {
                    let name = decode!(reader.string());
                    let src = decode!(reader.tmpvar());
                    if !exec::store_symbol_helper(
                        env,
                        name.bytes.as_ptr(),
                        name.bytes.len() as u32,
                        name.hash,
                        src as i32,
                    ) {
                        return false;
                    }
                }
                Opcode::LoadDot => {
                    let dst = decode!(reader.tmpvar());
                    let dict = decode!(reader.tmpvar());
                    let field = decode!(reader.string());
                    if !exec::load_dot_helper(
                        env,
                        dst as i32,
                        dict as i32,
                        field.bytes.as_ptr(),
                        field.bytes.len() as u32,
                        field.hash,
                    ) {
                        return false;
                    }
                }
                Opcode::StoreDot => {
                    let dict = decode!(reader.tmpvar());
                    let field = decode!(reader.string());
                    let src = decode!(reader.tmpvar());
                    if !exec::store_dot_helper(
                        env,
                        dict as i32,
                        field.bytes.as_ptr(),
                        field.bytes.len() as u32,
                        field.hash,
                        src as i32,
                    ) {
                        return false;
                    }
                }
                Opcode::Call => {
                    let dst = decode!(reader.tmpvar());
                    let func_slot = decode!(reader.tmpvar());
                    let arg_count = decode!(reader.arg_count());
                    let mut args = [0i32; ARG_MAX];
                    for arg in args.iter_mut().take(arg_count as usize) {
                        *arg = decode!(reader.tmpvar()) as i32;
                    }
                    if !exec::call_helper(
                        env,
                        dst as i32,
                        func_slot as i32,
                        arg_count as i32,
                        args.as_ptr(),
                    ) {
                        return false;
                    }
                }
                Opcode::ThisCall => {
                    let dst = decode!(reader.tmpvar());
                    let recv = decode!(reader.tmpvar());
                    let name = decode!(reader.string());
                    let arg_count = decode!(reader.arg_count());
                    let mut args = [0i32; ARG_MAX];
                    for arg in args.iter_mut().take(arg_count as usize) {
                        *arg = decode!(reader.tmpvar()) as i32;
                    }
                    if !exec::this_call_helper(
                        env,
                        dst as i32,
                        recv as i32,
                        name.bytes.as_ptr(),
                        name.bytes.len() as u32,
                        name.hash,
                        arg_count as i32,
                        args.as_ptr(),
                    ) {
                        return false;
                    }
                }
                Opcode::Jmp => {
                    let target = decode!(reader.imm32());
                    decode!(reader.jump_to(target));
                }
                Opcode::JmpIfTrue => {
                    let cond = decode!(reader.tmpvar());
                    let target = decode!(reader.imm32());
                    if (*slot!(cond)).raw_int() != 0 {
                        decode!(reader.jump_to(target));
                    }
                }
                Opcode::JmpIfFalse => {
                    let cond = decode!(reader.tmpvar());
                    let target = decode!(reader.imm32());
                    if (*slot!(cond)).raw_int() == 0 {
                        decode!(reader.jump_to(target));
                    }
                }
                Opcode::JmpIfEq => {
                    let target = decode!(reader.imm32());
                    if eq_flag {
                        decode!(reader.jump_to(target));
                    }
                }
            }
        }
        true
    }
}
